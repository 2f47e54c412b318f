//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! Client A ──┐  upgrade (x-user-id, x-user-name)
//!            ├── Session ── SyncGateway ──┬── OperationRelay ── CellStore (RocksDB | memory)
//! Client B ──┘     ▲                      ├── LockManager  ─┐
//!                  │                      ├── PresenceTracker ─┴── EphemeralStore (TTL)
//!                  │                      └── RoomManager (grid_id → BroadcastGroup)
//!                  └──────── next_event() ◄────────┘
//! ```
//!
//! One task per connection processes inbound frames in order and forwards
//! everything the session receives (direct sends and room traffic) back out.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use gridsync_core::Identity;

use crate::gateway::{GatewayConfig, SyncGateway};
use crate::lock::DEFAULT_LOCK_TTL;
use crate::presence::DEFAULT_PRESENCE_TTL;
use crate::protocol::{ClientEvent, ProtocolError};
use crate::session::Session;
use crate::storage::{
    CellStore, EphemeralStore, MemoryCellStore, MemoryEphemeralStore, RocksCellStore,
    StoreConfig, StoreError,
};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_NAME_HEADER: &str = "x-user-name";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// RocksDB directory (None = in-memory cell store)
    pub storage_path: Option<PathBuf>,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    pub lock_ttl: Duration,
    pub presence_ttl: Duration,
    /// How often expired ephemeral keys are swept
    pub sweep_interval: Duration,
    /// Create `Sheet1` for joined grids without sheets
    pub provision_sheets: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            storage_path: None,
            broadcast_capacity: 256,
            lock_ttl: DEFAULT_LOCK_TTL,
            presence_ttl: DEFAULT_PRESENCE_TTL,
            sweep_interval: Duration::from_secs(30),
            provision_sheets: false,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `GRIDSYNC_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(addr) = lookup("GRIDSYNC_BIND") {
            config.bind_addr = addr;
        }
        if let Some(dir) = lookup("GRIDSYNC_DATA_DIR") {
            config.storage_path = (!dir.is_empty()).then(|| PathBuf::from(dir));
        }
        if let Some(raw) = lookup("GRIDSYNC_BROADCAST_CAPACITY") {
            config.broadcast_capacity = parse("GRIDSYNC_BROADCAST_CAPACITY", &raw)?;
            if config.broadcast_capacity == 0 {
                return Err(invalid("GRIDSYNC_BROADCAST_CAPACITY", &raw, "must be positive"));
            }
        }
        if let Some(raw) = lookup("GRIDSYNC_LOCK_TTL_MS") {
            config.lock_ttl = parse_millis("GRIDSYNC_LOCK_TTL_MS", &raw)?;
        }
        if let Some(raw) = lookup("GRIDSYNC_PRESENCE_TTL_MS") {
            config.presence_ttl = parse_millis("GRIDSYNC_PRESENCE_TTL_MS", &raw)?;
        }
        if let Some(raw) = lookup("GRIDSYNC_SWEEP_INTERVAL_MS") {
            config.sweep_interval = parse_millis("GRIDSYNC_SWEEP_INTERVAL_MS", &raw)?;
        }
        if let Some(raw) = lookup("GRIDSYNC_PROVISION_SHEETS") {
            config.provision_sheets = match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => return Err(invalid("GRIDSYNC_PROVISION_SHEETS", &raw, "expected a boolean")),
            };
        }

        Ok(config)
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            broadcast_capacity: self.broadcast_capacity,
            lock_ttl: self.lock_ttl,
            presence_ttl: self.presence_ttl,
            provision_sheets: self.provision_sheets,
        }
    }
}

fn invalid(var: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse<T: std::str::FromStr>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| invalid(var, raw, e.to_string()))
}

fn parse_millis(var: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    let millis: u64 = parse(var, raw)?;
    if millis == 0 {
        return Err(invalid(var, raw, "must be positive"));
    }
    Ok(Duration::from_millis(millis))
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejected_messages: u64,
    pub active_rooms: usize,
}

/// Turn the proxy's identity headers into a session identity.
///
/// A missing or malformed `x-user-id` yields an anonymous session.
pub fn identity_from_request(req: &Request) -> Option<Identity> {
    let headers = req.headers();
    let raw_id = headers.get(USER_ID_HEADER)?.to_str().ok()?;
    let id = match Uuid::parse_str(raw_id.trim()) {
        Ok(id) => id,
        Err(_) => {
            log::warn!("Ignoring malformed {USER_ID_HEADER} header {raw_id:?}");
            return None;
        }
    };
    let display_name = headers
        .get(USER_NAME_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("User-{}", &id.to_string()[..8]));

    Some(Identity { id, display_name })
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    gateway: Arc<SyncGateway>,
    stats: Arc<RwLock<ServerStats>>,
    /// Set when the server owns the in-memory ephemeral store and must sweep it
    sweepable: Option<Arc<MemoryEphemeralStore>>,
}

impl SyncServer {
    /// Create a server, opening RocksDB when `storage_path` is set.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let cells: Arc<dyn CellStore> = match &config.storage_path {
            Some(path) => Arc::new(RocksCellStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?),
            None => Arc::new(MemoryCellStore::new()),
        };
        let ephemeral = Arc::new(MemoryEphemeralStore::new());

        let mut server = Self::with_stores(config, cells, ephemeral.clone());
        server.sweepable = Some(ephemeral);
        Ok(server)
    }

    /// Create a server over caller-provided stores.
    pub fn with_stores(
        config: ServerConfig,
        cells: Arc<dyn CellStore>,
        ephemeral: Arc<dyn EphemeralStore>,
    ) -> Self {
        let gateway = Arc::new(SyncGateway::new(cells, ephemeral, config.gateway_config()));
        Self {
            config,
            gateway,
            stats: Arc::new(RwLock::new(ServerStats::default())),
            sweepable: None,
        }
    }

    /// In-memory server with default configuration.
    pub fn with_defaults() -> Self {
        let ephemeral = Arc::new(MemoryEphemeralStore::new());
        let mut server = Self::with_stores(
            ServerConfig::default(),
            Arc::new(MemoryCellStore::new()),
            ephemeral.clone(),
        );
        server.sweepable = Some(ephemeral);
        server
    }

    pub fn gateway(&self) -> &Arc<SyncGateway> {
        &self.gateway
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.gateway.rooms().room_count().await;
        stats
    }

    /// Bind `bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let _sweeper = self.sweepable.clone().map(|store| {
            SweeperGuard(store.spawn_sweeper(self.config.sweep_interval))
        });

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let gateway = self.gateway.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, gateway, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Upgrade one TCP connection and run its session to completion.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        gateway: Arc<SyncGateway>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), ServerError> {
        let mut identity = None;
        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
                identity = identity_from_request(req);
                Ok(response)
            },
        )
        .await?;

        let mut session = Session::new(identity);
        log::info!(
            "WebSocket connection established from {addr} as {} (session {})",
            session.display_name(),
            session.id()
        );

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = Self::pump(ws_stream, addr, &gateway, &mut session, &stats).await;

        // Always leave, whatever ended the connection
        gateway.leave(&mut session).await;
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        log::info!("Connection closed from {addr}");

        result
    }

    async fn pump(
        ws_stream: WebSocketStream<TcpStream>,
        addr: SocketAddr,
        gateway: &SyncGateway,
        session: &mut Session,
        stats: &RwLock<ServerStats>,
    ) -> Result<(), ServerError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            let event = ClientEvent::decode(text.as_str());
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += text.len() as u64;
                                if event.is_err() {
                                    s.rejected_messages += 1;
                                }
                            }
                            match event {
                                Ok(event) => gateway.handle(session, event).await,
                                Err(e) => log::warn!("Failed to decode message from {addr}: {e}"),
                            }
                        }

                        Some(Ok(Message::Binary(_))) => {
                            log::warn!("Ignoring binary frame from {addr}");
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Ok(Message::Close(_))) | None => return Ok(()),

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            return Ok(());
                        }

                        _ => {}
                    }
                }

                // Outgoing: direct sends and room traffic
                event = session.next_event() => {
                    let text = event.encode()?;
                    ws_sender.send(Message::Text(text.into())).await?;
                }
            }
        }
    }
}

/// Stops the sweeper when the serve loop ends.
struct SweeperGuard(tokio::task::JoinHandle<()>);

impl Drop for SweeperGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    fn request(headers: &[(&str, &str)]) -> Request {
        let mut builder = Request::builder().uri("ws://localhost/");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.lock_ttl, Duration::from_millis(5000));
        assert_eq!(config.presence_ttl, Duration::from_millis(7000));
        assert!(config.storage_path.is_none());
        assert!(!config.provision_sheets);
    }

    #[test]
    fn test_config_from_env_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("GRIDSYNC_BIND", "0.0.0.0:8080"),
            ("GRIDSYNC_DATA_DIR", "/var/lib/gridsync"),
            ("GRIDSYNC_LOCK_TTL_MS", "2500"),
            ("GRIDSYNC_PROVISION_SHEETS", "yes"),
        ]))
        .unwrap();

        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.storage_path, Some(PathBuf::from("/var/lib/gridsync")));
        assert_eq!(config.lock_ttl, Duration::from_millis(2500));
        assert_eq!(config.presence_ttl, DEFAULT_PRESENCE_TTL);
        assert!(config.provision_sheets);
        assert_eq!(config.gateway_config().lock_ttl, Duration::from_millis(2500));
    }

    #[test]
    fn test_config_rejects_bad_values() {
        let err = ServerConfig::from_lookup(lookup(&[("GRIDSYNC_LOCK_TTL_MS", "soon")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                var: "GRIDSYNC_LOCK_TTL_MS",
                ..
            }
        ));
        assert!(ServerConfig::from_lookup(lookup(&[("GRIDSYNC_BROADCAST_CAPACITY", "0")])).is_err());
        assert!(ServerConfig::from_lookup(lookup(&[("GRIDSYNC_PROVISION_SHEETS", "maybe")])).is_err());
    }

    #[test]
    fn test_identity_from_headers() {
        let id = Uuid::new_v4();
        let identity =
            identity_from_request(&request(&[("x-user-id", &id.to_string()), ("x-user-name", "Ada")]))
                .unwrap();
        assert_eq!(identity.id, id);
        assert_eq!(identity.display_name, "Ada");

        let unnamed = identity_from_request(&request(&[("x-user-id", &id.to_string())])).unwrap();
        assert!(unnamed.display_name.starts_with("User-"));

        assert!(identity_from_request(&request(&[])).is_none());
        assert!(identity_from_request(&request(&[("x-user-id", "not-a-uuid")])).is_none());
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.active_rooms, 0);
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let server = SyncServer::new(ServerConfig {
            storage_path: Some(dir.path().join("db")),
            ..ServerConfig::default()
        })
        .unwrap();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
        assert!(dir.path().join("db").exists());
    }
}
