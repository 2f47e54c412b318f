//! Entry point for every inbound client event.
//!
//! The gateway owns the shared services (rooms, relay, locks, presence) and
//! routes a decoded [`ClientEvent`] for one [`Session`] to the right one.
//! Transport code only decodes frames and calls [`SyncGateway::handle`].

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use gridsync_core::{CellKey, GridId, SheetId, SheetRecord, SheetSnapshot};

use crate::broadcast::RoomManager;
use crate::directory::UserDirectory;
use crate::lock::{LockManager, DEFAULT_LOCK_TTL};
use crate::presence::{PresenceTracker, DEFAULT_PRESENCE_TTL};
use crate::protocol::{ClientEvent, LockRequest, ServerEvent};
use crate::relay::OperationRelay;
use crate::session::{Location, Session};
use crate::snapshot::SnapshotBuilder;
use crate::storage::{CellStore, EphemeralStore, StoreResult};
use crate::structure::StructuralMutator;

/// Name given to the sheet created for grids that have none.
pub const DEFAULT_SHEET_NAME: &str = "Sheet1";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Per-room broadcast channel capacity
    pub broadcast_capacity: usize,
    pub lock_ttl: Duration,
    pub presence_ttl: Duration,
    /// Create a first sheet when a joined grid has none
    pub provision_sheets: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            lock_ttl: DEFAULT_LOCK_TTL,
            presence_ttl: DEFAULT_PRESENCE_TTL,
            provision_sheets: false,
        }
    }
}

pub struct SyncGateway {
    cells: Arc<dyn CellStore>,
    ephemeral: Arc<dyn EphemeralStore>,
    rooms: Arc<RoomManager>,
    snapshots: SnapshotBuilder,
    relay: OperationRelay,
    locks: LockManager,
    presence: PresenceTracker,
    config: GatewayConfig,
    provisioning: Mutex<()>,
}

impl SyncGateway {
    pub fn new(
        cells: Arc<dyn CellStore>,
        ephemeral: Arc<dyn EphemeralStore>,
        config: GatewayConfig,
    ) -> Self {
        let rooms = Arc::new(RoomManager::new(config.broadcast_capacity));
        let snapshots = SnapshotBuilder::new(cells.clone());
        let directory = UserDirectory::new(ephemeral.clone());
        let mutator = Arc::new(StructuralMutator::new(
            cells.clone(),
            snapshots.clone(),
            rooms.clone(),
        ));

        Self {
            relay: OperationRelay::new(cells.clone(), rooms.clone(), snapshots.clone(), mutator),
            locks: LockManager::new(
                ephemeral.clone(),
                directory.clone(),
                rooms.clone(),
                config.lock_ttl,
            ),
            presence: PresenceTracker::new(
                ephemeral.clone(),
                directory,
                rooms.clone(),
                config.presence_ttl,
            ),
            cells,
            ephemeral,
            rooms,
            snapshots,
            config,
            provisioning: Mutex::new(()),
        }
    }

    pub fn cells(&self) -> &Arc<dyn CellStore> {
        &self.cells
    }

    pub fn ephemeral(&self) -> &Arc<dyn EphemeralStore> {
        &self.ephemeral
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    pub fn snapshots(&self) -> &SnapshotBuilder {
        &self.snapshots
    }

    pub fn relay(&self) -> &OperationRelay {
        &self.relay
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Route one inbound event. Failures are logged, never returned to the client.
    pub async fn handle(&self, session: &mut Session, event: ClientEvent) {
        log::debug!("Session {} sent {}", session.id(), event.name());

        match event {
            ClientEvent::Join(req) => self.join(session, req.grid_id, req.sheet_id).await,

            ClientEvent::Operation(mut op) => {
                if !self.joined(session, op.grid_id, "grid:operation") {
                    return;
                }
                op.actor_id = session.actor_id();
                if let Err(e) = self.relay.apply(Some(session.id()), op).await {
                    log::warn!("Dropped operation from session {}: {e}", session.id());
                }
            }

            ClientEvent::Focus(req) => {
                if !self.joined(session, req.grid_id, "cell:focus") {
                    return;
                }
                session.set_color(req.color.clone());
                let key = req.cell().cell_key();
                if let Some(previous) = session.set_focus(Some(key)) {
                    if previous != key {
                        if let Err(e) = self
                            .presence
                            .blur(req.grid_id, previous, session.user_id())
                            .await
                        {
                            log::warn!("Presence blur of {previous} failed: {e}");
                        }
                    }
                }
                if let Err(e) = self
                    .presence
                    .focus(req.grid_id, key, &session.user_entry())
                    .await
                {
                    log::warn!("Presence focus of {key} failed: {e}");
                }
            }

            ClientEvent::Blur(cell) => {
                if !self.joined(session, cell.grid_id, "cell:blur") {
                    return;
                }
                let key = cell.cell_key();
                if session.focus() == Some(key) {
                    session.set_focus(None);
                }
                if let Err(e) = self.presence.blur(cell.grid_id, key, session.user_id()).await {
                    log::warn!("Presence blur of {key} failed: {e}");
                }
            }

            ClientEvent::LockAcquire(LockRequest {
                grid_id,
                sheet_id,
                row,
                col,
                token,
            }) => {
                if !self.joined(session, grid_id, "cell:lock:acquire") {
                    return;
                }
                let key = CellKey::new(sheet_id, row, col);
                self.locks.acquire(session, grid_id, key, token).await;
            }

            ClientEvent::LockRenew(req) => {
                if !self.joined(session, req.grid_id, "cell:lock:renew") {
                    return;
                }
                let key = req.cell().cell_key();
                if !self.locks.renew(session, req.grid_id, key, req.token).await {
                    log::debug!("Lock renew for {key} ignored");
                }
            }

            ClientEvent::LockRelease(req) => {
                if !self.joined(session, req.grid_id, "cell:lock:release") {
                    return;
                }
                let key = req.cell().cell_key();
                self.locks.release(session, req.grid_id, key, req.token).await;
            }
        }
    }

    /// Join `grid_id` and push a snapshot of the resolved sheet to `session`.
    ///
    /// Joining another sheet of the current grid keeps room membership.
    /// Joining a different grid leaves the previous room first.
    pub async fn join(&self, session: &mut Session, grid_id: GridId, sheet_id: Option<SheetId>) {
        if let Some(current) = session.grid_id() {
            if current != grid_id {
                self.leave(session).await;
            }
        }

        if !session.is_in(grid_id) {
            let room = self.rooms.get_or_create(grid_id).await;
            let rx = room.add_peer(session.id(), session.user_entry()).await;
            session.subscribe(rx);
            log::info!(
                "Session {} joined grid {grid_id} ({} peer(s))",
                session.id(),
                room.peer_count().await
            );
        }

        if self.config.provision_sheets {
            if let Err(e) = self.provision(grid_id).await {
                log::warn!("Could not provision a sheet for grid {grid_id}: {e}");
            }
        }

        let snapshot = match self.snapshots.build(grid_id, sheet_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::error!("Snapshot for grid {grid_id} failed: {e}");
                SheetSnapshot::empty(None)
            }
        };
        session.set_location(Some(Location {
            grid_id,
            sheet_id: snapshot.id,
        }));
        session.send(ServerEvent::Snapshot(snapshot));
    }

    /// Leave the current room, blurring the focused cell first.
    pub async fn leave(&self, session: &mut Session) {
        let Some(location) = session.location() else {
            return;
        };
        let grid_id = location.grid_id;

        if let Some(focus) = session.set_focus(None) {
            if let Err(e) = self.presence.blur(grid_id, focus, session.user_id()).await {
                log::debug!("Presence blur on leave failed: {e}");
            }
        }

        if let Some(room) = self.rooms.get(&grid_id).await {
            room.remove_peer(&session.id()).await;
        }
        session.unsubscribe();
        session.set_location(None);

        if self.rooms.remove_if_empty(&grid_id).await {
            log::info!("Room for grid {grid_id} closed");
        }
        log::info!("Session {} left grid {grid_id}", session.id());
    }

    async fn provision(&self, grid_id: GridId) -> StoreResult<()> {
        let _held = self.provisioning.lock().await;
        if self.cells.list_sheets(grid_id).await?.is_empty() {
            let sheet = SheetRecord::new(grid_id, DEFAULT_SHEET_NAME);
            log::info!("Provisioned sheet {} for grid {grid_id}", sheet.id);
            self.cells.put_sheet(sheet).await?;
        }
        Ok(())
    }

    fn joined(&self, session: &Session, grid_id: GridId, event: &str) -> bool {
        if session.is_in(grid_id) {
            return true;
        }
        log::warn!(
            "Dropping {event} from session {} for grid {grid_id} it has not joined",
            session.id()
        );
        false
    }
}
