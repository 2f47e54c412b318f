//! gridsync server: realtime sync core for spreadsheet grids.
//!
//! Configured through `GRIDSYNC_*` environment variables (see
//! [`ServerConfig::from_env`]); logging through `RUST_LOG` (default `info`).

use log::{error, info};

use gridsync_collab::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            std::process::exit(2);
        }
    };

    info!(
        "Starting gridsync on {} ({} storage)",
        config.bind_addr,
        config
            .storage_path
            .as_ref()
            .map_or_else(|| "in-memory".to_string(), |p| p.display().to_string())
    );

    let server = match SyncServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start: {e}");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server stopped: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }
}
