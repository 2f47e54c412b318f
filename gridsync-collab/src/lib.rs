//! # gridsync-collab: realtime sync core for spreadsheet grids
//!
//! Relays cell and layout operations between the clients viewing a grid,
//! persists them, rewrites cell positions on row/column insert and delete,
//! and arbitrates per-cell edit locks and focus presence.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ GridClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │   JSON {event,data} │ (central)   │
//! └─────────────┘                     └──────┬──────┘
//!                                            │ Session (&mut)
//!                                     ┌──────▼──────┐
//!                                     │ SyncGateway │
//!                                     └──────┬──────┘
//!        ┌──────────────┬────────────────────┼──────────────┬─────────────┐
//!        ▼              ▼                    ▼              ▼             ▼
//!  OperationRelay  StructuralMutator   SnapshotBuilder  LockManager  PresenceTracker
//!        │              │                    │              │             │
//!        └──────── CellStore ────────────────┘         EphemeralStore ────┘
//!                        │
//!                 RoomManager / BroadcastGroup (fan-out per grid)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire events
//! - [`broadcast`]: per-grid rooms with backpressure
//! - [`session`]: per-connection context
//! - [`gateway`]: inbound event routing
//! - [`relay`]: broadcast-then-persist for operations
//! - [`structure`]: two-phase row/column shifts
//! - [`lock`] / [`presence`]: TTL-based cell locks and focus sets
//! - [`storage`]: store traits, in-memory and RocksDB backends
//! - [`server`] / [`client`]: WebSocket transport

pub mod protocol;
pub mod broadcast;
pub mod session;
pub mod storage;
pub mod directory;
pub mod snapshot;
pub mod structure;
pub mod relay;
pub mod lock;
pub mod presence;
pub mod gateway;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{
    CellRef, ClientEvent, FocusRequest, JoinRequest, LockNotice, LockRequest, PresenceUpdate,
    ProtocolError, ServerEvent,
};
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomFrame, RoomManager};
pub use session::{Location, Session, SessionId};
pub use storage::{
    CellStore, EphemeralStore, MemoryCellStore, MemoryEphemeralStore, RocksCellStore,
    StoreConfig, StoreError, StoreResult,
};
pub use directory::UserDirectory;
pub use snapshot::SnapshotBuilder;
pub use structure::{SheetLock, StructuralError, StructuralMutator, StructuralOutcome, SHIFT};
pub use relay::{Applied, OperationRelay, RelayError};
pub use lock::{AcquireOutcome, LockManager, LockRecord, DEFAULT_LOCK_TTL};
pub use presence::{color_for, PresenceTracker, DEFAULT_PRESENCE_TTL};
pub use gateway::{GatewayConfig, SyncGateway};
pub use server::{ConfigError, ServerConfig, ServerError, ServerStats, SyncServer};
pub use client::GridClient;
