//! # gridsync-core: Shared data model for collaborative grids
//!
//! Types that both the sync core and its clients agree on:
//!
//! - [`model`]: ids, [`CellKey`], cells, sheet layouts and their merge patches
//! - [`operation`]: the closed [`Operation`] union relayed between sessions
//! - [`snapshot`]: the authoritative [`SheetSnapshot`] pushed on join and resync
//!
//! Every index is a dense, zero-based `u32`. Anything coming off the wire is
//! bounded by [`MAX_INDEX`] so that positional re-keying can park cells at an
//! offset no real index will ever reach.

pub mod model;
pub mod operation;
pub mod snapshot;

pub use model::{
    Axis, Cell, CellKey, CellKeyError, CellPatch, CellStyle, GridId, GridRecord, Identity,
    LayoutPatch, SheetId, SheetLayout, SheetRecord, UserEntry, UserId,
};
pub use operation::{
    CellStyleChange, CellUpdate, DeleteLines, InsertLines, Operation, OperationError,
    OperationKind, Placement, StructuralEdit,
};
pub use snapshot::{SheetSnapshot, SnapshotCell};

/// Row count of a sheet that has no stored layout yet.
pub const DEFAULT_ROWS: u32 = 100;
/// Column count of a sheet that has no stored layout yet.
pub const DEFAULT_COLS: u32 = 26;
/// Height given to rows inserted into a sized layout.
pub const DEFAULT_ROW_HEIGHT: u32 = 24;
/// Width given to columns inserted into a sized layout.
pub const DEFAULT_COL_WIDTH: u32 = 100;

/// Upper bound (exclusive) for any row/column index or dimension accepted
/// from a client.
pub const MAX_INDEX: u32 = 500_000;

/// Most rows/columns a single structural operation may insert or delete.
pub const MAX_LINES_PER_OP: u32 = 1_000;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
