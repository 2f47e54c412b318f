//! Storage seams used by the sync core.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐   cells / layout   ┌──────────────────────────────┐
//! │ Relay        │ ─────────────────► │ CellStore                    │
//! │ Mutator      │                    │  ├── MemoryCellStore         │
//! │ Snapshots    │                    │  └── RocksCellStore (RocksDB)│
//! └──────┬───────┘                    └──────────────────────────────┘
//!        │ locks / presence           ┌──────────────────────────────┐
//!        └──────────────────────────► │ EphemeralStore (TTL keys)    │
//!                                     │  └── MemoryEphemeralStore    │
//!                                     └──────────────────────────────┘
//! ```
//!
//! Every store call returns a [`StoreResult`]; each call site decides whether
//! to propagate, degrade, or log.

pub mod cells;
pub mod ephemeral;
pub mod rocks;

use gridsync_core::Axis;
use std::collections::BTreeSet;
use thiserror::Error;

pub use cells::{CellStore, MemoryCellStore};
pub use ephemeral::{EphemeralStore, MemoryEphemeralStore};
pub use rocks::{RocksCellStore, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Backend unreachable or shut down
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A positional re-key hit an occupied `(row, col)` key
    #[error("unique key conflict moving {axis} {from} to {to}")]
    Conflict { axis: Axis, from: u32, to: u32 },
    /// A shift would move an index below zero or past `u32::MAX`
    #[error("{axis} index {index} cannot be shifted by {delta}")]
    IndexOutOfRange { axis: Axis, index: u32, delta: i64 },
    /// Set operation on a plain key or vice versa
    #[error("wrong value type at key {0}")]
    WrongType(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("database error: {0}")]
    Database(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One `(row, col)` re-key produced by [`plan_shift`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Move {
    pub from: (u32, u32),
    pub to: (u32, u32),
}

/// Plan `UPDATE … SET idx = idx + delta WHERE idx >= from` over a set of
/// occupied `(row, col)` positions.
///
/// Positions are re-keyed one at a time in ascending index order, the way a
/// row-at-a-time update walks a unique index. A move whose target is occupied
/// at that moment fails with [`StoreError::Conflict`] and nothing is applied.
pub fn plan_shift(
    occupied: impl IntoIterator<Item = (u32, u32)>,
    axis: Axis,
    from: u32,
    delta: i64,
) -> StoreResult<Vec<Move>> {
    let mut occupied: BTreeSet<(u32, u32)> = occupied.into_iter().collect();

    let mut movers: Vec<(u32, u32)> = occupied
        .iter()
        .copied()
        .filter(|&(row, col)| axis.index_of(row, col) >= from)
        .collect();
    movers.sort_by_key(|&(row, col)| match axis {
        Axis::Row => (row, col),
        Axis::Col => (col, row),
    });

    let mut moves = Vec::with_capacity(movers.len());
    if delta == 0 {
        return Ok(moves);
    }

    for (row, col) in movers {
        let index = axis.index_of(row, col);
        let shifted = i64::from(index) + delta;
        let target = u32::try_from(shifted).map_err(|_| StoreError::IndexOutOfRange {
            axis,
            index,
            delta,
        })?;
        let to = axis.with_index(row, col, target);
        if occupied.contains(&to) {
            return Err(StoreError::Conflict {
                axis,
                from: index,
                to: target,
            });
        }
        occupied.remove(&(row, col));
        occupied.insert(to);
        moves.push(Move {
            from: (row, col),
            to,
        });
    }

    Ok(moves)
}
