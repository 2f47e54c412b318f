//! Row/column insertion and deletion over the positional cell matrix.
//!
//! Cells are keyed by `(row, col)` and the key is unique, so opening a gap
//! cannot be a single shift: moving row 3 to 5 would hit the cell still at
//! row 5. Inserts therefore run in two phases:
//!
//! ```text
//!   park:    idx >= p          →  idx + SHIFT            (disjoint from live rows)
//!   settle:  idx >= p + SHIFT  →  idx - (SHIFT - count)  (= original idx + count)
//! ```
//!
//! Deletes shift downward in ascending order and never collide.
//!
//! Every sequence for a `(grid, sheet)` runs under that sheet's mutex and ends
//! by pushing a fresh snapshot to the whole grid room instead of an
//! incremental operation. A caller that announces an edit before running it
//! takes the [`SheetLock`] first, so the check, the announcement and the
//! edit see the same sheet.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

use gridsync_core::{Axis, GridId, Placement, SheetId, StructuralEdit, MAX_INDEX};

use crate::broadcast::RoomManager;
use crate::protocol::ServerEvent;
use crate::snapshot::SnapshotBuilder;
use crate::storage::{CellStore, StoreError};

/// Offset used to park cells during an insert. Larger than any index
/// accepted from clients.
pub const SHIFT: i64 = 1_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructuralError {
    #[error("delete would leave the sheet without any {axis}")]
    WouldEmpty { axis: Axis },
    #[error("inserting {count} {axis}(s) would reach index {limit}")]
    OutOfRange { axis: Axis, count: u32, limit: u32 },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub type StructuralResult<T> = Result<T, StructuralError>;

/// What a structural edit did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructuralOutcome {
    Inserted {
        axis: Axis,
        /// First index of the opened gap
        pivot: u32,
        count: u32,
        moved: u64,
    },
    Deleted {
        axis: Axis,
        start: u32,
        end: u32,
        removed: u64,
        moved: u64,
    },
    /// Range lay entirely outside the sheet
    NoOp,
}

/// First index of the gap for an insert anchored at `at`, clamped to `[0, dimension]`.
pub fn pivot_index(at: u32, placement: Placement, dimension: u32) -> u32 {
    let pivot = match placement {
        Placement::Before => at,
        Placement::After => at.saturating_add(1),
    };
    pivot.min(dimension)
}

/// Inclusive `(start, end)` actually removed by deleting `count` lines at
/// `at`, or `None` when nothing lies inside the sheet.
pub fn plan_delete(dimension: u32, at: u32, count: u32) -> Option<(u32, u32)> {
    if dimension == 0 || count == 0 || at > dimension - 1 {
        return None;
    }
    let end = (dimension - 1).min(at.saturating_add(count - 1));
    Some((at, end))
}

/// Exclusive access to one sheet's structure.
///
/// Checks made while holding it stay true until the edit it guards has run.
pub struct SheetLock {
    grid_id: GridId,
    sheet_id: SheetId,
    _held: OwnedMutexGuard<()>,
}

impl SheetLock {
    pub fn grid_id(&self) -> GridId {
        self.grid_id
    }

    pub fn sheet_id(&self) -> SheetId {
        self.sheet_id
    }
}

pub struct StructuralMutator {
    cells: Arc<dyn CellStore>,
    snapshots: SnapshotBuilder,
    rooms: Arc<RoomManager>,
    guards: Mutex<HashMap<(GridId, SheetId), Arc<Mutex<()>>>>,
}

impl StructuralMutator {
    pub fn new(cells: Arc<dyn CellStore>, snapshots: SnapshotBuilder, rooms: Arc<RoomManager>) -> Self {
        Self {
            cells,
            snapshots,
            rooms,
            guards: Mutex::new(HashMap::new()),
        }
    }

    /// Wait for exclusive access to the structure of `(grid_id, sheet_id)`.
    pub async fn lock(&self, grid_id: GridId, sheet_id: SheetId) -> SheetLock {
        let guard = {
            let mut guards = self.guards.lock().await;
            guards.entry((grid_id, sheet_id)).or_default().clone()
        };
        SheetLock {
            grid_id,
            sheet_id,
            _held: guard.lock_owned().await,
        }
    }

    /// Refuse edits that would empty the sheet or push any index to
    /// [`MAX_INDEX`]. Parked cells stay below `MAX_INDEX + SHIFT` only while
    /// live indices stay below `MAX_INDEX`.
    pub async fn check(&self, held: &SheetLock, edit: StructuralEdit) -> StructuralResult<()> {
        let (grid_id, sheet_id) = (held.grid_id, held.sheet_id);
        let layout = self
            .cells
            .get_layout(grid_id, sheet_id)
            .await?
            .unwrap_or_default();

        match edit {
            StructuralEdit::Delete { axis, at, count } => {
                let dimension = layout.dimension(axis);
                if let Some((start, end)) = plan_delete(dimension, at, count) {
                    if end - start + 1 >= dimension {
                        log::warn!(
                            "Rejected delete of {axis}s {start}..={end} on sheet {sheet_id}: only {dimension} left"
                        );
                        return Err(StructuralError::WouldEmpty { axis });
                    }
                }
            }
            StructuralEdit::Insert { axis, count, .. } => {
                // Cells may sit past the layout's dimension
                let occupied = self
                    .cells
                    .list_cells(grid_id, sheet_id)
                    .await?
                    .iter()
                    .map(|cell| axis.index_of(cell.row, cell.col) + 1)
                    .max()
                    .unwrap_or(0);
                let reach = u64::from(layout.dimension(axis).max(occupied));
                if reach + u64::from(count) >= u64::from(MAX_INDEX) {
                    log::warn!(
                        "Rejected insert of {count} {axis}(s) on sheet {sheet_id}: {reach} already in use"
                    );
                    return Err(StructuralError::OutOfRange {
                        axis,
                        count,
                        limit: MAX_INDEX,
                    });
                }
            }
        }
        Ok(())
    }

    /// Lock, check and run `edit`.
    pub async fn apply(
        &self,
        grid_id: GridId,
        sheet_id: SheetId,
        edit: StructuralEdit,
    ) -> StructuralResult<StructuralOutcome> {
        let held = self.lock(grid_id, sheet_id).await;
        self.check(&held, edit).await?;
        self.apply_locked(&held, edit).await
    }

    /// Run `edit` under a lock the caller already holds and has checked.
    pub async fn apply_locked(
        &self,
        held: &SheetLock,
        edit: StructuralEdit,
    ) -> StructuralResult<StructuralOutcome> {
        let outcome = match edit {
            StructuralEdit::Insert {
                axis,
                at,
                placement,
                count,
            } => self.insert_locked(held, axis, at, placement, count).await?,
            StructuralEdit::Delete { axis, at, count } => {
                self.delete_locked(held, axis, at, count).await?
            }
        };
        Ok(outcome)
    }

    pub async fn insert_rows(
        &self,
        grid_id: GridId,
        sheet_id: SheetId,
        at: u32,
        placement: Placement,
        count: u32,
    ) -> StructuralResult<StructuralOutcome> {
        self.insert(grid_id, sheet_id, Axis::Row, at, placement, count).await
    }

    pub async fn delete_rows(
        &self,
        grid_id: GridId,
        sheet_id: SheetId,
        at: u32,
        count: u32,
    ) -> StructuralResult<StructuralOutcome> {
        self.delete(grid_id, sheet_id, Axis::Row, at, count).await
    }

    pub async fn insert_cols(
        &self,
        grid_id: GridId,
        sheet_id: SheetId,
        at: u32,
        placement: Placement,
        count: u32,
    ) -> StructuralResult<StructuralOutcome> {
        self.insert(grid_id, sheet_id, Axis::Col, at, placement, count).await
    }

    pub async fn delete_cols(
        &self,
        grid_id: GridId,
        sheet_id: SheetId,
        at: u32,
        count: u32,
    ) -> StructuralResult<StructuralOutcome> {
        self.delete(grid_id, sheet_id, Axis::Col, at, count).await
    }

    /// Open `count` lines at the pivot and push cells at or past it outward.
    pub async fn insert(
        &self,
        grid_id: GridId,
        sheet_id: SheetId,
        axis: Axis,
        at: u32,
        placement: Placement,
        count: u32,
    ) -> StructuralResult<StructuralOutcome> {
        let edit = StructuralEdit::Insert {
            axis,
            at,
            placement,
            count,
        };
        self.apply(grid_id, sheet_id, edit).await
    }

    /// Remove up to `count` lines at `at` and close the gap.
    pub async fn delete(
        &self,
        grid_id: GridId,
        sheet_id: SheetId,
        axis: Axis,
        at: u32,
        count: u32,
    ) -> StructuralResult<StructuralOutcome> {
        self.apply(grid_id, sheet_id, StructuralEdit::Delete { axis, at, count })
            .await
    }

    async fn insert_locked(
        &self,
        held: &SheetLock,
        axis: Axis,
        at: u32,
        placement: Placement,
        count: u32,
    ) -> Result<StructuralOutcome, StoreError> {
        let (grid_id, sheet_id) = (held.grid_id, held.sheet_id);
        let mut layout = self
            .cells
            .get_layout(grid_id, sheet_id)
            .await?
            .unwrap_or_default();
        let pivot = pivot_index(at, placement, layout.dimension(axis));

        let mut moved = 0;
        if count > 0 {
            self.cells.shift(grid_id, sheet_id, axis, pivot, SHIFT).await?;

            let parked_from = (i64::from(pivot) + SHIFT) as u32;
            let settle = -(SHIFT - i64::from(count));
            moved = match self
                .cells
                .shift(grid_id, sheet_id, axis, parked_from, settle)
                .await
            {
                Ok(moved) => moved,
                Err(e) => {
                    log::error!(
                        "Settling {axis} insert at {pivot} in sheet {sheet_id} failed: {e}; moving cells back"
                    );
                    if let Err(rollback) = self
                        .cells
                        .shift(grid_id, sheet_id, axis, parked_from, -SHIFT)
                        .await
                    {
                        log::error!("Rollback of {axis} insert in sheet {sheet_id} failed: {rollback}");
                    }
                    return Err(e);
                }
            };

            layout.insert_lines(axis, pivot, count);
            self.cells.put_layout(grid_id, sheet_id, layout).await?;
        }

        log::info!("Inserted {count} {axis}(s) at {pivot} in sheet {sheet_id}, moved {moved} cells");
        self.resync(grid_id, sheet_id).await?;

        Ok(StructuralOutcome::Inserted {
            axis,
            pivot,
            count,
            moved,
        })
    }

    async fn delete_locked(
        &self,
        held: &SheetLock,
        axis: Axis,
        at: u32,
        count: u32,
    ) -> Result<StructuralOutcome, StoreError> {
        let (grid_id, sheet_id) = (held.grid_id, held.sheet_id);
        let mut layout = self
            .cells
            .get_layout(grid_id, sheet_id)
            .await?
            .unwrap_or_default();
        let Some((start, end)) = plan_delete(layout.dimension(axis), at, count) else {
            log::debug!("Delete of {count} {axis}(s) at {at} in sheet {sheet_id} is outside the sheet");
            return Ok(StructuralOutcome::NoOp);
        };
        let deleted = end - start + 1;

        let removed = self
            .cells
            .delete_range(grid_id, sheet_id, axis, start, end)
            .await?;
        let moved = self
            .cells
            .shift(grid_id, sheet_id, axis, end + 1, -i64::from(deleted))
            .await?;

        layout.delete_lines(axis, start, deleted);
        self.cells.put_layout(grid_id, sheet_id, layout).await?;

        log::info!(
            "Deleted {axis}s {start}..={end} in sheet {sheet_id}: {removed} cells removed, {moved} moved"
        );
        self.resync(grid_id, sheet_id).await?;

        Ok(StructuralOutcome::Deleted {
            axis,
            start,
            end,
            removed,
            moved,
        })
    }

    /// Push the authoritative snapshot to every member of the grid room.
    async fn resync(&self, grid_id: GridId, sheet_id: SheetId) -> Result<(), StoreError> {
        let snapshot = self.snapshots.build(grid_id, Some(sheet_id)).await?;
        let reached = self
            .rooms
            .broadcast(&grid_id, ServerEvent::Snapshot(snapshot), None)
            .await;
        log::debug!("Resynced sheet {sheet_id} to {reached} sessions");
        Ok(())
    }
}
