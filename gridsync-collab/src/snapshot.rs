//! Builds authoritative sheet snapshots from the cell store.

use std::sync::Arc;

use gridsync_core::{GridId, SheetId, SheetSnapshot};

use crate::storage::{CellStore, StoreResult};

#[derive(Clone)]
pub struct SnapshotBuilder {
    cells: Arc<dyn CellStore>,
}

impl SnapshotBuilder {
    pub fn new(cells: Arc<dyn CellStore>) -> Self {
        Self { cells }
    }

    /// `requested` if it is a live sheet of the grid, else the grid's first
    /// sheet by creation order, else `None`.
    pub async fn resolve_sheet(
        &self,
        grid_id: GridId,
        requested: Option<SheetId>,
    ) -> StoreResult<Option<SheetId>> {
        let sheets = self.cells.list_sheets(grid_id).await?;
        if let Some(id) = requested {
            if sheets.iter().any(|s| s.id == id) {
                return Ok(Some(id));
            }
            log::debug!("Sheet {id} is not live in grid {grid_id}, falling back to first sheet");
        }
        Ok(sheets.first().map(|s| s.id))
    }

    /// Snapshot of the resolved sheet. Never mutates the store.
    pub async fn build(
        &self,
        grid_id: GridId,
        requested: Option<SheetId>,
    ) -> StoreResult<SheetSnapshot> {
        let Some(sheet_id) = self.resolve_sheet(grid_id, requested).await? else {
            return Ok(SheetSnapshot::empty(None));
        };

        let layout = self.cells.get_layout(grid_id, sheet_id).await?;
        let cells = self.cells.list_cells(grid_id, sheet_id).await?;
        Ok(SheetSnapshot::assemble(Some(sheet_id), layout, cells))
    }
}
