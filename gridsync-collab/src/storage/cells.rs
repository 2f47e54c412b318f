//! Durable cell/layout store seam and its in-memory implementation.
//!
//! Content rows are keyed by `(grid, sheet, row, col)`, which is unique. All
//! positional re-keying goes through [`CellStore::shift`], which behaves like
//! a row-at-a-time `UPDATE` against that unique key: see
//! [`plan_shift`](super::plan_shift).

use async_trait::async_trait;
use gridsync_core::{
    Axis, Cell, CellPatch, GridId, GridRecord, LayoutPatch, SheetId, SheetLayout, SheetRecord,
    UserId,
};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use super::{plan_shift, StoreResult};

/// Persistent grid content.
#[async_trait]
pub trait CellStore: Send + Sync {
    /// Sheets of a grid, oldest first.
    async fn list_sheets(&self, grid: GridId) -> StoreResult<Vec<SheetRecord>>;

    async fn put_sheet(&self, sheet: SheetRecord) -> StoreResult<()>;

    async fn get_grid(&self, grid: GridId) -> StoreResult<Option<GridRecord>>;

    /// Stamp `last_modified`/`last_editor` on the grid row, creating it if needed.
    async fn touch_grid(&self, grid: GridId, editor: Option<UserId>, at: u64) -> StoreResult<()>;

    async fn get_layout(&self, grid: GridId, sheet: SheetId) -> StoreResult<Option<SheetLayout>>;

    /// COALESCE-merge `patch` into the stored layout. A missing layout starts
    /// from the default dimensions.
    async fn upsert_layout(
        &self,
        grid: GridId,
        sheet: SheetId,
        patch: &LayoutPatch,
    ) -> StoreResult<SheetLayout>;

    /// Replace the stored layout.
    async fn put_layout(&self, grid: GridId, sheet: SheetId, layout: SheetLayout)
        -> StoreResult<()>;

    async fn get_cell(
        &self,
        grid: GridId,
        sheet: SheetId,
        row: u32,
        col: u32,
    ) -> StoreResult<Option<Cell>>;

    /// All cells of a sheet in `(row, col)` order.
    async fn list_cells(&self, grid: GridId, sheet: SheetId) -> StoreResult<Vec<Cell>>;

    async fn upsert_cell(
        &self,
        grid: GridId,
        sheet: SheetId,
        row: u32,
        col: u32,
        patch: &CellPatch,
    ) -> StoreResult<Cell>;

    /// Delete cells whose `axis` index lies in `start..=end`. Returns the count.
    async fn delete_range(
        &self,
        grid: GridId,
        sheet: SheetId,
        axis: Axis,
        start: u32,
        end: u32,
    ) -> StoreResult<u64>;

    /// Add `delta` to the `axis` index of every cell whose index is `>= from`.
    ///
    /// Either every affected cell moves or none does. Returns the count moved.
    async fn shift(
        &self,
        grid: GridId,
        sheet: SheetId,
        axis: Axis,
        from: u32,
        delta: i64,
    ) -> StoreResult<u64>;
}

type SheetCells = BTreeMap<(u32, u32), Cell>;

#[derive(Default)]
struct MemoryState {
    grids: HashMap<GridId, GridRecord>,
    sheets: HashMap<GridId, Vec<SheetRecord>>,
    layouts: HashMap<(GridId, SheetId), SheetLayout>,
    cells: HashMap<(GridId, SheetId), SheetCells>,
}

/// In-process [`CellStore`] for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryCellStore {
    state: RwLock<MemoryState>,
}

impl MemoryCellStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored cells across all grids.
    pub async fn cell_count(&self) -> usize {
        self.state.read().await.cells.values().map(BTreeMap::len).sum()
    }
}

#[async_trait]
impl CellStore for MemoryCellStore {
    async fn list_sheets(&self, grid: GridId) -> StoreResult<Vec<SheetRecord>> {
        let state = self.state.read().await;
        let mut sheets = state.sheets.get(&grid).cloned().unwrap_or_default();
        sheets.sort_by_key(SheetRecord::creation_order);
        Ok(sheets)
    }

    async fn put_sheet(&self, sheet: SheetRecord) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let sheets = state.sheets.entry(sheet.grid_id).or_default();
        match sheets.iter_mut().find(|s| s.id == sheet.id) {
            Some(existing) => *existing = sheet,
            None => sheets.push(sheet),
        }
        Ok(())
    }

    async fn get_grid(&self, grid: GridId) -> StoreResult<Option<GridRecord>> {
        Ok(self.state.read().await.grids.get(&grid).cloned())
    }

    async fn touch_grid(&self, grid: GridId, editor: Option<UserId>, at: u64) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let record = state
            .grids
            .entry(grid)
            .or_insert_with(|| GridRecord::new(grid));
        record.last_modified = Some(at);
        record.last_editor = editor;
        Ok(())
    }

    async fn get_layout(&self, grid: GridId, sheet: SheetId) -> StoreResult<Option<SheetLayout>> {
        Ok(self.state.read().await.layouts.get(&(grid, sheet)).cloned())
    }

    async fn upsert_layout(
        &self,
        grid: GridId,
        sheet: SheetId,
        patch: &LayoutPatch,
    ) -> StoreResult<SheetLayout> {
        let mut state = self.state.write().await;
        let layout = state.layouts.entry((grid, sheet)).or_default();
        patch.apply_to(layout);
        Ok(layout.clone())
    }

    async fn put_layout(
        &self,
        grid: GridId,
        sheet: SheetId,
        layout: SheetLayout,
    ) -> StoreResult<()> {
        self.state.write().await.layouts.insert((grid, sheet), layout);
        Ok(())
    }

    async fn get_cell(
        &self,
        grid: GridId,
        sheet: SheetId,
        row: u32,
        col: u32,
    ) -> StoreResult<Option<Cell>> {
        let state = self.state.read().await;
        Ok(state
            .cells
            .get(&(grid, sheet))
            .and_then(|cells| cells.get(&(row, col)))
            .cloned())
    }

    async fn list_cells(&self, grid: GridId, sheet: SheetId) -> StoreResult<Vec<Cell>> {
        let state = self.state.read().await;
        Ok(state
            .cells
            .get(&(grid, sheet))
            .map(|cells| cells.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn upsert_cell(
        &self,
        grid: GridId,
        sheet: SheetId,
        row: u32,
        col: u32,
        patch: &CellPatch,
    ) -> StoreResult<Cell> {
        let mut state = self.state.write().await;
        let cells = state.cells.entry((grid, sheet)).or_default();
        let cell = patch.apply(cells.remove(&(row, col)), grid, sheet, row, col);
        cells.insert((row, col), cell.clone());
        Ok(cell)
    }

    async fn delete_range(
        &self,
        grid: GridId,
        sheet: SheetId,
        axis: Axis,
        start: u32,
        end: u32,
    ) -> StoreResult<u64> {
        let mut state = self.state.write().await;
        let Some(cells) = state.cells.get_mut(&(grid, sheet)) else {
            return Ok(0);
        };
        let before = cells.len();
        cells.retain(|&(row, col), _| {
            let index = axis.index_of(row, col);
            index < start || index > end
        });
        Ok((before - cells.len()) as u64)
    }

    async fn shift(
        &self,
        grid: GridId,
        sheet: SheetId,
        axis: Axis,
        from: u32,
        delta: i64,
    ) -> StoreResult<u64> {
        let mut state = self.state.write().await;
        let Some(cells) = state.cells.get_mut(&(grid, sheet)) else {
            return Ok(0);
        };

        let moves = plan_shift(cells.keys().copied(), axis, from, delta)?;

        let mut moved = Vec::with_capacity(moves.len());
        for m in &moves {
            if let Some(cell) = cells.remove(&m.from) {
                moved.push((m.to, cell));
            }
        }
        for ((row, col), mut cell) in moved {
            cell.row = row;
            cell.col = col;
            cells.insert((row, col), cell);
        }

        Ok(moves.len() as u64)
    }
}
