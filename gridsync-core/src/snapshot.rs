//! Authoritative sheet state sent to clients.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{Axis, Cell, CellStyle, SheetId, SheetLayout};

/// One cell as carried in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotCell {
    pub row: u32,
    pub col: u32,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<CellStyle>,
}

/// Full `{dimensions, layout, cells}` state of one sheet.
///
/// `row_heights`/`col_widths` are either exactly `rows`/`cols` long or absent;
/// receivers fall back to their own default sizes when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetSnapshot {
    /// Resolved sheet; `None` when the grid has no sheet at all.
    pub id: Option<SheetId>,
    pub rows: u32,
    pub cols: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_heights: Option<Vec<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub col_widths: Option<Vec<u32>>,
    pub cells: Vec<SnapshotCell>,
}

impl SheetSnapshot {
    /// Default-sized, empty snapshot.
    pub fn empty(id: Option<SheetId>) -> Self {
        Self::assemble(id, None, Vec::new())
    }

    /// Build a snapshot from stored records.
    ///
    /// Missing layout → default dimensions. Size arrays whose length does not
    /// match the dimension are dropped. Cells from other sheets are ignored.
    pub fn assemble(id: Option<SheetId>, layout: Option<SheetLayout>, cells: Vec<Cell>) -> Self {
        let layout = layout.unwrap_or_default();

        let row_heights = layout.consistent_sizes(Axis::Row).map(<[u32]>::to_vec);
        let col_widths = layout.consistent_sizes(Axis::Col).map(<[u32]>::to_vec);
        if row_heights.is_none() && layout.row_heights.is_some() {
            log::debug!(
                "Dropping rowHeights for sheet {id:?}: {} entries for {} rows",
                layout.row_heights.as_ref().map_or(0, Vec::len),
                layout.rows
            );
        }
        if col_widths.is_none() && layout.col_widths.is_some() {
            log::debug!(
                "Dropping colWidths for sheet {id:?}: {} entries for {} cols",
                layout.col_widths.as_ref().map_or(0, Vec::len),
                layout.cols
            );
        }

        let mut cells: Vec<SnapshotCell> = cells
            .into_iter()
            .filter(|cell| Some(cell.sheet_id) == id)
            .map(|cell| SnapshotCell {
                row: cell.row,
                col: cell.col,
                value: cell.value,
                style: cell.style,
            })
            .collect();
        cells.sort_by_key(|c| (c.row, c.col));

        Self {
            id,
            rows: layout.rows,
            cols: layout.cols,
            row_heights,
            col_widths,
            cells,
        }
    }

    /// Cell value at `(row, col)`, if present.
    pub fn value_at(&self, row: u32, col: u32) -> Option<&Value> {
        self.cells
            .iter()
            .find(|c| c.row == row && c.col == col)
            .map(|c| &c.value)
    }
}
