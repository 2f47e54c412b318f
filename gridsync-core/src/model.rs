//! Grid, sheet, cell and layout records.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use crate::{DEFAULT_COLS, DEFAULT_COL_WIDTH, DEFAULT_ROWS, DEFAULT_ROW_HEIGHT};

pub type GridId = Uuid;
pub type SheetId = Uuid;
pub type UserId = Uuid;

/// Free-form style object attached to a cell (`{"bold": true, ...}`).
pub type CellStyle = Map<String, Value>;

/// Which positional index a structural edit acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    Row,
    Col,
}

impl Axis {
    /// Index of `(row, col)` along this axis.
    #[inline]
    pub fn index_of(self, row: u32, col: u32) -> u32 {
        match self {
            Axis::Row => row,
            Axis::Col => col,
        }
    }

    /// Replace this axis' index in `(row, col)`.
    #[inline]
    pub fn with_index(self, row: u32, col: u32, index: u32) -> (u32, u32) {
        match self {
            Axis::Row => (index, col),
            Axis::Col => (row, index),
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::Row => f.write_str("row"),
            Axis::Col => f.write_str("col"),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Cell keys
// ───────────────────────────────────────────────────────────────────

/// String identity `"{sheetId}:{row}:{col}"` used by locks and presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CellKey {
    pub sheet_id: SheetId,
    pub row: u32,
    pub col: u32,
}

impl CellKey {
    pub fn new(sheet_id: SheetId, row: u32, col: u32) -> Self {
        Self { sheet_id, row, col }
    }
}

impl fmt::Display for CellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.sheet_id, self.row, self.col)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CellKeyError {
    #[error("cell key must have three ':'-separated parts: {0:?}")]
    Shape(String),
    #[error("invalid sheet id in cell key: {0}")]
    SheetId(String),
    #[error("invalid {axis} index in cell key: {value:?}")]
    Index { axis: Axis, value: String },
}

impl FromStr for CellKey {
    type Err = CellKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');
        let (Some(sheet), Some(row), Some(col), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(CellKeyError::Shape(s.to_string()));
        };
        let sheet_id =
            Uuid::parse_str(sheet).map_err(|_| CellKeyError::SheetId(sheet.to_string()))?;
        let row = row.parse().map_err(|_| CellKeyError::Index {
            axis: Axis::Row,
            value: row.to_string(),
        })?;
        let col = col.parse().map_err(|_| CellKeyError::Index {
            axis: Axis::Col,
            value: col.to_string(),
        })?;
        Ok(Self { sheet_id, row, col })
    }
}

impl TryFrom<String> for CellKey {
    type Error = CellKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CellKey> for String {
    fn from(key: CellKey) -> Self {
        key.to_string()
    }
}

// ───────────────────────────────────────────────────────────────────
// Grids & sheets
// ───────────────────────────────────────────────────────────────────

/// Grid-level bookkeeping touched by content edits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GridRecord {
    pub id: GridId,
    pub last_modified: Option<u64>,
    pub last_editor: Option<UserId>,
}

impl GridRecord {
    pub fn new(id: GridId) -> Self {
        Self {
            id,
            last_modified: None,
            last_editor: None,
        }
    }
}

/// A sheet inside a grid. Creation order decides the fallback sheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetRecord {
    pub id: SheetId,
    pub grid_id: GridId,
    pub name: String,
    /// Milliseconds since epoch.
    pub created_at: u64,
}

impl SheetRecord {
    pub fn new(grid_id: GridId, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            grid_id,
            name: name.into(),
            created_at: crate::now_millis(),
        }
    }

    /// Ordering key for "first sheet by creation order".
    pub fn creation_order(&self) -> (u64, SheetId) {
        (self.created_at, self.id)
    }
}

// ───────────────────────────────────────────────────────────────────
// Layout
// ───────────────────────────────────────────────────────────────────

/// Stored dimensions and per-line sizes of one sheet.
///
/// `row_heights.len() == rows` and `col_widths.len() == cols` are expected but
/// not enforced; a mismatched array is treated as "use defaults".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetLayout {
    pub rows: u32,
    pub cols: u32,
    pub row_heights: Option<Vec<u32>>,
    pub col_widths: Option<Vec<u32>>,
}

impl Default for SheetLayout {
    fn default() -> Self {
        Self {
            rows: DEFAULT_ROWS,
            cols: DEFAULT_COLS,
            row_heights: None,
            col_widths: None,
        }
    }
}

impl SheetLayout {
    pub fn dimension(&self, axis: Axis) -> u32 {
        match axis {
            Axis::Row => self.rows,
            Axis::Col => self.cols,
        }
    }

    fn dimension_mut(&mut self, axis: Axis) -> &mut u32 {
        match axis {
            Axis::Row => &mut self.rows,
            Axis::Col => &mut self.cols,
        }
    }

    pub fn sizes(&self, axis: Axis) -> Option<&[u32]> {
        match axis {
            Axis::Row => self.row_heights.as_deref(),
            Axis::Col => self.col_widths.as_deref(),
        }
    }

    fn sizes_mut(&mut self, axis: Axis) -> Option<&mut Vec<u32>> {
        match axis {
            Axis::Row => self.row_heights.as_mut(),
            Axis::Col => self.col_widths.as_mut(),
        }
    }

    /// Per-line sizes, only when their length matches the dimension.
    pub fn consistent_sizes(&self, axis: Axis) -> Option<&[u32]> {
        self.sizes(axis)
            .filter(|sizes| sizes.len() == self.dimension(axis) as usize)
    }

    /// Open `count` default-sized lines at `at`.
    pub fn insert_lines(&mut self, axis: Axis, at: u32, count: u32) {
        let fill = match axis {
            Axis::Row => DEFAULT_ROW_HEIGHT,
            Axis::Col => DEFAULT_COL_WIDTH,
        };
        if let Some(sizes) = self.sizes_mut(axis) {
            let at = (at as usize).min(sizes.len());
            sizes.splice(at..at, std::iter::repeat(fill).take(count as usize));
        }
        let dim = self.dimension_mut(axis);
        *dim = dim.saturating_add(count);
    }

    /// Remove `count` lines starting at `start`. Never shrinks below one line.
    pub fn delete_lines(&mut self, axis: Axis, start: u32, count: u32) {
        if let Some(sizes) = self.sizes_mut(axis) {
            let start = (start as usize).min(sizes.len());
            let end = start.saturating_add(count as usize).min(sizes.len());
            sizes.drain(start..end);
        }
        let dim = self.dimension_mut(axis);
        *dim = dim.saturating_sub(count).max(1);
    }
}

/// Partial layout write; absent fields keep their stored value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cols: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_heights: Option<Vec<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub col_widths: Option<Vec<u32>>,
}

impl LayoutPatch {
    pub fn is_empty(&self) -> bool {
        self.rows.is_none()
            && self.cols.is_none()
            && self.row_heights.is_none()
            && self.col_widths.is_none()
    }

    /// COALESCE-style merge into `layout`.
    pub fn apply_to(&self, layout: &mut SheetLayout) {
        if let Some(rows) = self.rows {
            layout.rows = rows;
        }
        if let Some(cols) = self.cols {
            layout.cols = cols;
        }
        if let Some(heights) = &self.row_heights {
            layout.row_heights = Some(heights.clone());
        }
        if let Some(widths) = &self.col_widths {
            layout.col_widths = Some(widths.clone());
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Cells
// ───────────────────────────────────────────────────────────────────

/// One persisted cell. `(grid_id, sheet_id, row, col)` is unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cell {
    pub grid_id: GridId,
    pub sheet_id: SheetId,
    pub row: u32,
    pub col: u32,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<CellStyle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<UserId>,
    #[serde(default)]
    pub updated_at: u64,
}

impl Cell {
    pub fn key(&self) -> CellKey {
        CellKey::new(self.sheet_id, self.row, self.col)
    }
}

/// Partial cell write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CellPatch {
    /// `None` keeps the stored value.
    pub value: Option<Value>,
    /// `None` keeps the stored style; otherwise keys are merged in and a
    /// `null` entry removes that key.
    pub style: Option<CellStyle>,
    pub updated_by: Option<UserId>,
    pub updated_at: u64,
}

impl CellPatch {
    /// Merge onto the stored cell (or a fresh one at the given position).
    pub fn apply(
        &self,
        existing: Option<Cell>,
        grid_id: GridId,
        sheet_id: SheetId,
        row: u32,
        col: u32,
    ) -> Cell {
        let mut cell = existing.unwrap_or(Cell {
            grid_id,
            sheet_id,
            row,
            col,
            value: Value::Null,
            style: None,
            updated_by: None,
            updated_at: 0,
        });

        if let Some(value) = &self.value {
            cell.value = value.clone();
        }
        if let Some(patch) = &self.style {
            let style = cell.style.get_or_insert_with(Map::new);
            for (key, value) in patch {
                if value.is_null() {
                    style.remove(key);
                } else {
                    style.insert(key.clone(), value.clone());
                }
            }
        }
        if self.updated_by.is_some() {
            cell.updated_by = self.updated_by;
        }
        cell.updated_at = self.updated_at;
        cell
    }
}

// ───────────────────────────────────────────────────────────────────
// Users
// ───────────────────────────────────────────────────────────────────

/// Verified identity attached to a session by the authentication layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: UserId,
    pub display_name: String,
}

/// Display metadata used when broadcasting locks and presence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserEntry {
    pub user_id: UserId,
    pub display_name: String,
    pub color: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cell_key_display_and_parse() {
        let sheet = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let key = CellKey::new(sheet, 2, 3);
        let text = key.to_string();
        assert_eq!(text, "550e8400-e29b-41d4-a716-446655440000:2:3");
        assert_eq!(text.parse::<CellKey>().unwrap(), key);
    }

    #[test]
    fn test_cell_key_rejects_garbage() {
        assert!(matches!("a:b".parse::<CellKey>(), Err(CellKeyError::Shape(_))));
        assert!(matches!("x:1:2".parse::<CellKey>(), Err(CellKeyError::SheetId(_))));
        let sheet = Uuid::new_v4();
        assert!(matches!(
            format!("{sheet}:-1:2").parse::<CellKey>(),
            Err(CellKeyError::Index { axis: Axis::Row, .. })
        ));
        assert!(format!("{sheet}:1:2:3").parse::<CellKey>().is_err());
    }

    #[test]
    fn test_cell_key_serializes_as_string() {
        let key = CellKey::new(Uuid::new_v4(), 7, 1);
        let encoded = serde_json::to_value(key).unwrap();
        assert_eq!(encoded, json!(key.to_string()));
        let decoded: CellKey = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, key);
    }

    #[test]
    fn test_layout_patch_coalesces() {
        let mut layout = SheetLayout {
            rows: 10,
            cols: 5,
            row_heights: None,
            col_widths: Some(vec![80; 5]),
        };
        LayoutPatch {
            rows: Some(12),
            ..LayoutPatch::default()
        }
        .apply_to(&mut layout);

        assert_eq!(layout.rows, 12);
        assert_eq!(layout.cols, 5);
        assert_eq!(layout.col_widths, Some(vec![80; 5]));
    }

    #[test]
    fn test_consistent_sizes_requires_matching_length() {
        let layout = SheetLayout {
            rows: 3,
            cols: 2,
            row_heights: Some(vec![20, 20]),
            col_widths: Some(vec![90, 90]),
        };
        assert!(layout.consistent_sizes(Axis::Row).is_none());
        assert_eq!(layout.consistent_sizes(Axis::Col), Some(&[90, 90][..]));
    }

    #[test]
    fn test_layout_insert_and_delete_lines() {
        let mut layout = SheetLayout {
            rows: 4,
            cols: 2,
            row_heights: Some(vec![10, 11, 12, 13]),
            col_widths: None,
        };

        layout.insert_lines(Axis::Row, 1, 2);
        assert_eq!(layout.rows, 6);
        assert_eq!(
            layout.row_heights,
            Some(vec![10, DEFAULT_ROW_HEIGHT, DEFAULT_ROW_HEIGHT, 11, 12, 13])
        );

        layout.delete_lines(Axis::Row, 1, 2);
        assert_eq!(layout.rows, 4);
        assert_eq!(layout.row_heights, Some(vec![10, 11, 12, 13]));

        layout.insert_lines(Axis::Col, 0, 3);
        assert_eq!(layout.cols, 5);
        assert!(layout.col_widths.is_none());
    }

    #[test]
    fn test_layout_never_shrinks_below_one() {
        let mut layout = SheetLayout {
            rows: 2,
            ..SheetLayout::default()
        };
        layout.delete_lines(Axis::Row, 0, 5);
        assert_eq!(layout.rows, 1);
    }

    #[test]
    fn test_cell_patch_keeps_style_when_absent() {
        let grid = Uuid::new_v4();
        let sheet = Uuid::new_v4();
        let styled = CellPatch {
            style: Some(json!({"bold": true}).as_object().cloned().unwrap()),
            ..CellPatch::default()
        }
        .apply(None, grid, sheet, 0, 0);
        assert_eq!(styled.value, Value::Null);

        let updated = CellPatch {
            value: Some(json!("X")),
            updated_at: 5,
            ..CellPatch::default()
        }
        .apply(Some(styled), grid, sheet, 0, 0);

        assert_eq!(updated.value, json!("X"));
        assert_eq!(updated.style.unwrap()["bold"], json!(true));
        assert_eq!(updated.updated_at, 5);
    }

    #[test]
    fn test_cell_patch_merges_style_keys() {
        let grid = Uuid::new_v4();
        let sheet = Uuid::new_v4();
        let base = CellPatch {
            value: Some(json!(42)),
            style: Some(json!({"bold": true, "color": "red"}).as_object().cloned().unwrap()),
            ..CellPatch::default()
        }
        .apply(None, grid, sheet, 1, 1);

        let merged = CellPatch {
            style: Some(json!({"color": "blue", "bold": null}).as_object().cloned().unwrap()),
            ..CellPatch::default()
        }
        .apply(Some(base), grid, sheet, 1, 1);

        assert_eq!(merged.value, json!(42));
        let style = merged.style.unwrap();
        assert_eq!(style.get("color"), Some(&json!("blue")));
        assert!(style.get("bold").is_none());
    }
}
