//! Typed content and layout operations.
//!
//! On the wire an operation is a loose envelope:
//! ```text
//! { "id", "gridId", "sheetId", "actorId"?, "type": "cell:update", "payload": {...}, "ts" }
//! ```
//! It is parsed into the closed [`OperationKind`] union at the boundary, so
//! everything behind the decoder works with validated payload shapes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::model::{Axis, CellStyle, GridId, LayoutPatch, SheetId, UserId};
use crate::{MAX_INDEX, MAX_LINES_PER_OP};

/// Where inserted lines go relative to the anchor index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Placement {
    #[default]
    Before,
    After,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellUpdate {
    pub row: u32,
    pub col: u32,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<CellStyle>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellStyleChange {
    pub row: u32,
    pub col: u32,
    pub style: CellStyle,
}

fn one() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertLines {
    pub at: u32,
    #[serde(default, rename = "where")]
    pub placement: Placement,
    #[serde(default = "one")]
    pub count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteLines {
    pub at: u32,
    #[serde(default = "one")]
    pub count: u32,
}

/// One variant per operation `type`.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationKind {
    CellUpdate(CellUpdate),
    CellStyle(CellStyleChange),
    Dimension(LayoutPatch),
    Resize(LayoutPatch),
    RowInsert(InsertLines),
    RowDelete(DeleteLines),
    ColInsert(InsertLines),
    ColDelete(DeleteLines),
}

/// Row/column insert or delete extracted from an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructuralEdit {
    Insert {
        axis: Axis,
        at: u32,
        placement: Placement,
        count: u32,
    },
    Delete {
        axis: Axis,
        at: u32,
        count: u32,
    },
}

impl StructuralEdit {
    pub fn axis(&self) -> Axis {
        match self {
            StructuralEdit::Insert { axis, .. } | StructuralEdit::Delete { axis, .. } => *axis,
        }
    }
}

impl OperationKind {
    /// Wire name of the operation type.
    pub fn type_name(&self) -> &'static str {
        match self {
            OperationKind::CellUpdate(_) => "cell:update",
            OperationKind::CellStyle(_) => "cell:style",
            OperationKind::Dimension(_) => "grid:dimension",
            OperationKind::Resize(_) => "grid:resize",
            OperationKind::RowInsert(_) => "grid:row:insert",
            OperationKind::RowDelete(_) => "grid:row:delete",
            OperationKind::ColInsert(_) => "grid:col:insert",
            OperationKind::ColDelete(_) => "grid:col:delete",
        }
    }

    /// Parse a `(type, payload)` pair from the wire envelope.
    pub fn from_parts(type_name: &str, payload: Value) -> Result<Self, OperationError> {
        fn parse<T: serde::de::DeserializeOwned>(
            type_name: &'static str,
            payload: Value,
        ) -> Result<T, OperationError> {
            serde_json::from_value(payload).map_err(|e| OperationError::InvalidPayload {
                type_name,
                reason: e.to_string(),
            })
        }

        Ok(match type_name {
            "cell:update" => OperationKind::CellUpdate(parse("cell:update", payload)?),
            "cell:style" => OperationKind::CellStyle(parse("cell:style", payload)?),
            "grid:dimension" => OperationKind::Dimension(parse("grid:dimension", payload)?),
            "grid:resize" => OperationKind::Resize(parse("grid:resize", payload)?),
            "grid:row:insert" => OperationKind::RowInsert(parse("grid:row:insert", payload)?),
            "grid:row:delete" => OperationKind::RowDelete(parse("grid:row:delete", payload)?),
            "grid:col:insert" => OperationKind::ColInsert(parse("grid:col:insert", payload)?),
            "grid:col:delete" => OperationKind::ColDelete(parse("grid:col:delete", payload)?),
            other => return Err(OperationError::UnknownType(other.to_string())),
        })
    }

    /// Payload as it appears on the wire.
    pub fn payload(&self) -> Value {
        let encoded = match self {
            OperationKind::CellUpdate(p) => serde_json::to_value(p),
            OperationKind::CellStyle(p) => serde_json::to_value(p),
            OperationKind::Dimension(p) | OperationKind::Resize(p) => serde_json::to_value(p),
            OperationKind::RowInsert(p) | OperationKind::ColInsert(p) => serde_json::to_value(p),
            OperationKind::RowDelete(p) | OperationKind::ColDelete(p) => serde_json::to_value(p),
        };
        encoded.unwrap_or_default()
    }

    pub fn structural(&self) -> Option<StructuralEdit> {
        let insert = |axis, p: &InsertLines| StructuralEdit::Insert {
            axis,
            at: p.at,
            placement: p.placement,
            count: p.count,
        };
        let delete = |axis, p: &DeleteLines| StructuralEdit::Delete {
            axis,
            at: p.at,
            count: p.count,
        };
        match self {
            OperationKind::RowInsert(p) => Some(insert(Axis::Row, p)),
            OperationKind::ColInsert(p) => Some(insert(Axis::Col, p)),
            OperationKind::RowDelete(p) => Some(delete(Axis::Row, p)),
            OperationKind::ColDelete(p) => Some(delete(Axis::Col, p)),
            _ => None,
        }
    }

    fn validate(&self) -> Result<(), OperationError> {
        match self {
            OperationKind::CellUpdate(CellUpdate { row, col, .. })
            | OperationKind::CellStyle(CellStyleChange { row, col, .. }) => {
                check_index(Axis::Row, *row)?;
                check_index(Axis::Col, *col)
            }
            OperationKind::Dimension(patch) | OperationKind::Resize(patch) => {
                if patch.is_empty() {
                    return Err(OperationError::EmptyLayoutPatch);
                }
                for (axis, dim) in [(Axis::Row, patch.rows), (Axis::Col, patch.cols)] {
                    if let Some(dim) = dim {
                        if dim == 0 || dim >= MAX_INDEX {
                            return Err(OperationError::InvalidDimension { axis, value: dim });
                        }
                    }
                }
                for (axis, sizes) in [(Axis::Row, &patch.row_heights), (Axis::Col, &patch.col_widths)] {
                    if let Some(sizes) = sizes {
                        if sizes.len() >= MAX_INDEX as usize {
                            return Err(OperationError::InvalidDimension {
                                axis,
                                value: sizes.len() as u32,
                            });
                        }
                    }
                }
                Ok(())
            }
            OperationKind::RowInsert(_)
            | OperationKind::RowDelete(_)
            | OperationKind::ColInsert(_)
            | OperationKind::ColDelete(_) => {
                let (axis, at, count) = match self.structural() {
                    Some(StructuralEdit::Insert { axis, at, count, .. })
                    | Some(StructuralEdit::Delete { axis, at, count }) => (axis, at, count),
                    None => return Ok(()),
                };
                if count == 0 || count > MAX_LINES_PER_OP {
                    return Err(OperationError::InvalidCount(count));
                }
                check_index(axis, at)
            }
        }
    }
}

fn check_index(axis: Axis, index: u32) -> Result<(), OperationError> {
    if index >= MAX_INDEX {
        return Err(OperationError::IndexOutOfRange { axis, index });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    #[error("unknown operation type: {0}")]
    UnknownType(String),
    #[error("invalid {type_name} payload: {reason}")]
    InvalidPayload {
        type_name: &'static str,
        reason: String,
    },
    #[error("{axis} index {index} out of range")]
    IndexOutOfRange { axis: Axis, index: u32 },
    #[error("line count {0} out of range (1..={max})", max = MAX_LINES_PER_OP)]
    InvalidCount(u32),
    #[error("layout patch carries no fields")]
    EmptyLayoutPatch,
    #[error("invalid {axis} dimension {value}")]
    InvalidDimension { axis: Axis, value: u32 },
}

/// Wire envelope, kept private so that untyped payloads never leak past decoding.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationFrame {
    #[serde(default)]
    id: Option<Uuid>,
    grid_id: GridId,
    #[serde(default)]
    sheet_id: Option<SheetId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    actor_id: Option<UserId>,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    ts: u64,
}

/// A single content/layout change relayed to a grid room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "OperationFrame", into = "OperationFrame")]
pub struct Operation {
    pub id: Uuid,
    pub grid_id: GridId,
    pub sheet_id: Option<SheetId>,
    pub actor_id: Option<UserId>,
    /// Milliseconds since epoch; `0` until stamped by the server.
    pub ts: u64,
    pub kind: OperationKind,
}

impl Operation {
    pub fn new(grid_id: GridId, sheet_id: Option<SheetId>, kind: OperationKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            grid_id,
            sheet_id,
            actor_id: None,
            ts: 0,
            kind,
        }
    }

    pub fn with_actor(mut self, actor_id: UserId) -> Self {
        self.actor_id = Some(actor_id);
        self
    }

    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }

    /// Check payload bounds. Decoding already guarantees payload shapes.
    pub fn validate(&self) -> Result<(), OperationError> {
        self.kind.validate()
    }
}

impl TryFrom<OperationFrame> for Operation {
    type Error = OperationError;

    fn try_from(frame: OperationFrame) -> Result<Self, Self::Error> {
        Ok(Self {
            id: frame.id.unwrap_or_else(Uuid::new_v4),
            grid_id: frame.grid_id,
            sheet_id: frame.sheet_id,
            actor_id: frame.actor_id,
            ts: frame.ts,
            kind: OperationKind::from_parts(&frame.kind, frame.payload)?,
        })
    }
}

impl From<Operation> for OperationFrame {
    fn from(op: Operation) -> Self {
        Self {
            id: Some(op.id),
            grid_id: op.grid_id,
            sheet_id: op.sheet_id,
            actor_id: op.actor_id,
            kind: op.kind.type_name().to_string(),
            payload: op.kind.payload(),
            ts: op.ts,
        }
    }
}
