//! Operation relay: validate, fan out, then persist.
//!
//! ```text
//!   op ─► validate ─► resolve sheet ─► lock + check structure ─► broadcast (sender excluded)
//!                                                                  │
//!                                                                  ▼
//!                                persist per type (cell / layout / structural)
//! ```
//!
//! Anything that fails before the broadcast is returned as a [`RelayError`].
//! Once peers have seen the operation, write failures are logged and reported
//! through [`Applied::persisted`] only.

use std::sync::Arc;
use thiserror::Error;

use gridsync_core::{
    now_millis, Axis, CellPatch, CellStyleChange, CellUpdate, Operation, OperationError,
    OperationKind, SheetId,
};

use crate::broadcast::RoomManager;
use crate::protocol::ServerEvent;
use crate::session::SessionId;
use crate::snapshot::SnapshotBuilder;
use crate::storage::{CellStore, StoreError, StoreResult};
use crate::structure::{StructuralError, StructuralMutator};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("operation rejected: {0}")]
    Rejected(#[from] OperationError),
    #[error("delete would leave the sheet without any {axis}")]
    WouldEmpty { axis: Axis },
    #[error("inserting {count} {axis}(s) would reach index {limit}")]
    OutOfRange { axis: Axis, count: u32, limit: u32 },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl From<StructuralError> for RelayError {
    fn from(e: StructuralError) -> Self {
        match e {
            StructuralError::WouldEmpty { axis } => RelayError::WouldEmpty { axis },
            StructuralError::OutOfRange { axis, count, limit } => {
                RelayError::OutOfRange { axis, count, limit }
            }
            StructuralError::Store(e) => RelayError::Store(e),
        }
    }
}

/// Result of a relayed operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    /// Operation as broadcast, with sheet, `ts` and actor filled in
    pub op: Operation,
    /// Room receivers the broadcast reached
    pub delivered: usize,
    /// `false` when the write failed after broadcast, or was skipped
    pub persisted: bool,
}

pub struct OperationRelay {
    cells: Arc<dyn CellStore>,
    rooms: Arc<RoomManager>,
    snapshots: SnapshotBuilder,
    mutator: Arc<StructuralMutator>,
}

impl OperationRelay {
    pub fn new(
        cells: Arc<dyn CellStore>,
        rooms: Arc<RoomManager>,
        snapshots: SnapshotBuilder,
        mutator: Arc<StructuralMutator>,
    ) -> Self {
        Self {
            cells,
            rooms,
            snapshots,
            mutator,
        }
    }

    pub fn mutator(&self) -> &Arc<StructuralMutator> {
        &self.mutator
    }

    /// Relay `op` to the grid room and persist it.
    ///
    /// `origin` is the sending session, which does not receive its own echo.
    /// Row/column edits hold the sheet's lock from the check until the
    /// mutation has run, so no other structural edit slips in between.
    pub async fn apply(
        &self,
        origin: Option<SessionId>,
        mut op: Operation,
    ) -> Result<Applied, RelayError> {
        if let Err(e) = op.validate() {
            log::warn!("Rejected {} for grid {}: {e}", op.type_name(), op.grid_id);
            return Err(e.into());
        }

        op.sheet_id = self.snapshots.resolve_sheet(op.grid_id, op.sheet_id).await?;

        let structural = match (op.sheet_id, op.kind.structural()) {
            (Some(sheet_id), Some(edit)) => {
                let held = self.mutator.lock(op.grid_id, sheet_id).await;
                self.mutator.check(&held, edit).await?;
                Some((held, edit))
            }
            _ => None,
        };

        if op.ts == 0 {
            op.ts = now_millis();
        }

        let delivered = self
            .rooms
            .broadcast(&op.grid_id, ServerEvent::Operation(op.clone()), origin)
            .await;
        log::debug!(
            "Relayed {} {} to {delivered} receiver(s) in grid {}",
            op.type_name(),
            op.id,
            op.grid_id
        );

        let Some(sheet_id) = op.sheet_id else {
            log::warn!(
                "Grid {} has no sheet, {} {} relayed without persisting",
                op.grid_id,
                op.type_name(),
                op.id
            );
            return Ok(Applied {
                op,
                delivered,
                persisted: false,
            });
        };

        let result = match structural {
            Some((held, edit)) => match self.mutator.apply_locked(&held, edit).await {
                Ok(outcome) => {
                    log::debug!("{} on sheet {sheet_id}: {outcome:?}", op.type_name());
                    Ok(())
                }
                Err(e) => Err(RelayError::from(e)),
            },
            None => self.persist(sheet_id, &op).await.map_err(RelayError::from),
        };

        let persisted = match result {
            Ok(()) => true,
            Err(e) => {
                log::error!(
                    "Failed to persist {} {} for grid {}: {e}",
                    op.type_name(),
                    op.id,
                    op.grid_id
                );
                false
            }
        };

        Ok(Applied {
            op,
            delivered,
            persisted,
        })
    }

    async fn persist(&self, sheet_id: SheetId, op: &Operation) -> StoreResult<()> {
        let grid_id = op.grid_id;
        match &op.kind {
            OperationKind::CellUpdate(CellUpdate {
                row,
                col,
                value,
                style,
            }) => {
                let patch = CellPatch {
                    value: Some(value.clone()),
                    style: style.clone(),
                    updated_by: op.actor_id,
                    updated_at: op.ts,
                };
                self.cells
                    .upsert_cell(grid_id, sheet_id, *row, *col, &patch)
                    .await?;
                self.cells.touch_grid(grid_id, op.actor_id, op.ts).await
            }
            OperationKind::CellStyle(CellStyleChange { row, col, style }) => {
                let patch = CellPatch {
                    value: None,
                    style: Some(style.clone()),
                    updated_by: op.actor_id,
                    updated_at: op.ts,
                };
                self.cells
                    .upsert_cell(grid_id, sheet_id, *row, *col, &patch)
                    .await
                    .map(|_| ())
            }
            OperationKind::Dimension(patch) | OperationKind::Resize(patch) => self
                .cells
                .upsert_layout(grid_id, sheet_id, patch)
                .await
                .map(|_| ()),
            // Run by `apply` under the sheet lock
            OperationKind::RowInsert(_)
            | OperationKind::RowDelete(_)
            | OperationKind::ColInsert(_)
            | OperationKind::ColDelete(_) => Ok(()),
        }
    }
}
