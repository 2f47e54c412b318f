//! Persistence integration tests against RocksDB.
//!
//! Verifies:
//! - Operations relayed through the gateway survive a store reopen
//! - Structural edits re-key cells on disk and keep layout arrays in step
//! - A server restarted on the same directory serves the persisted snapshot
//! - Grids and sheets stay isolated under shifts

use gridsync_collab::gateway::{GatewayConfig, SyncGateway};
use gridsync_collab::protocol::{ClientEvent, ServerEvent};
use gridsync_collab::server::{ServerConfig, SyncServer};
use gridsync_collab::session::Session;
use gridsync_collab::storage::{CellStore, MemoryEphemeralStore, RocksCellStore, StoreConfig};
use gridsync_core::{
    CellPatch, CellUpdate, DeleteLines, GridId, Identity, InsertLines, LayoutPatch, Operation,
    OperationKind, Placement, SheetId, SheetRecord,
};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;
use uuid::Uuid;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn open_store(path: &Path) -> Arc<RocksCellStore> {
    Arc::new(RocksCellStore::open(StoreConfig::for_testing(path)).unwrap())
}

fn gateway_over(store: Arc<RocksCellStore>) -> SyncGateway {
    SyncGateway::new(
        store,
        Arc::new(MemoryEphemeralStore::new()),
        GatewayConfig::default(),
    )
}

async fn seed_sheet(store: &RocksCellStore, grid: GridId, name: &str, created_at: u64) -> SheetId {
    let mut sheet = SheetRecord::new(grid, name);
    sheet.created_at = created_at;
    let id = sheet.id;
    store.put_sheet(sheet).await.unwrap();
    id
}

fn editor() -> Session {
    Session::new(Some(Identity {
        id: Uuid::new_v4(),
        display_name: "Editor".to_string(),
    }))
}

fn cell_update(grid: GridId, sheet: SheetId, row: u32, col: u32, value: &str) -> ClientEvent {
    ClientEvent::Operation(Operation::new(
        grid,
        Some(sheet),
        OperationKind::CellUpdate(CellUpdate {
            row,
            col,
            value: json!(value),
            style: None,
        }),
    ))
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_relayed_edits_survive_reopen() {
    let dir = tempdir().unwrap();
    let grid = Uuid::new_v4();
    let mut session = editor();

    let sheet = {
        let store = open_store(dir.path());
        let sheet = seed_sheet(&store, grid, "Sheet1", 1).await;
        let gateway = gateway_over(store.clone());

        gateway.join(&mut session, grid, Some(sheet)).await;
        gateway.handle(&mut session, cell_update(grid, sheet, 0, 0, "A1")).await;
        gateway.handle(&mut session, cell_update(grid, sheet, 3, 1, "B4")).await;
        gateway
            .handle(
                &mut session,
                ClientEvent::Operation(Operation::new(
                    grid,
                    Some(sheet),
                    OperationKind::Dimension(LayoutPatch {
                        cols: Some(8),
                        col_widths: Some(vec![120; 8]),
                        ..LayoutPatch::default()
                    }),
                )),
            )
            .await;
        gateway.leave(&mut session).await;
        store.flush().unwrap();
        sheet
    };

    let store = open_store(dir.path());
    let cells = store.list_cells(grid, sheet).await.unwrap();
    let values: Vec<_> = cells.iter().map(|c| (c.row, c.col, c.value.clone())).collect();
    assert_eq!(values, vec![(0, 0, json!("A1")), (3, 1, json!("B4"))]);
    assert!(cells.iter().all(|c| c.updated_by == session.actor_id()));

    let grid_record = store.get_grid(grid).await.unwrap().unwrap();
    assert_eq!(grid_record.last_editor, session.actor_id());

    let layout = store.get_layout(grid, sheet).await.unwrap().unwrap();
    assert_eq!(layout.cols, 8);
    assert_eq!(layout.col_widths, Some(vec![120; 8]));
}

#[tokio::test]
async fn test_structural_edits_rekey_cells_on_disk() {
    let dir = tempdir().unwrap();
    let grid = Uuid::new_v4();
    let store = open_store(dir.path());
    let sheet = seed_sheet(&store, grid, "Sheet1", 1).await;
    let gateway = gateway_over(store.clone());
    let mut session = editor();
    gateway.join(&mut session, grid, Some(sheet)).await;

    for row in [1, 4, 5, 9] {
        gateway
            .handle(&mut session, cell_update(grid, sheet, row, 0, &format!("r{row}")))
            .await;
    }

    let structural = |kind| ClientEvent::Operation(Operation::new(grid, Some(sheet), kind));
    gateway
        .handle(
            &mut session,
            structural(OperationKind::RowInsert(InsertLines {
                at: 4,
                placement: Placement::Before,
                count: 3,
            })),
        )
        .await;
    gateway
        .handle(
            &mut session,
            structural(OperationKind::RowDelete(DeleteLines { at: 0, count: 2 })),
        )
        .await;

    // Insert: 4→7, 5→8, 9→12. Delete rows 0..=1: r1 gone, rest up by 2.
    let rows: Vec<_> = store
        .list_cells(grid, sheet)
        .await
        .unwrap()
        .into_iter()
        .map(|c| (c.row, c.value))
        .collect();
    assert_eq!(
        rows,
        vec![(5, json!("r4")), (6, json!("r5")), (10, json!("r9"))]
    );

    let layout = store.get_layout(grid, sheet).await.unwrap().unwrap();
    assert_eq!(layout.rows, 101);

    // The session's last event is the resync snapshot
    match session.drain_events().pop() {
        Some(ServerEvent::Snapshot(snapshot)) => {
            assert_eq!(snapshot.rows, 101);
            assert_eq!(snapshot.cells.len(), 3);
        }
        other => panic!("Expected snapshot, got {other:?}"),
    }
}

#[tokio::test]
async fn test_shift_is_isolated_per_sheet() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let grid = Uuid::new_v4();
    let other_grid = Uuid::new_v4();
    let first = seed_sheet(&store, grid, "One", 1).await;
    let second = seed_sheet(&store, grid, "Two", 2).await;
    let foreign = seed_sheet(&store, other_grid, "One", 1).await;

    let patch = CellPatch {
        value: Some(json!("v")),
        updated_at: 1,
        ..CellPatch::default()
    };
    for (g, s) in [(grid, first), (grid, second), (other_grid, foreign)] {
        store.upsert_cell(g, s, 2, 2, &patch).await.unwrap();
    }

    let gateway = gateway_over(store.clone());
    let outcome = gateway
        .relay()
        .mutator()
        .insert_cols(grid, first, 0, Placement::Before, 5)
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        gridsync_collab::StructuralOutcome::Inserted { moved: 1, .. }
    ));

    assert!(store.get_cell(grid, first, 2, 7).await.unwrap().is_some());
    assert!(store.get_cell(grid, second, 2, 2).await.unwrap().is_some());
    assert!(store.get_cell(other_grid, foreign, 2, 2).await.unwrap().is_some());
    assert_eq!(store.list_sheets(grid).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_restarted_server_serves_persisted_snapshot() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("db");
    let grid = Uuid::new_v4();
    let config = ServerConfig {
        storage_path: Some(db_path.clone()),
        provision_sheets: true,
        ..ServerConfig::default()
    };

    let sheet = {
        let server = SyncServer::new(config.clone()).unwrap();
        let mut session = editor();
        server.gateway().join(&mut session, grid, None).await;
        let sheet = session.location().and_then(|loc| loc.sheet_id).unwrap();
        server
            .gateway()
            .handle(&mut session, cell_update(grid, sheet, 7, 3, "kept"))
            .await;
        server.gateway().leave(&mut session).await;
        sheet
    };

    let server = SyncServer::new(config).unwrap();
    let mut session = editor();
    server.gateway().join(&mut session, grid, None).await;
    match session.try_next_event() {
        Some(ServerEvent::Snapshot(snapshot)) => {
            assert_eq!(snapshot.id, Some(sheet));
            assert_eq!(snapshot.value_at(7, 3), Some(&json!("kept")));
        }
        other => panic!("Expected snapshot, got {other:?}"),
    }
    // No second sheet was provisioned
    assert_eq!(server.gateway().cells().list_sheets(grid).await.unwrap().len(), 1);
}
