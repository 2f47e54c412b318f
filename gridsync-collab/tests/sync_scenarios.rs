//! End-to-end scenarios driven through the gateway with in-memory stores.
//!
//! Sessions here are the same context objects the WebSocket server uses, so
//! these cover the full routing path minus the transport.

use gridsync_collab::gateway::{GatewayConfig, SyncGateway};
use gridsync_collab::lock::AcquireOutcome;
use gridsync_collab::protocol::{ClientEvent, FocusRequest, CellRef, LockRequest, ServerEvent};
use gridsync_collab::session::Session;
use gridsync_collab::storage::{CellStore, MemoryCellStore, MemoryEphemeralStore};
use gridsync_core::{
    Axis, CellKey, CellPatch, CellUpdate, DeleteLines, GridId, Identity, InsertLines,
    LayoutPatch, Operation, OperationKind, Placement, SheetId, SheetLayout, SheetRecord,
};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

struct Harness {
    store: Arc<MemoryCellStore>,
    gateway: SyncGateway,
    grid: GridId,
    sheet: SheetId,
}

async fn harness() -> Harness {
    let store = Arc::new(MemoryCellStore::new());
    let gateway = SyncGateway::new(
        store.clone(),
        Arc::new(MemoryEphemeralStore::new()),
        GatewayConfig::default(),
    );
    let grid = Uuid::new_v4();
    let sheet = SheetRecord::new(grid, "Sheet1");
    let sheet_id = sheet.id;
    store.put_sheet(sheet).await.unwrap();
    Harness {
        store,
        gateway,
        grid,
        sheet: sheet_id,
    }
}

fn named(name: &str) -> Session {
    Session::new(Some(Identity {
        id: Uuid::new_v4(),
        display_name: name.to_string(),
    }))
}

async fn joined(h: &Harness, name: &str) -> Session {
    let mut session = named(name);
    h.gateway.join(&mut session, h.grid, Some(h.sheet)).await;
    session.drain_events();
    session
}

fn lock_request(h: &Harness, row: u32, col: u32, token: &str) -> LockRequest {
    LockRequest {
        grid_id: h.grid,
        sheet_id: h.sheet,
        row,
        col,
        token: token.to_string(),
    }
}

fn op(h: &Harness, kind: OperationKind) -> Operation {
    Operation::new(h.grid, Some(h.sheet), kind)
}

async fn put(h: &Harness, row: u32, col: u32, value: &str) {
    h.store
        .upsert_cell(
            h.grid,
            h.sheet,
            row,
            col,
            &CellPatch {
                value: Some(json!(value)),
                ..CellPatch::default()
            },
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_ten_row_sheet_insert_scenario() {
    let h = harness().await;
    h.store
        .put_layout(
            h.grid,
            h.sheet,
            SheetLayout {
                rows: 10,
                ..SheetLayout::default()
            },
        )
        .await
        .unwrap();
    put(&h, 5, 2, "X").await;

    let mut alice = joined(&h, "Alice").await;
    let mut bob = joined(&h, "Bob").await;

    let insert = op(
        &h,
        OperationKind::RowInsert(InsertLines {
            at: 3,
            placement: Placement::Before,
            count: 2,
        }),
    );
    h.gateway.handle(&mut alice, ClientEvent::Operation(insert)).await;

    // Bob sees the relayed op, then the resync snapshot
    let events = bob.drain_events();
    assert_eq!(events.len(), 2);
    assert!(matches!(events[0], ServerEvent::Operation(_)));
    let ServerEvent::Snapshot(snapshot) = &events[1] else {
        panic!("Expected snapshot, got {:?}", events[1]);
    };
    assert_eq!(snapshot.rows, 12);
    assert_eq!(snapshot.value_at(7, 2), Some(&json!("X")));
    assert_eq!(snapshot.value_at(5, 2), None);

    // The sender gets the snapshot too, but not its own op
    let events = alice.drain_events();
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], ServerEvent::Snapshot(_)));
}

#[tokio::test]
async fn test_structural_round_trip_restores_mapping() {
    let h = harness().await;
    let original = [(0, 0, "a"), (2, 1, "b"), (3, 4, "c"), (9, 0, "d"), (40, 3, "e")];
    for (row, col, value) in original {
        put(&h, row, col, value).await;
    }
    let mut alice = joined(&h, "Alice").await;

    for (axis_insert, axis_delete) in [
        (
            OperationKind::RowInsert(InsertLines {
                at: 3,
                placement: Placement::Before,
                count: 4,
            }),
            OperationKind::RowDelete(DeleteLines { at: 3, count: 4 }),
        ),
        (
            OperationKind::ColInsert(InsertLines {
                at: 1,
                placement: Placement::Before,
                count: 2,
            }),
            OperationKind::ColDelete(DeleteLines { at: 1, count: 2 }),
        ),
    ] {
        h.gateway
            .handle(&mut alice, ClientEvent::Operation(op(&h, axis_insert)))
            .await;
        h.gateway
            .handle(&mut alice, ClientEvent::Operation(op(&h, axis_delete)))
            .await;
    }

    let cells = h.store.list_cells(h.grid, h.sheet).await.unwrap();
    let mapping: Vec<(u32, u32, String)> = cells
        .iter()
        .map(|c| (c.row, c.col, c.value.as_str().unwrap_or_default().to_string()))
        .collect();
    let expected: Vec<(u32, u32, String)> = original
        .iter()
        .map(|(r, c, v)| (*r, *c, v.to_string()))
        .collect();
    assert_eq!(mapping, expected);

    let layout = h.store.get_layout(h.grid, h.sheet).await.unwrap().unwrap();
    assert_eq!(layout, SheetLayout::default());
}

#[tokio::test]
async fn test_delete_shifts_cells_past_range() {
    let h = harness().await;
    for row in 0..8 {
        put(&h, row, 0, &format!("r{row}")).await;
    }
    let mut alice = joined(&h, "Alice").await;

    h.gateway
        .handle(
            &mut alice,
            ClientEvent::Operation(op(
                &h,
                OperationKind::RowDelete(DeleteLines { at: 2, count: 3 }),
            )),
        )
        .await;

    let snapshot = h.gateway.snapshots().build(h.grid, Some(h.sheet)).await.unwrap();
    assert_eq!(snapshot.rows, SheetLayout::default().rows - 3);
    let values: Vec<_> = (0..5).map(|row| snapshot.value_at(row, 0).cloned()).collect();
    assert_eq!(
        values,
        vec![
            Some(json!("r0")),
            Some(json!("r1")),
            Some(json!("r5")),
            Some(json!("r6")),
            Some(json!("r7")),
        ]
    );
}

#[tokio::test]
async fn test_snapshot_sizes_match_dimensions_or_are_omitted() {
    let h = harness().await;
    let mut alice = joined(&h, "Alice").await;

    let resize = op(
        &h,
        OperationKind::Resize(LayoutPatch {
            rows: Some(4),
            row_heights: Some(vec![20, 20, 20, 20]),
            col_widths: Some(vec![90; 3]),
            ..LayoutPatch::default()
        }),
    );
    h.gateway.handle(&mut alice, ClientEvent::Operation(resize)).await;

    let snapshot = h.gateway.snapshots().build(h.grid, None).await.unwrap();
    assert_eq!(snapshot.rows, 4);
    assert_eq!(snapshot.row_heights.as_ref().map(Vec::len), Some(4));
    // Three widths against the default column count: omitted
    assert!(snapshot.col_widths.is_none());

    // Inserting rows keeps heights in step with the row count
    let insert = op(
        &h,
        OperationKind::RowInsert(InsertLines {
            at: 1,
            placement: Placement::After,
            count: 2,
        }),
    );
    h.gateway.handle(&mut alice, ClientEvent::Operation(insert)).await;
    let snapshot = h.gateway.snapshots().build(h.grid, None).await.unwrap();
    assert_eq!(snapshot.rows, 6);
    assert_eq!(snapshot.row_heights.as_ref().map(Vec::len), Some(6));
}

#[tokio::test]
async fn test_lock_handoff_scenario() {
    let h = harness().await;
    let mut alice = joined(&h, "Alice").await;
    let mut bob = joined(&h, "Bob").await;

    h.gateway
        .handle(&mut alice, ClientEvent::LockAcquire(lock_request(&h, 2, 3, "t1")))
        .await;
    for session in [&mut alice, &mut bob] {
        match session.try_next_event() {
            Some(ServerEvent::LockGranted(notice)) => {
                assert_eq!(notice.holder.unwrap().display_name, "Alice");
                assert_eq!(notice.token.as_deref(), Some("t1"));
            }
            other => panic!("Expected grant, got {other:?}"),
        }
    }

    h.gateway
        .handle(&mut bob, ClientEvent::LockAcquire(lock_request(&h, 2, 3, "t2")))
        .await;
    match bob.try_next_event() {
        Some(ServerEvent::LockDenied(notice)) => {
            assert_eq!(notice.holder.unwrap().display_name, "Alice");
        }
        other => panic!("Expected denial, got {other:?}"),
    }
    assert!(alice.try_next_event().is_none());

    h.gateway
        .handle(&mut alice, ClientEvent::LockRelease(lock_request(&h, 2, 3, "t1")))
        .await;
    let key = CellKey::new(h.sheet, 2, 3);
    for session in [&mut alice, &mut bob] {
        match session.try_next_event() {
            Some(ServerEvent::LockReleased(notice)) => assert_eq!(notice.cell_key, key),
            other => panic!("Expected release, got {other:?}"),
        }
    }

    h.gateway
        .handle(&mut bob, ClientEvent::LockAcquire(lock_request(&h, 2, 3, "t2")))
        .await;
    match bob.try_next_event() {
        Some(ServerEvent::LockGranted(notice)) => {
            assert_eq!(notice.holder.unwrap().display_name, "Bob");
        }
        other => panic!("Expected grant, got {other:?}"),
    }
}

#[tokio::test]
async fn test_concurrent_acquire_grants_exactly_one() {
    let h = harness().await;
    let alice = joined(&h, "Alice").await;
    let bob = joined(&h, "Bob").await;
    let key = CellKey::new(h.sheet, 0, 0);
    let locks = h.gateway.locks();

    let (a, b) = tokio::join!(
        locks.acquire(&alice, h.grid, key, "ta".into()),
        locks.acquire(&bob, h.grid, key, "tb".into()),
    );
    let granted = [&a, &b].iter().filter(|o| o.is_granted()).count();
    assert_eq!(granted, 1);
    assert!(matches!(
        if a.is_granted() { &b } else { &a },
        AcquireOutcome::Denied { holder: Some(_), .. }
    ));
}

#[tokio::test]
async fn test_blur_removes_user_from_next_presence() {
    let h = harness().await;
    let mut alice = joined(&h, "Alice").await;
    let mut bob = joined(&h, "Bob").await;

    let cell = CellRef {
        grid_id: h.grid,
        sheet_id: h.sheet,
        row: 1,
        col: 1,
    };
    for session in [&mut alice, &mut bob] {
        h.gateway
            .handle(
                session,
                ClientEvent::Focus(FocusRequest {
                    grid_id: cell.grid_id,
                    sheet_id: cell.sheet_id,
                    row: cell.row,
                    col: cell.col,
                    color: None,
                }),
            )
            .await;
    }
    bob.drain_events();

    h.gateway.handle(&mut alice, ClientEvent::Blur(cell)).await;
    let next = bob
        .drain_events()
        .into_iter()
        .find_map(|event| match event {
            ServerEvent::Presence(update) if update.cell_key == cell.cell_key() => Some(update),
            _ => None,
        })
        .unwrap();
    let names: Vec<_> = next.users.iter().map(|u| u.display_name.as_str()).collect();
    assert_eq!(names, vec!["Bob"]);
}

#[tokio::test]
async fn test_quick_successive_updates_last_write_wins() {
    let h = harness().await;
    let mut alice = joined(&h, "Alice").await;
    let mut bob = joined(&h, "Bob").await;

    let write = |value: &str| {
        op(
            &h,
            OperationKind::CellUpdate(CellUpdate {
                row: 4,
                col: 4,
                value: json!(value),
                style: None,
            }),
        )
    };
    h.gateway.handle(&mut alice, ClientEvent::Operation(write("alice"))).await;
    h.gateway.handle(&mut bob, ClientEvent::Operation(write("bob"))).await;

    let cell = h.store.get_cell(h.grid, h.sheet, 4, 4).await.unwrap().unwrap();
    assert_eq!(cell.value, json!("bob"));
    assert_eq!(cell.updated_by, bob.actor_id());
}

#[tokio::test]
async fn test_delete_leaving_no_columns_is_rejected() {
    let h = harness().await;
    put(&h, 0, 0, "keep").await;
    let mut alice = joined(&h, "Alice").await;
    let mut bob = joined(&h, "Bob").await;

    let delete_all = op(
        &h,
        OperationKind::ColDelete(DeleteLines {
            at: 0,
            count: SheetLayout::default().cols,
        }),
    );
    h.gateway.handle(&mut alice, ClientEvent::Operation(delete_all)).await;

    assert!(bob.try_next_event().is_none());
    assert_eq!(h.store.cell_count().await, 1);
    let layout = h.store.get_layout(h.grid, h.sheet).await.unwrap();
    assert!(layout.map_or(true, |l| l.dimension(Axis::Col) == SheetLayout::default().cols));
}
