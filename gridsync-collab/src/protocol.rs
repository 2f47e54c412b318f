//! JSON event protocol spoken over WebSocket text frames.
//!
//! Wire format:
//! ```text
//! { "event": "<name>", "data": <payload> }
//! ```
//!
//! | Event                        | Direction     | Payload                                   |
//! |------------------------------|---------------|-------------------------------------------|
//! | `grid:join`                  | client → core | [`JoinRequest`]                           |
//! | `grid:snapshot`              | core → client | [`SheetSnapshot`]                         |
//! | `grid:operation`             | both          | [`Operation`]                             |
//! | `cell:focus` / `cell:blur`   | client → core | [`FocusRequest`] / [`CellRef`]            |
//! | `cell:presence`              | core → client | [`PresenceUpdate`]                        |
//! | `cell:lock:acquire/renew/release` | client → core | [`LockRequest`]                      |
//! | `cell:lock:granted/denied/released` | core → client | [`LockNotice`]                     |

use gridsync_core::{CellKey, GridId, Operation, SheetId, SheetSnapshot, UserEntry};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// `grid:join` payload. A missing sheet falls back to the grid's first sheet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub grid_id: GridId,
    #[serde(default)]
    pub sheet_id: Option<SheetId>,
}

/// A cell addressed within a grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellRef {
    pub grid_id: GridId,
    pub sheet_id: SheetId,
    pub row: u32,
    pub col: u32,
}

impl CellRef {
    pub fn cell_key(&self) -> CellKey {
        CellKey::new(self.sheet_id, self.row, self.col)
    }
}

/// `cell:focus` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FocusRequest {
    pub grid_id: GridId,
    pub sheet_id: SheetId,
    pub row: u32,
    pub col: u32,
    /// Cursor colour override (`#rrggbb`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl FocusRequest {
    pub fn cell(&self) -> CellRef {
        CellRef {
            grid_id: self.grid_id,
            sheet_id: self.sheet_id,
            row: self.row,
            col: self.col,
        }
    }
}

/// `cell:lock:*` request payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRequest {
    pub grid_id: GridId,
    pub sheet_id: SheetId,
    pub row: u32,
    pub col: u32,
    /// Client-chosen token proving ownership on renew/release
    pub token: String,
}

impl LockRequest {
    pub fn cell(&self) -> CellRef {
        CellRef {
            grid_id: self.grid_id,
            sheet_id: self.sheet_id,
            row: self.row,
            col: self.col,
        }
    }
}

/// `cell:presence` payload: everyone currently focused on a cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdate {
    pub cell_key: CellKey,
    pub users: Vec<UserEntry>,
}

/// `cell:lock:granted` / `denied` / `released` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockNotice {
    pub cell_key: CellKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder: Option<UserEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
}

impl LockNotice {
    pub fn granted(cell_key: CellKey, holder: UserEntry, token: String, ttl_ms: u64) -> Self {
        Self {
            cell_key,
            holder: Some(holder),
            token: Some(token),
            ttl_ms: Some(ttl_ms),
        }
    }

    pub fn denied(cell_key: CellKey, holder: Option<UserEntry>, ttl_ms: u64) -> Self {
        Self {
            cell_key,
            holder,
            token: None,
            ttl_ms: Some(ttl_ms),
        }
    }

    pub fn released(cell_key: CellKey) -> Self {
        Self {
            cell_key,
            holder: None,
            token: None,
            ttl_ms: None,
        }
    }
}

/// Events sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "grid:join")]
    Join(JoinRequest),
    #[serde(rename = "grid:operation")]
    Operation(Operation),
    #[serde(rename = "cell:focus")]
    Focus(FocusRequest),
    #[serde(rename = "cell:blur")]
    Blur(CellRef),
    #[serde(rename = "cell:lock:acquire")]
    LockAcquire(LockRequest),
    #[serde(rename = "cell:lock:renew")]
    LockRenew(LockRequest),
    #[serde(rename = "cell:lock:release")]
    LockRelease(LockRequest),
}

/// Events sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "grid:snapshot")]
    Snapshot(SheetSnapshot),
    #[serde(rename = "grid:operation")]
    Operation(Operation),
    #[serde(rename = "cell:presence")]
    Presence(PresenceUpdate),
    #[serde(rename = "cell:lock:granted")]
    LockGranted(LockNotice),
    #[serde(rename = "cell:lock:denied")]
    LockDenied(LockNotice),
    #[serde(rename = "cell:lock:released")]
    LockReleased(LockNotice),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Join(_) => "grid:join",
            ClientEvent::Operation(_) => "grid:operation",
            ClientEvent::Focus(_) => "cell:focus",
            ClientEvent::Blur(_) => "cell:blur",
            ClientEvent::LockAcquire(_) => "cell:lock:acquire",
            ClientEvent::LockRenew(_) => "cell:lock:renew",
            ClientEvent::LockRelease(_) => "cell:lock:release",
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Snapshot(_) => "grid:snapshot",
            ServerEvent::Operation(_) => "grid:operation",
            ServerEvent::Presence(_) => "cell:presence",
            ServerEvent::LockGranted(_) => "cell:lock:granted",
            ServerEvent::LockDenied(_) => "cell:lock:denied",
            ServerEvent::LockReleased(_) => "cell:lock:released",
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("websocket error: {0}")]
    WebSocket(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection timeout")]
    Timeout,
}

impl From<tokio_tungstenite::tungstenite::Error> for ProtocolError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ProtocolError::WebSocket(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridsync_core::OperationKind;
    use serde_json::{json, Value};
    use uuid::Uuid;

    #[test]
    fn test_decode_join_without_sheet() {
        let grid = Uuid::new_v4();
        let text = json!({"event": "grid:join", "data": {"gridId": grid}}).to_string();

        let event = ClientEvent::decode(&text).unwrap();
        assert_eq!(
            event,
            ClientEvent::Join(JoinRequest {
                grid_id: grid,
                sheet_id: None
            })
        );
    }

    #[test]
    fn test_decode_operation_event() {
        let grid = Uuid::new_v4();
        let text = json!({
            "event": "grid:operation",
            "data": {
                "gridId": grid,
                "sheetId": null,
                "type": "grid:resize",
                "payload": {"colWidths": [80, 90]},
                "ts": 12
            }
        })
        .to_string();

        let ClientEvent::Operation(op) = ClientEvent::decode(&text).unwrap() else {
            panic!("Expected operation event");
        };
        assert_eq!(op.ts, 12);
        assert!(matches!(op.kind, OperationKind::Resize(ref p) if p.col_widths == Some(vec![80, 90])));
    }

    #[test]
    fn test_unknown_event_rejected() {
        let text = json!({"event": "grid:leave", "data": {}}).to_string();
        assert!(matches!(
            ClientEvent::decode(&text),
            Err(ProtocolError::Deserialization(_))
        ));
        assert!(ClientEvent::decode("not json").is_err());
    }

    #[test]
    fn test_lock_notice_omits_absent_fields() {
        let key = CellKey::new(Uuid::new_v4(), 1, 2);
        let event = ServerEvent::LockReleased(LockNotice::released(key));

        let encoded: Value = serde_json::from_str(&event.encode().unwrap()).unwrap();
        assert_eq!(encoded["event"], json!("cell:lock:released"));
        assert_eq!(encoded["data"], json!({"cellKey": key.to_string()}));
    }

    #[test]
    fn test_lock_granted_shape() {
        let key = CellKey::new(Uuid::new_v4(), 0, 0);
        let holder = UserEntry {
            user_id: Uuid::new_v4(),
            display_name: "Ada".to_string(),
            color: "#112233".to_string(),
        };
        let event = ServerEvent::LockGranted(LockNotice::granted(
            key,
            holder.clone(),
            "t-1".to_string(),
            5000,
        ));

        let encoded: Value = serde_json::from_str(&event.encode().unwrap()).unwrap();
        assert_eq!(encoded["data"]["ttlMs"], json!(5000));
        assert_eq!(encoded["data"]["holder"]["displayName"], json!("Ada"));
        assert_eq!(encoded["data"]["token"], json!("t-1"));

        let decoded = ServerEvent::decode(&event.encode().unwrap()).unwrap();
        assert_eq!(decoded, event);
        assert_eq!(decoded.name(), "cell:lock:granted");
    }

    #[test]
    fn test_focus_color_optional() {
        let grid = Uuid::new_v4();
        let sheet = Uuid::new_v4();
        let text = json!({
            "event": "cell:focus",
            "data": {"gridId": grid, "sheetId": sheet, "row": 3, "col": 4}
        })
        .to_string();

        let ClientEvent::Focus(focus) = ClientEvent::decode(&text).unwrap() else {
            panic!("Expected focus event");
        };
        assert!(focus.color.is_none());
        assert_eq!(focus.cell().cell_key(), CellKey::new(sheet, 3, 4));
    }
}
