//! Per-connection session context.
//!
//! A [`Session`] is owned by the task serving one connection and passed
//! `&mut` into every gateway handler. It carries everything the handlers need
//! to know about the connection: who it is, which grid/sheet it is looking
//! at, which cell it has focused, and the two delivery paths to the client:
//!
//! ```text
//!   gateway ── send() ──────────────► outbox (direct, this session only)
//!   room ──── broadcast::Sender ────► subscription (skips own frames)
//!                                         │
//!                    next_event() ◄───────┘  outbox first, then room
//! ```

use std::sync::Arc;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use gridsync_core::{CellKey, GridId, Identity, SheetId, UserEntry, UserId};

use crate::broadcast::RoomFrame;
use crate::presence::color_for;
use crate::protocol::ServerEvent;

pub type SessionId = Uuid;

/// Grid and sheet a session currently views.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub grid_id: GridId,
    /// Sheet the last snapshot resolved to; `None` for a grid without sheets.
    pub sheet_id: Option<SheetId>,
}

pub struct Session {
    id: SessionId,
    identity: Option<Identity>,
    location: Option<Location>,
    focus: Option<CellKey>,
    color: Option<String>,
    subscription: Option<broadcast::Receiver<Arc<RoomFrame>>>,
    outbox_tx: mpsc::UnboundedSender<ServerEvent>,
    outbox_rx: mpsc::UnboundedReceiver<ServerEvent>,
}

impl Session {
    /// New session; `identity` is `None` for anonymous connections.
    pub fn new(identity: Option<Identity>) -> Self {
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        Self {
            id: Uuid::new_v4(),
            identity,
            location: None,
            focus: None,
            color: None,
            subscription: None,
            outbox_tx,
            outbox_rx,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// Author recorded on operations; `None` for anonymous sessions.
    pub fn actor_id(&self) -> Option<UserId> {
        self.identity.as_ref().map(|identity| identity.id)
    }

    /// Id used for locks and presence. Anonymous sessions use the session id.
    pub fn user_id(&self) -> UserId {
        self.actor_id().unwrap_or(self.id)
    }

    pub fn display_name(&self) -> String {
        match &self.identity {
            Some(identity) => identity.display_name.clone(),
            None => format!("Guest-{}", &self.id.to_string()[..8]),
        }
    }

    /// Display metadata, honouring the last cursor colour the client chose.
    pub fn user_entry(&self) -> UserEntry {
        let user_id = self.user_id();
        UserEntry {
            user_id,
            display_name: self.display_name(),
            color: self.color.clone().unwrap_or_else(|| color_for(user_id)),
        }
    }

    pub fn set_color(&mut self, color: Option<String>) {
        if color.is_some() {
            self.color = color;
        }
    }

    pub fn location(&self) -> Option<Location> {
        self.location
    }

    pub fn grid_id(&self) -> Option<GridId> {
        self.location.map(|loc| loc.grid_id)
    }

    /// Whether the session has joined `grid_id`.
    pub fn is_in(&self, grid_id: GridId) -> bool {
        self.grid_id() == Some(grid_id)
    }

    pub(crate) fn set_location(&mut self, location: Option<Location>) {
        self.location = location;
    }

    pub fn focus(&self) -> Option<CellKey> {
        self.focus
    }

    pub(crate) fn set_focus(&mut self, focus: Option<CellKey>) -> Option<CellKey> {
        std::mem::replace(&mut self.focus, focus)
    }

    /// Deliver an event to this session only.
    pub fn send(&self, event: ServerEvent) {
        // The receiver lives in `self`, so this cannot fail while the session exists.
        let _ = self.outbox_tx.send(event);
    }

    pub(crate) fn subscribe(&mut self, rx: broadcast::Receiver<Arc<RoomFrame>>) {
        self.subscription = Some(rx);
    }

    pub(crate) fn unsubscribe(&mut self) {
        self.subscription = None;
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }

    /// Wait for the next event destined for this client.
    ///
    /// Direct sends win over room traffic. Room frames originating from this
    /// session are skipped. The session owns its outbox sender, so this waits
    /// until something arrives rather than ever reporting end of stream.
    pub async fn next_event(&mut self) -> ServerEvent {
        loop {
            tokio::select! {
                biased;

                Some(event) = self.outbox_rx.recv() => return event,

                frame = recv_frame(&mut self.subscription) => match frame {
                    Ok(frame) => {
                        if frame.origin == Some(self.id) {
                            continue;
                        }
                        return frame.event.clone();
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("Session {} lagged, {skipped} room events dropped", self.id);
                    }
                    Err(RecvError::Closed) => {
                        self.subscription = None;
                    }
                },
            }
        }
    }

    /// Next event if one is ready now.
    pub fn try_next_event(&mut self) -> Option<ServerEvent> {
        if let Ok(event) = self.outbox_rx.try_recv() {
            return Some(event);
        }
        loop {
            let rx = self.subscription.as_mut()?;
            match rx.try_recv() {
                Ok(frame) if frame.origin == Some(self.id) => continue,
                Ok(frame) => return Some(frame.event.clone()),
                Err(TryRecvError::Lagged(skipped)) => {
                    log::warn!("Session {} lagged, {skipped} room events dropped", self.id);
                }
                Err(TryRecvError::Closed) => {
                    self.subscription = None;
                    return None;
                }
                Err(TryRecvError::Empty) => return None,
            }
        }
    }

    /// Drain every event that is ready now.
    pub fn drain_events(&mut self) -> Vec<ServerEvent> {
        std::iter::from_fn(|| self.try_next_event()).collect()
    }
}

async fn recv_frame(
    rx: &mut Option<broadcast::Receiver<Arc<RoomFrame>>>,
) -> Result<Arc<RoomFrame>, RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
