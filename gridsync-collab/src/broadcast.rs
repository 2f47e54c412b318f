//! Per-grid fan-out to every joined session.
//!
//! Each grid room owns one tokio broadcast channel. Frames carry the
//! originating session so that a receiver can skip its own operations
//! ("broadcast to others"), while resync snapshots and lock grants are sent
//! with no origin and reach everyone.
//!
//! A receiver that falls more than `capacity` frames behind loses the oldest
//! frames (backpressure); the session logs the lag and carries on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use gridsync_core::{GridId, UserEntry};

use crate::protocol::ServerEvent;
use crate::session::SessionId;

/// A server event addressed to a room.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomFrame {
    /// Session that caused the event; `None` for events every member must see.
    pub origin: Option<SessionId>,
    pub event: ServerEvent,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// Broadcast group for a single grid room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<RoomFrame>>,
    /// Joined sessions and who they are
    peers: RwLock<HashMap<SessionId, UserEntry>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` frames are buffered per receiver before it starts lagging.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            stats: AtomicBroadcastStats::new(),
        }
    }

    /// Register a session and hand back its receiver.
    ///
    /// Re-adding a session that is already a member only refreshes its entry.
    pub async fn add_peer(
        &self,
        session_id: SessionId,
        user: UserEntry,
    ) -> broadcast::Receiver<Arc<RoomFrame>> {
        let mut peers = self.peers.write().await;
        peers.insert(session_id, user);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, session_id: &SessionId) -> Option<UserEntry> {
        self.peers.write().await.remove(session_id)
    }

    /// Send an event to every receiver. Returns how many receivers got it.
    pub fn broadcast(&self, event: ServerEvent, origin: Option<SessionId>) -> usize {
        let frame = Arc::new(RoomFrame { origin, event });
        match self.sender.send(frame) {
            Ok(count) => {
                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                count
            }
            Err(_) => {
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<UserEntry> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, session_id: &SessionId) -> bool {
        self.peers.read().await.contains_key(session_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps grid ids to broadcast groups.
pub struct RoomManager {
    rooms: RwLock<HashMap<GridId, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    pub async fn get_or_create(&self, grid_id: GridId) -> Arc<BroadcastGroup> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&grid_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(&grid_id) {
            return room.clone();
        }

        log::debug!("Opening room for grid {grid_id}");
        let room = Arc::new(BroadcastGroup::new(self.default_capacity));
        rooms.insert(grid_id, room.clone());
        room
    }

    pub async fn get(&self, grid_id: &GridId) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(grid_id).cloned()
    }

    /// Drop the room once its last member has left.
    pub async fn remove_if_empty(&self, grid_id: &GridId) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(grid_id) {
            if room.peer_count().await == 0 {
                rooms.remove(grid_id);
                log::debug!("Closed empty room for grid {grid_id}");
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_grids(&self) -> Vec<GridId> {
        self.rooms.read().await.keys().cloned().collect()
    }

    /// Broadcast into a grid's room if it exists. Returns receivers reached.
    pub async fn broadcast(
        &self,
        grid_id: &GridId,
        event: ServerEvent,
        origin: Option<SessionId>,
    ) -> usize {
        match self.get(grid_id).await {
            Some(room) => room.broadcast(event, origin),
            None => 0,
        }
    }
}
