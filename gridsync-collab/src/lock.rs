//! Exclusive per-cell edit locks.
//!
//! ```text
//!   Unlocked ── acquire (set-if-absent, TTL) ──► Locked(holder, token)
//!      ▲                                            │  renew (token match) ↺
//!      └──── release (token match) / TTL expiry ────┘
//! ```
//!
//! Each lock is one TTL'd key `lock:{gridId}:{cellKey}` holding
//! `{"holder": userId, "token": "..."}`. Renew and release compare the whole
//! stored record, so only the holder presenting its own token can touch it.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use gridsync_core::{CellKey, GridId, UserEntry, UserId};

use crate::broadcast::RoomManager;
use crate::directory::UserDirectory;
use crate::protocol::{LockNotice, ServerEvent};
use crate::session::Session;
use crate::storage::{EphemeralStore, StoreResult};

pub const DEFAULT_LOCK_TTL: Duration = Duration::from_millis(5000);

pub fn lock_key(grid_id: GridId, cell_key: &CellKey) -> String {
    format!("lock:{grid_id}:{cell_key}")
}

/// Stored lock value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub holder: UserId,
    pub token: String,
}

impl LockRecord {
    fn encode(&self) -> StoreResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Granted {
        holder: UserEntry,
        token: String,
    },
    /// `holder` is `None` when the current holder could not be determined.
    Denied {
        holder: Option<UserEntry>,
        ttl: Duration,
    },
}

impl AcquireOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, AcquireOutcome::Granted { .. })
    }
}

/// Per-cell edit locks with a TTL.
///
/// Renew and release compare the whole stored `{holder, token}` record, so a
/// matching token presented by a different user is treated as a mismatch.
pub struct LockManager {
    ephemeral: Arc<dyn EphemeralStore>,
    directory: UserDirectory,
    rooms: Arc<RoomManager>,
    ttl: Duration,
}

impl LockManager {
    pub fn new(
        ephemeral: Arc<dyn EphemeralStore>,
        directory: UserDirectory,
        rooms: Arc<RoomManager>,
        ttl: Duration,
    ) -> Self {
        Self {
            ephemeral,
            directory,
            rooms,
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Try to take the lock for `session`.
    ///
    /// Granted → `cell:lock:granted` to the whole room, requester included.
    /// Denied → `cell:lock:denied` to the requester only.
    pub async fn acquire(
        &self,
        session: &Session,
        grid_id: GridId,
        cell_key: CellKey,
        token: String,
    ) -> AcquireOutcome {
        let key = lock_key(grid_id, &cell_key);
        let record = LockRecord {
            holder: session.user_id(),
            token,
        };

        let attempt = match record.encode() {
            Ok(encoded) => self.ephemeral.set_if_absent(&key, &encoded, self.ttl).await,
            Err(e) => Err(e),
        };

        match attempt {
            Ok(true) => {
                let holder = session.user_entry();
                if let Err(e) = self.directory.upsert(&holder).await {
                    log::debug!("Could not cache lock holder {}: {e}", holder.user_id);
                }
                log::debug!("{} locked {cell_key} in grid {grid_id}", holder.display_name);
                self.rooms
                    .broadcast(
                        &grid_id,
                        ServerEvent::LockGranted(LockNotice::granted(
                            cell_key,
                            holder.clone(),
                            record.token.clone(),
                            self.ttl.as_millis() as u64,
                        )),
                        None,
                    )
                    .await;
                AcquireOutcome::Granted {
                    holder,
                    token: record.token,
                }
            }
            Ok(false) => {
                let (holder, ttl) = self.current_holder(&key).await;
                log::debug!("Lock on {cell_key} denied to session {}", session.id());
                self.deny(session, cell_key, holder, ttl)
            }
            Err(e) => {
                log::warn!("Lock store unavailable, denying {cell_key}: {e}");
                self.deny(session, cell_key, None, self.ttl)
            }
        }
    }

    /// Extend the lock's TTL if `session` holds it with `token`.
    pub async fn renew(
        &self,
        session: &Session,
        grid_id: GridId,
        cell_key: CellKey,
        token: String,
    ) -> bool {
        let key = lock_key(grid_id, &cell_key);
        let record = LockRecord {
            holder: session.user_id(),
            token,
        };
        let result = match record.encode() {
            Ok(expected) => self.ephemeral.expire_if_eq(&key, &expected, self.ttl).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(renewed) => renewed,
            Err(e) => {
                log::warn!("Lock renew for {cell_key} failed: {e}");
                false
            }
        }
    }

    /// Drop the lock if `session` holds it with `token`, then broadcast
    /// `cell:lock:released`. Anything else is a silent no-op.
    pub async fn release(
        &self,
        session: &Session,
        grid_id: GridId,
        cell_key: CellKey,
        token: String,
    ) -> bool {
        let key = lock_key(grid_id, &cell_key);
        let record = LockRecord {
            holder: session.user_id(),
            token,
        };
        let result = match record.encode() {
            Ok(expected) => self.ephemeral.delete_if_eq(&key, &expected).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(true) => {
                log::debug!("Session {} released {cell_key}", session.id());
                self.rooms
                    .broadcast(
                        &grid_id,
                        ServerEvent::LockReleased(LockNotice::released(cell_key)),
                        None,
                    )
                    .await;
                true
            }
            Ok(false) => false,
            Err(e) => {
                log::warn!("Lock release for {cell_key} failed: {e}");
                false
            }
        }
    }

    /// Current lock record and its remaining TTL.
    pub async fn holder(
        &self,
        grid_id: GridId,
        cell_key: &CellKey,
    ) -> StoreResult<Option<(LockRecord, Option<Duration>)>> {
        let key = lock_key(grid_id, cell_key);
        let Some(raw) = self.ephemeral.get(&key).await? else {
            return Ok(None);
        };
        let record: LockRecord = serde_json::from_str(&raw)?;
        let ttl = self.ephemeral.ttl(&key).await?;
        Ok(Some((record, ttl)))
    }

    async fn current_holder(&self, key: &str) -> (Option<UserEntry>, Duration) {
        let record = match self.ephemeral.get(key).await {
            Ok(Some(raw)) => serde_json::from_str::<LockRecord>(&raw).ok(),
            Ok(None) => None,
            Err(e) => {
                log::debug!("Could not read lock {key}: {e}");
                None
            }
        };
        let holder = match record {
            Some(record) => Some(self.directory.resolve(record.holder).await),
            None => None,
        };
        let ttl = self.ephemeral.ttl(key).await.ok().flatten().unwrap_or(self.ttl);
        (holder, ttl)
    }

    fn deny(
        &self,
        session: &Session,
        cell_key: CellKey,
        holder: Option<UserEntry>,
        ttl: Duration,
    ) -> AcquireOutcome {
        session.send(ServerEvent::LockDenied(LockNotice::denied(
            cell_key,
            holder.clone(),
            ttl.as_millis() as u64,
        )));
        AcquireOutcome::Denied { holder, ttl }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::BroadcastGroup;
    use crate::storage::MemoryEphemeralStore;
    use gridsync_core::Identity;
    use uuid::Uuid;

    struct Fixture {
        store: Arc<MemoryEphemeralStore>,
        rooms: Arc<RoomManager>,
        locks: LockManager,
        grid: GridId,
        key: CellKey,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryEphemeralStore::new());
        let rooms = Arc::new(RoomManager::new(32));
        let locks = LockManager::new(
            store.clone(),
            UserDirectory::new(store.clone()),
            rooms.clone(),
            DEFAULT_LOCK_TTL,
        );
        Fixture {
            store,
            rooms,
            locks,
            grid: Uuid::new_v4(),
            key: CellKey::new(Uuid::new_v4(), 2, 3),
        }
    }

    fn named(name: &str) -> Session {
        Session::new(Some(Identity {
            id: Uuid::new_v4(),
            display_name: name.to_string(),
        }))
    }

    async fn watch(rooms: &RoomManager, grid: GridId) -> (Arc<BroadcastGroup>, Session) {
        let room = rooms.get_or_create(grid).await;
        let mut watcher = Session::new(None);
        let rx = room.add_peer(watcher.id(), watcher.user_entry()).await;
        watcher.subscribe(rx);
        (room, watcher)
    }

    #[tokio::test]
    async fn test_second_acquire_denied_with_holder() {
        let f = fixture();
        let (_room, mut watcher) = watch(&f.rooms, f.grid).await;
        let mut alice = named("Alice");
        let mut bob = named("Bob");

        let granted = f.locks.acquire(&alice, f.grid, f.key, "a-1".into()).await;
        assert!(granted.is_granted());

        let denied = f.locks.acquire(&bob, f.grid, f.key, "b-1".into()).await;
        match denied {
            AcquireOutcome::Denied { holder, ttl } => {
                assert_eq!(holder.unwrap().display_name, "Alice");
                assert!(ttl <= DEFAULT_LOCK_TTL);
            }
            other => panic!("Expected denial, got {other:?}"),
        }

        // Denial goes to the requester only, the grant to the room
        match bob.try_next_event() {
            Some(ServerEvent::LockDenied(notice)) => {
                assert_eq!(notice.cell_key, f.key);
                assert_eq!(notice.holder.unwrap().display_name, "Alice");
                assert!(notice.token.is_none());
            }
            other => panic!("Expected denied notice, got {other:?}"),
        }
        assert!(alice.try_next_event().is_none());
        match watcher.try_next_event() {
            Some(ServerEvent::LockGranted(notice)) => {
                assert_eq!(notice.token.as_deref(), Some("a-1"));
                assert_eq!(notice.ttl_ms, Some(5000));
            }
            other => panic!("Expected granted notice, got {other:?}"),
        }
        assert!(watcher.try_next_event().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_lapses_after_ttl() {
        let f = fixture();
        let alice = named("Alice");
        let bob = named("Bob");

        assert!(f.locks.acquire(&alice, f.grid, f.key, "a".into()).await.is_granted());
        tokio::time::advance(DEFAULT_LOCK_TTL + Duration::from_millis(1)).await;

        assert!(f.locks.acquire(&bob, f.grid, f.key, "b".into()).await.is_granted());
        let (record, _) = f.locks.holder(f.grid, &f.key).await.unwrap().unwrap();
        assert_eq!(record.holder, bob.user_id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_requires_matching_token() {
        let f = fixture();
        let alice = named("Alice");
        f.locks.acquire(&alice, f.grid, f.key, "tok".into()).await;

        tokio::time::advance(Duration::from_millis(4000)).await;
        assert!(!f.locks.renew(&alice, f.grid, f.key, "other".into()).await);
        // Same token from another user does not count as the holder
        assert!(!f.locks.renew(&named("Bob"), f.grid, f.key, "tok".into()).await);
        assert!(f.locks.renew(&alice, f.grid, f.key, "tok".into()).await);

        tokio::time::advance(Duration::from_millis(4000)).await;
        assert!(f.locks.holder(f.grid, &f.key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_release_with_stale_token_is_noop() {
        let f = fixture();
        let (_room, mut watcher) = watch(&f.rooms, f.grid).await;
        let alice = named("Alice");
        let bob = named("Bob");
        f.locks.acquire(&alice, f.grid, f.key, "tok".into()).await;
        watcher.drain_events();

        assert!(!f.locks.release(&alice, f.grid, f.key, "stale".into()).await);
        assert!(!f.locks.release(&bob, f.grid, f.key, "tok".into()).await);
        assert!(watcher.try_next_event().is_none());
        assert!(f.locks.holder(f.grid, &f.key).await.unwrap().is_some());

        assert!(f.locks.release(&alice, f.grid, f.key, "tok".into()).await);
        assert_eq!(
            watcher.try_next_event(),
            Some(ServerEvent::LockReleased(LockNotice::released(f.key)))
        );
        assert!(f.locks.holder(f.grid, &f.key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unavailable_store_denies_with_empty_holder() {
        let f = fixture();
        let mut alice = named("Alice");
        f.store.set_available(false);

        let outcome = f.locks.acquire(&alice, f.grid, f.key, "tok".into()).await;
        assert_eq!(
            outcome,
            AcquireOutcome::Denied {
                holder: None,
                ttl: DEFAULT_LOCK_TTL
            }
        );
        match alice.try_next_event() {
            Some(ServerEvent::LockDenied(notice)) => assert!(notice.holder.is_none()),
            other => panic!("Expected denied notice, got {other:?}"),
        }
    }
}
