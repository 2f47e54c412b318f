//! Short-lived key/value state with expiry: locks, presence sets, user cache.
//!
//! Only the primitives the lock manager and presence tracker need are exposed.
//! The compare-and-set variants (`expire_if_eq`, `delete_if_eq`) make token
//! checks and the mutation one atomic step.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{StoreError, StoreResult};

/// TTL key/value store with small string sets.
#[async_trait]
pub trait EphemeralStore: Send + Sync {
    /// Set `key` only if it does not exist. Returns `true` when written.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Reset the expiry of an existing key.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Reset the expiry only if the current value equals `expected`.
    async fn expire_if_eq(&self, key: &str, expected: &str, ttl: Duration) -> StoreResult<bool>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Remaining time to live. `None` for missing keys or keys without expiry.
    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>>;

    /// Unconditional write; `ttl: None` never expires.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Delete only if the current value equals `expected`.
    async fn delete_if_eq(&self, key: &str, expected: &str) -> StoreResult<bool>;

    /// Add a member; creates the set without expiry if missing.
    async fn set_add(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// Remove a member; an emptied set is deleted.
    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// Members in lexical order.
    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>>;
}

#[derive(Debug, Clone)]
enum Slot {
    Text(String),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    slot: Slot,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process [`EphemeralStore`].
///
/// Expiry uses the tokio clock so tests can pause and advance time. Expired
/// entries are dropped lazily on access and by [`spawn_sweeper`](Self::spawn_sweeper).
pub struct MemoryEphemeralStore {
    entries: Mutex<HashMap<String, Entry>>,
    available: AtomicBool,
}

impl Default for MemoryEphemeralStore {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl MemoryEphemeralStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the backend going away (every call fails with `Unavailable`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Drop every expired entry. Returns the number removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.expired(now));
        before - entries.len()
    }

    /// Number of live keys.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .await
            .values()
            .filter(|e| !e.expired(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Periodically purge expired entries until the store is dropped.
    pub fn spawn_sweeper(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(&self);
        drop(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let purged = store.purge_expired().await;
                if purged > 0 {
                    log::trace!("Ephemeral sweeper purged {purged} expired keys");
                }
            }
        })
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("ephemeral store offline".to_string()))
        }
    }
}

/// Live entry for `key`, dropping it first if it has expired.
fn live<'a>(entries: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    let now = Instant::now();
    if entries.get(key).is_some_and(|e| e.expired(now)) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

fn text_of<'a>(key: &str, entry: &'a Entry) -> StoreResult<&'a str> {
    match &entry.slot {
        Slot::Text(value) => Ok(value),
        Slot::Set(_) => Err(StoreError::WrongType(key.to_string())),
    }
}

#[async_trait]
impl EphemeralStore for MemoryEphemeralStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        if live(&mut entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                slot: Slot::Text(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        match live(&mut entries, key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn expire_if_eq(&self, key: &str, expected: &str, ttl: Duration) -> StoreResult<bool> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        let Some(entry) = live(&mut entries, key) else {
            return Ok(false);
        };
        if text_of(key, entry)? != expected {
            return Ok(false);
        }
        entry.expires_at = Some(Instant::now() + ttl);
        Ok(true)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        match live(&mut entries, key) {
            Some(entry) => Ok(Some(text_of(key, entry)?.to_string())),
            None => Ok(None),
        }
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        Ok(live(&mut entries, key)
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now())))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                slot: Slot::Text(value.to_string()),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        let existed = live(&mut entries, key).is_some();
        entries.remove(key);
        Ok(existed)
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> StoreResult<bool> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        let Some(entry) = live(&mut entries, key) else {
            return Ok(false);
        };
        if text_of(key, entry)? != expected {
            return Ok(false);
        }
        entries.remove(key);
        Ok(true)
    }

    async fn set_add(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        if live(&mut entries, key).is_none() {
            entries.insert(
                key.to_string(),
                Entry {
                    slot: Slot::Set(BTreeSet::new()),
                    expires_at: None,
                },
            );
        }
        match entries.get_mut(key).map(|e| &mut e.slot) {
            Some(Slot::Set(members)) => Ok(members.insert(member.to_string())),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        let Some(entry) = live(&mut entries, key) else {
            return Ok(false);
        };
        let Slot::Set(members) = &mut entry.slot else {
            return Err(StoreError::WrongType(key.to_string()));
        };
        let removed = members.remove(member);
        if members.is_empty() {
            entries.remove(key);
        }
        Ok(removed)
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        match live(&mut entries, key).map(|e| &e.slot) {
            Some(Slot::Set(members)) => Ok(members.iter().cloned().collect()),
            Some(Slot::Text(_)) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(Vec::new()),
        }
    }
}
