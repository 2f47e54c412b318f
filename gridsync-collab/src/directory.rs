//! Cache of user display metadata, keyed `user:{userId}`.
//!
//! Entries are written whenever a session focuses a cell and read back when
//! lock holders and presence members are rendered for other clients.

use std::sync::Arc;

use gridsync_core::{UserEntry, UserId};

use crate::presence::color_for;
use crate::storage::{EphemeralStore, StoreResult};

pub fn user_key(user_id: UserId) -> String {
    format!("user:{user_id}")
}

#[derive(Clone)]
pub struct UserDirectory {
    ephemeral: Arc<dyn EphemeralStore>,
}

impl UserDirectory {
    pub fn new(ephemeral: Arc<dyn EphemeralStore>) -> Self {
        Self { ephemeral }
    }

    pub async fn upsert(&self, entry: &UserEntry) -> StoreResult<()> {
        let encoded = serde_json::to_string(entry)?;
        self.ephemeral.set(&user_key(entry.user_id), &encoded, None).await
    }

    pub async fn get(&self, user_id: UserId) -> StoreResult<Option<UserEntry>> {
        match self.ephemeral.get(&user_key(user_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Stored entry, or a generated one when the user is unknown or the
    /// cache cannot be read.
    pub async fn resolve(&self, user_id: UserId) -> UserEntry {
        match self.get(user_id).await {
            Ok(Some(entry)) => entry,
            Ok(None) => fallback_entry(user_id),
            Err(e) => {
                log::debug!("User directory lookup for {user_id} failed: {e}");
                fallback_entry(user_id)
            }
        }
    }
}

fn fallback_entry(user_id: UserId) -> UserEntry {
    UserEntry {
        user_id,
        display_name: format!("User-{}", &user_id.to_string()[..8]),
        color: color_for(user_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryEphemeralStore;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_upsert_then_resolve() {
        let directory = UserDirectory::new(Arc::new(MemoryEphemeralStore::new()));
        let entry = UserEntry {
            user_id: Uuid::new_v4(),
            display_name: "Linus".to_string(),
            color: "#102030".to_string(),
        };

        directory.upsert(&entry).await.unwrap();
        assert_eq!(directory.resolve(entry.user_id).await, entry);
    }

    #[tokio::test]
    async fn test_unknown_user_gets_generated_entry() {
        let store = Arc::new(MemoryEphemeralStore::new());
        let directory = UserDirectory::new(store.clone());
        let id = Uuid::new_v4();

        let entry = directory.resolve(id).await;
        assert_eq!(entry.user_id, id);
        assert!(entry.display_name.starts_with("User-"));
        assert_eq!(entry.color, color_for(id));

        store.set_available(false);
        assert_eq!(directory.resolve(id).await, entry);
    }
}
