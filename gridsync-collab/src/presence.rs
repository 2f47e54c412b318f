//! Which users are looking at which cell.
//!
//! Membership per cell lives in a TTL'd set `presence:{gridId}:{cellKey}` of
//! user ids. Every focus refreshes the TTL, so a client that disappears
//! without blurring drops out once the set expires. Each change is broadcast
//! to the whole grid room as the resolved member list.

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use gridsync_core::{CellKey, GridId, UserEntry, UserId};

use crate::broadcast::RoomManager;
use crate::directory::UserDirectory;
use crate::protocol::{PresenceUpdate, ServerEvent};
use crate::storage::{EphemeralStore, StoreResult};

pub const DEFAULT_PRESENCE_TTL: Duration = Duration::from_millis(7000);

/// Stable cursor colour for a user, as `#rrggbb`.
///
/// The hue comes from the id; saturation and lightness are fixed so every
/// colour reads well on a white grid.
pub fn color_for(id: Uuid) -> String {
    let hue = (id.as_u128() % 360) as f32 / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.5);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

pub fn presence_key(grid_id: GridId, cell_key: &CellKey) -> String {
    format!("presence:{grid_id}:{cell_key}")
}

pub struct PresenceTracker {
    ephemeral: Arc<dyn EphemeralStore>,
    directory: UserDirectory,
    rooms: Arc<RoomManager>,
    ttl: Duration,
}

impl PresenceTracker {
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

    /// Mark `user` as focused on `cell_key` and broadcast the new member list.
    pub async fn focus(
        &self,
        grid_id: GridId,
        cell_key: CellKey,
        user: &UserEntry,
    ) -> StoreResult<Vec<UserEntry>> {
        self.directory.upsert(user).await?;

        let key = presence_key(grid_id, &cell_key);
        self.ephemeral.set_add(&key, &user.user_id.to_string()).await?;
        self.ephemeral.expire(&key, self.ttl).await?;

        log::trace!("{} focused {cell_key} in grid {grid_id}", user.display_name);
        self.publish(grid_id, cell_key).await
    }

    /// Remove `user_id` from `cell_key` and broadcast the new member list.
    pub async fn blur(
        &self,
        grid_id: GridId,
        cell_key: CellKey,
        user_id: UserId,
    ) -> StoreResult<Vec<UserEntry>> {
        let key = presence_key(grid_id, &cell_key);
        self.ephemeral.set_remove(&key, &user_id.to_string()).await?;

        log::trace!("{user_id} blurred {cell_key} in grid {grid_id}");
        self.publish(grid_id, cell_key).await
    }

    /// Resolved members of a cell, ordered by display name then id.
    pub async fn members(&self, grid_id: GridId, cell_key: &CellKey) -> StoreResult<Vec<UserEntry>> {
        let raw = self
            .ephemeral
            .set_members(&presence_key(grid_id, cell_key))
            .await?;

        let mut users = Vec::with_capacity(raw.len());
        for member in raw {
            match Uuid::parse_str(&member) {
                Ok(user_id) => users.push(self.directory.resolve(user_id).await),
                Err(_) => log::warn!("Ignoring malformed presence member {member:?}"),
            }
        }
        users.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then(a.user_id.cmp(&b.user_id))
        });
        Ok(users)
    }

    async fn publish(&self, grid_id: GridId, cell_key: CellKey) -> StoreResult<Vec<UserEntry>> {
        let users = self.members(grid_id, &cell_key).await?;
        self.rooms
            .broadcast(
                &grid_id,
                ServerEvent::Presence(PresenceUpdate {
                    cell_key,
                    users: users.clone(),
                }),
                None,
            )
            .await;
        Ok(users)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryEphemeralStore;

    fn tracker() -> (PresenceTracker, Arc<RoomManager>) {
        let ephemeral: Arc<dyn EphemeralStore> = Arc::new(MemoryEphemeralStore::new());
        let rooms = Arc::new(RoomManager::new(16));
        let tracker = PresenceTracker::new(
            ephemeral.clone(),
            UserDirectory::new(ephemeral),
            rooms.clone(),
            DEFAULT_PRESENCE_TTL,
        );
        (tracker, rooms)
    }

    fn user(name: &str) -> UserEntry {
        let user_id = Uuid::new_v4();
        UserEntry {
            user_id,
            display_name: name.to_string(),
            color: color_for(user_id),
        }
    }

    #[test]
    fn test_color_is_stable_hex() {
        let id = Uuid::new_v4();
        let color = color_for(id);
        assert_eq!(color, color_for(id));
        assert_eq!(color.len(), 7);
        assert!(color.starts_with('#'));
        assert!(color[1..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_hsl_primary_hues() {
        let (r, g, b) = hsl_to_rgb(0.0, 1.0, 0.5);
        assert!((r - 1.0).abs() < 1e-5 && g.abs() < 1e-5 && b.abs() < 1e-5);
        let (r, g, b) = hsl_to_rgb(1.0 / 3.0, 1.0, 0.5);
        assert!(r.abs() < 1e-5 && (g - 1.0).abs() < 1e-5 && b.abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_focus_and_blur_broadcast_members() {
        let (tracker, rooms) = tracker();
        let grid = Uuid::new_v4();
        let key = CellKey::new(Uuid::new_v4(), 2, 2);
        let room = rooms.get_or_create(grid).await;
        let mut rx = room.add_peer(Uuid::new_v4(), user("Watcher")).await;

        let bob = user("Bob");
        let alice = user("Alice");
        tracker.focus(grid, key, &bob).await.unwrap();
        let members = tracker.focus(grid, key, &alice).await.unwrap();
        assert_eq!(members, vec![alice.clone(), bob.clone()]);

        let remaining = tracker.blur(grid, key, alice.user_id).await.unwrap();
        assert_eq!(remaining, vec![bob.clone()]);

        let mut last = None;
        while let Ok(frame) = rx.try_recv() {
            last = Some(frame.event.clone());
        }
        assert_eq!(
            last,
            Some(ServerEvent::Presence(PresenceUpdate {
                cell_key: key,
                users: vec![bob],
            }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_expires_without_refresh() {
        let (tracker, _rooms) = tracker();
        let grid = Uuid::new_v4();
        let key = CellKey::new(Uuid::new_v4(), 0, 0);

        tracker.focus(grid, key, &user("Ghost")).await.unwrap();
        tokio::time::advance(DEFAULT_PRESENCE_TTL + Duration::from_millis(1)).await;

        assert!(tracker.members(grid, &key).await.unwrap().is_empty());
    }
}
