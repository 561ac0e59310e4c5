//! Process-wide room registry.
//!
//! An explicit object constructed once at startup and handed to the
//! gateway, the REST handlers, and the eviction task, so tests can spin up
//! isolated instances.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use super::room::Room;

/// Registry-level statistics for the stats endpoint.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub active_rooms: usize,
    pub active_connections: usize,
}

pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    capacity: usize,
    history_limit: usize,
}

impl RoomRegistry {
    pub fn new(capacity: usize, history_limit: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity,
            history_limit,
        }
    }

    /// Allocate a new empty room.
    pub async fn create_room(&self) -> Arc<Room> {
        let id = Uuid::new_v4().to_string();
        let room = Arc::new(Room::new(
            id.clone(),
            self.capacity,
            self.history_limit,
            Utc::now(),
        ));

        let mut rooms = self.rooms.write().await;
        rooms.insert(id.clone(), room.clone());
        info!("Created room {} ({} rooms active)", id, rooms.len());
        room
    }

    pub async fn get(&self, room_id: &str) -> Option<Arc<Room>> {
        let rooms = self.rooms.read().await;
        rooms.get(room_id).cloned()
    }

    pub async fn exists(&self, room_id: &str) -> bool {
        let rooms = self.rooms.read().await;
        rooms.contains_key(room_id)
    }

    /// Destroy rooms idle past `expiry`. Each room's own lock arbitrates
    /// the race with in-flight joins; a closed room is unreachable through
    /// the registry afterwards.
    pub async fn evict_idle(&self, now: DateTime<Utc>, expiry: TimeDelta) -> usize {
        let candidates: Vec<(String, Arc<Room>)> = {
            let rooms = self.rooms.read().await;
            rooms.iter().map(|(id, r)| (id.clone(), r.clone())).collect()
        };

        let mut evicted = 0;
        for (id, room) in candidates {
            if room.close_if_idle(now, expiry).await {
                let mut rooms = self.rooms.write().await;
                rooms.remove(&id);
                evicted += 1;
            }
        }

        if evicted > 0 {
            info!("Evicted {} idle room(s)", evicted);
        }
        evicted
    }

    /// Close every room (process shutdown). Members receive `room-closed`
    /// so clients clear their local state instead of retrying a resume.
    pub async fn close_all(&self) {
        let rooms: Vec<Arc<Room>> = {
            let mut rooms = self.rooms.write().await;
            rooms.drain().map(|(_, r)| r).collect()
        };
        for room in rooms {
            room.close().await;
        }
    }

    pub async fn stats(&self) -> RegistryStats {
        let rooms: Vec<Arc<Room>> = {
            let rooms = self.rooms.read().await;
            rooms.values().cloned().collect()
        };

        let mut active_connections = 0;
        for room in &rooms {
            active_connections += room.online_count().await;
        }

        RegistryStats {
            active_rooms: rooms.len(),
            active_connections,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cowrite_core::protocol::ErrorCode;

    #[tokio::test]
    async fn created_room_is_reachable() {
        let registry = RoomRegistry::new(8, 100);
        let room = registry.create_room().await;

        assert!(registry.exists(room.id()).await);
        assert!(registry.get(room.id()).await.is_some());
        assert!(!registry.exists("nope").await);
    }

    #[tokio::test]
    async fn eviction_removes_idle_rooms_and_later_joins_fail() {
        let registry = RoomRegistry::new(8, 100);
        let room = registry.create_room().await;
        let id = room.id().to_string();

        let later = Utc::now() + TimeDelta::hours(2);
        let evicted = registry.evict_idle(later, TimeDelta::minutes(30)).await;
        assert_eq!(evicted, 1);
        assert!(!registry.exists(&id).await);

        // A stale Arc held across the eviction sees the closed flag
        let err = room.join("late", None, 1, later).await.unwrap_err();
        assert_eq!(err, ErrorCode::RoomNotFound);
    }

    #[tokio::test]
    async fn eviction_spares_rooms_with_online_members() {
        let registry = RoomRegistry::new(8, 100);
        let room = registry.create_room().await;
        room.join("a", None, 1, Utc::now()).await.unwrap();

        let later = Utc::now() + TimeDelta::hours(2);
        assert_eq!(registry.evict_idle(later, TimeDelta::minutes(30)).await, 0);
        assert!(registry.exists(room.id()).await);
    }

    #[tokio::test]
    async fn close_all_notifies_members_and_empties_the_registry() {
        use cowrite_core::protocol::ServerEvent;

        let registry = RoomRegistry::new(8, 100);
        let room = registry.create_room().await;
        let mut snap = room.join("a", None, 1, Utc::now()).await.unwrap();

        registry.close_all().await;
        assert_eq!(registry.stats().await.active_rooms, 0);

        let mut saw_closed = false;
        while let Ok(frame) = snap.frames.try_recv() {
            let ev: ServerEvent = serde_json::from_str(&frame.payload).unwrap();
            if matches!(ev, ServerEvent::RoomClosed { .. }) {
                saw_closed = true;
            }
        }
        assert!(saw_closed);

        let err = room.join("b", None, 2, Utc::now()).await.unwrap_err();
        assert_eq!(err, ErrorCode::RoomNotFound);
    }

    #[tokio::test]
    async fn stats_count_online_members_across_rooms() {
        let registry = RoomRegistry::new(8, 100);
        let r1 = registry.create_room().await;
        let r2 = registry.create_room().await;
        r1.join("a", None, 1, Utc::now()).await.unwrap();
        r1.join("b", None, 2, Utc::now()).await.unwrap();
        r2.join("c", None, 3, Utc::now()).await.unwrap();
        r1.connection_closed(2, Utc::now()).await;

        let stats = registry.stats().await;
        assert_eq!(stats.active_rooms, 2);
        assert_eq!(stats.active_connections, 2);
    }
}
