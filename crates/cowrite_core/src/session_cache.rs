//! Client-local session persistence for silent rejoin.
//!
//! One record per room (key = `cowrite.session.{room_id}`) so identities
//! never bleed across rooms. A record is valid for 24 hours from its
//! `last_activity`; expiry is purely a client-side judgment. The server
//! only trusts membership history within the room's own lifetime, so an
//! expired (or unknown) resume id simply falls back to a fresh join.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// A persisted client identity for one room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSession {
    pub user_id: String,
    pub nickname: String,
    pub room_id: String,
    pub last_activity: DateTime<Utc>,
}

/// String key-value storage backing the cache (the localStorage shape).
pub trait SessionStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

/// In-memory store, used in tests and short-lived processes.
#[derive(Default)]
pub struct MemorySessionStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.to_string(), value.to_string());
        }
    }

    fn remove(&self, key: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(key);
        }
    }
}

/// JSON-file-backed store for native clients. Storage failures are logged
/// and treated as a missing record; persistence is best-effort by design.
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(&self) -> HashMap<String, String> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => HashMap::new(),
        }
    }

    fn save(&self, entries: &HashMap<String, String>) {
        let raw = match serde_json::to_string(entries) {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("[SessionCache] Failed to serialize session file: {}", e);
                return;
            }
        };
        if let Err(e) = std::fs::write(&self.path, raw) {
            log::warn!("[SessionCache] Failed to write session file: {}", e);
        }
    }
}

impl SessionStore for FileSessionStore {
    fn get(&self, key: &str) -> Option<String> {
        self.load().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        let mut entries = self.load();
        entries.insert(key.to_string(), value.to_string());
        self.save(&entries);
    }

    fn remove(&self, key: &str) {
        let mut entries = self.load();
        if entries.remove(key).is_some() {
            self.save(&entries);
        }
    }
}

/// TTL-checked view over a [`SessionStore`].
pub struct SessionCache<S> {
    store: S,
    ttl: TimeDelta,
}

impl<S: SessionStore> SessionCache<S> {
    /// Create a cache with the standard 24-hour TTL.
    pub fn new(store: S) -> Self {
        Self {
            store,
            ttl: TimeDelta::hours(24),
        }
    }

    /// Override the TTL (tests, embedded deployments).
    pub fn with_ttl(store: S, ttl: TimeDelta) -> Self {
        Self { store, ttl }
    }

    fn key(room_id: &str) -> String {
        format!("cowrite.session.{}", room_id)
    }

    /// Look up a non-expired session for a room. Expired or malformed
    /// records are removed and reported as absent.
    pub fn get(&self, room_id: &str, now: DateTime<Utc>) -> Option<StoredSession> {
        let key = Self::key(room_id);
        let raw = self.store.get(&key)?;

        let session: StoredSession = match serde_json::from_str(&raw) {
            Ok(s) => s,
            Err(e) => {
                log::warn!("[SessionCache] Dropping malformed session for {}: {}", room_id, e);
                self.store.remove(&key);
                return None;
            }
        };

        if now - session.last_activity > self.ttl {
            log::debug!("[SessionCache] Session for {} expired", room_id);
            self.store.remove(&key);
            return None;
        }

        Some(session)
    }

    /// Persist (or replace) the session for its room.
    pub fn put(&self, session: &StoredSession) {
        match serde_json::to_string(session) {
            Ok(raw) => self.store.set(&Self::key(&session.room_id), &raw),
            Err(e) => log::warn!("[SessionCache] Failed to serialize session: {}", e),
        }
    }

    /// Bump `last_activity` on the stored record, if present.
    pub fn touch(&self, room_id: &str, now: DateTime<Utc>) {
        if let Some(mut session) = self.get(room_id, now) {
            session.last_activity = now;
            self.put(&session);
        }
    }

    /// Forget the session for a room (explicit leave, room closed).
    pub fn clear(&self, room_id: &str) {
        self.store.remove(&Self::key(room_id));
    }
}
