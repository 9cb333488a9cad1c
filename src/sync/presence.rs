//! Presence tracker — who is on a canvas, where their cursor is, what they
//! have selected.
//!
//! DESIGN
//! ======
//! Purely ephemeral and informational. Nothing here is consulted for
//! ownership decisions. Cursor updates are last-writer-wins on the sender's
//! timestamp, so a delayed cursor frame never drags a cursor backwards. A
//! user with several open connections stays present until the last one
//! disconnects or goes quiet for longer than the presence timeout.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sync::event::Position;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: Uuid,
    pub display_name: String,
    #[serde(default)]
    pub cursor: Option<Position>,
    pub last_seen: i64,
    #[serde(default)]
    pub selected: Vec<Uuid>,
}

#[derive(Debug)]
struct Entry {
    record: PresenceRecord,
    connections: usize,
    cursor_at: i64,
}

#[derive(Debug)]
pub struct PresenceTracker {
    timeout_ms: i64,
    entries: Mutex<HashMap<Uuid, Entry>>,
}

impl PresenceTracker {
    #[must_use]
    pub fn new(timeout_ms: i64) -> Self {
        Self { timeout_ms, entries: Mutex::new(HashMap::new()) }
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<Uuid, Entry>) -> T) -> T {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut entries)
    }

    /// Register a connection for `user_id`. Returns the current record.
    pub fn connect(&self, user_id: Uuid, display_name: &str, now: i64) -> PresenceRecord {
        self.with_entries(|entries| {
            let entry = entries.entry(user_id).or_insert_with(|| Entry {
                record: PresenceRecord {
                    user_id,
                    display_name: display_name.to_owned(),
                    cursor: None,
                    last_seen: now,
                    selected: Vec::new(),
                },
                connections: 0,
                cursor_at: i64::MIN,
            });
            entry.connections += 1;
            entry.record.display_name = display_name.to_owned();
            entry.record.last_seen = entry.record.last_seen.max(now);
            entry.record.clone()
        })
    }

    /// Returns `false` for unknown users.
    pub fn heartbeat(&self, user_id: Uuid, now: i64) -> bool {
        self.with_entries(|entries| match entries.get_mut(&user_id) {
            Some(entry) => {
                entry.record.last_seen = entry.record.last_seen.max(now);
                true
            }
            None => false,
        })
    }

    /// Apply a cursor position stamped `timestamp` by the client, received at
    /// server time `now`. The client stamp only orders cursor updates;
    /// liveness always follows `now`. Returns `false` when the update is older
    /// than the one already applied, or the user is unknown.
    pub fn move_cursor(&self, user_id: Uuid, position: Position, timestamp: i64, now: i64) -> bool {
        self.with_entries(|entries| {
            let Some(entry) = entries.get_mut(&user_id) else {
                return false;
            };
            if timestamp < entry.cursor_at {
                return false;
            }
            entry.cursor_at = timestamp;
            entry.record.cursor = Some(position);
            entry.record.last_seen = entry.record.last_seen.max(now);
            true
        })
    }

    pub fn select(&self, user_id: Uuid, selected: Vec<Uuid>, now: i64) -> bool {
        self.with_entries(|entries| match entries.get_mut(&user_id) {
            Some(entry) => {
                entry.record.selected = selected;
                entry.record.last_seen = entry.record.last_seen.max(now);
                true
            }
            None => false,
        })
    }

    /// Drop one connection. Returns `true` when the user left entirely.
    pub fn disconnect(&self, user_id: Uuid) -> bool {
        self.with_entries(|entries| {
            let Some(entry) = entries.get_mut(&user_id) else {
                return false;
            };
            entry.connections = entry.connections.saturating_sub(1);
            if entry.connections == 0 {
                entries.remove(&user_id);
                return true;
            }
            false
        })
    }

    /// Remove users idle for longer than the timeout. Returns their ids.
    pub fn prune(&self, now: i64) -> Vec<Uuid> {
        let timeout_ms = self.timeout_ms;
        self.with_entries(|entries| {
            let stale: Vec<Uuid> = entries
                .iter()
                .filter(|(_, entry)| now.saturating_sub(entry.record.last_seen) > timeout_ms)
                .map(|(id, _)| *id)
                .collect();
            for id in &stale {
                entries.remove(id);
            }
            stale
        })
    }

    #[must_use]
    pub fn get(&self, user_id: Uuid) -> Option<PresenceRecord> {
        self.with_entries(|entries| entries.get(&user_id).map(|entry| entry.record.clone()))
    }

    /// All records, ordered by display name then user id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PresenceRecord> {
        let mut records: Vec<PresenceRecord> =
            self.with_entries(|entries| entries.values().map(|entry| entry.record.clone()).collect());
        records.sort_by(|a, b| a.display_name.cmp(&b.display_name).then(a.user_id.cmp(&b.user_id)));
        records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.with_entries(|entries| entries.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[path = "presence_test.rs"]
mod tests;
