//! Online presence of other users, fed by `user:status` push events.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use parley_shared::types::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Presence {
    pub online: bool,
    /// When the status was last reported.
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct PresenceTracker {
    users: HashMap<UserId, Presence>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a status report. Returns `true` if the online flag changed.
    pub fn update(&mut self, user_id: &UserId, online: bool, at: DateTime<Utc>) -> bool {
        let previous = self.users.insert(user_id.clone(), Presence { online, since: at });
        let changed = previous.map_or(true, |p| p.online != online);
        if changed {
            debug!(user = %user_id, online, "Presence changed");
        }
        changed
    }

    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.users.get(user_id).is_some_and(|p| p.online)
    }

    pub fn get(&self, user_id: &UserId) -> Option<Presence> {
        self.users.get(user_id).copied()
    }

    pub fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .users
            .iter()
            .filter(|(_, p)| p.online)
            .map(|(id, _)| id.clone())
            .collect();
        users.sort();
        users
    }

    /// Forget everything; statuses are stale once the push channel drops.
    pub fn clear(&mut self) {
        self.users.clear();
    }
}
