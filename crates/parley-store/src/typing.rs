//! Typing indicator tracking.
//!
//! Maintains, per conversation, the set of users currently typing together
//! with the instant each indicator expires. Callers pass the current
//! [`Instant`] explicitly so expiry is deterministic under test.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use tracing::debug;

use parley_shared::types::{ConversationId, UserId};

/// Tracks who is typing where, with per-entry expiry.
#[derive(Debug, Clone)]
pub struct TypingTracker {
    own_user: UserId,
    entries: HashMap<ConversationId, BTreeMap<UserId, Instant>>,
}

impl TypingTracker {
    /// Create a tracker that ignores notices about `own_user`.
    pub fn new(own_user: UserId) -> Self {
        Self {
            own_user,
            entries: HashMap::new(),
        }
    }

    /// Record (or refresh) a typing indicator.
    ///
    /// Each call reschedules the expiry to `now + ttl`. Returns `true` when
    /// the user was not already shown as typing.
    pub fn set_typing(
        &mut self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        ttl: Duration,
        now: Instant,
    ) -> bool {
        if *user_id == self.own_user {
            return false;
        }
        let users = self.entries.entry(conversation_id.clone()).or_default();
        let was_active = users.get(user_id).is_some_and(|expiry| *expiry > now);
        users.insert(user_id.clone(), now + ttl);
        if !was_active {
            debug!(conversation = %conversation_id, user = %user_id, "User started typing");
        }
        !was_active
    }

    /// Remove a typing indicator. Returns `true` if one was present.
    pub fn clear_typing(&mut self, conversation_id: &ConversationId, user_id: &UserId) -> bool {
        let Some(users) = self.entries.get_mut(conversation_id) else {
            return false;
        };
        let removed = users.remove(user_id).is_some();
        if users.is_empty() {
            self.entries.remove(conversation_id);
        }
        removed
    }

    /// Users currently typing in a conversation, sorted by id.
    ///
    /// Expired entries are skipped even if the sweep has not run yet.
    pub fn typing_users(&self, conversation_id: &ConversationId, now: Instant) -> Vec<UserId> {
        self.entries
            .get(conversation_id)
            .map(|users| {
                users
                    .iter()
                    .filter(|(_, expiry)| **expiry > now)
                    .map(|(user, _)| user.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Purge expired entries and return the conversations whose typing set
    /// changed.
    pub fn sweep(&mut self, now: Instant) -> Vec<ConversationId> {
        let mut changed = Vec::new();
        self.entries.retain(|conversation_id, users| {
            let before = users.len();
            users.retain(|_, expiry| *expiry > now);
            if users.len() != before {
                changed.push(conversation_id.clone());
            }
            !users.is_empty()
        });
        changed
    }

    /// Drop every indicator (reconnect, logout).
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
