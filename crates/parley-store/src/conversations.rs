//! The conversation index.
//!
//! Conversations are kept in a map plus a display-order index sorted by
//! (pinned first, newest activity first). Every mutation that can change the
//! sort key repositions the single affected id.

use std::cmp::{Ordering, Reverse};
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use parley_shared::models::{Conversation, MessageSummary};
use parley_shared::types::{ConversationId, UserId};

use crate::error::{Result, StoreError};
use crate::filter::ConversationFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Incoming copy was older than the stored one and was ignored.
    Stale,
}

#[derive(Debug, Default)]
pub struct ConversationStore {
    conversations: HashMap<ConversationId, Conversation>,
    order: Vec<ConversationId>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or merge a conversation by last-writer-wins on `updated_at`.
    ///
    /// The unread count is never lowered here; only [`set_unread`] and
    /// [`apply_read_receipt`] may do that.
    ///
    /// [`set_unread`]: Self::set_unread
    /// [`apply_read_receipt`]: Self::apply_read_receipt
    pub fn upsert(&mut self, incoming: Conversation) -> Result<UpsertOutcome> {
        incoming.validate()?;
        let id = incoming.id.clone();

        let outcome = match self.conversations.get_mut(&id) {
            None => {
                self.conversations.insert(id.clone(), incoming);
                UpsertOutcome::Inserted
            }
            Some(existing) if incoming.updated_at < existing.updated_at => {
                debug!(conversation = %id, "Ignoring stale conversation update");
                return Ok(UpsertOutcome::Stale);
            }
            Some(existing) => {
                let unread = existing.unread_count.max(incoming.unread_count);
                let last_message = newest(existing.last_message.take(), incoming.last_message.clone());
                *existing = incoming;
                existing.unread_count = unread;
                existing.last_message = last_message;
                UpsertOutcome::Updated
            }
        };

        self.reposition(&id);
        Ok(outcome)
    }

    /// Fold a new message into the conversation summary.
    ///
    /// Unread grows by one only for messages from other users while the
    /// conversation is not the active selection. Returns the new unread count.
    pub fn apply_last_message(
        &mut self,
        id: &ConversationId,
        summary: MessageSummary,
        is_active: bool,
        own_user: &UserId,
    ) -> Result<u32> {
        let conversation = self
            .conversations
            .get_mut(id)
            .ok_or_else(|| StoreError::ConversationNotFound(id.clone()))?;

        if !is_active && summary.sender_id != *own_user {
            conversation.unread_count += 1;
        }
        if summary.timestamp > conversation.updated_at {
            conversation.updated_at = summary.timestamp;
        }
        conversation.last_message = newest(conversation.last_message.take(), Some(summary));
        let unread = conversation.unread_count;

        self.reposition(id);
        Ok(unread)
    }

    /// Swap the summary of a message already shown as `last_message`, found
    /// by its sender and the timestamp it was summarised with. Used when the
    /// server copy of that message differs (confirmed send, edit, delete);
    /// its timestamp wins even if older. Returns `false` when another message
    /// has become the newest in the meantime.
    pub fn replace_last_message(
        &mut self,
        id: &ConversationId,
        summarised_at: DateTime<Utc>,
        summary: MessageSummary,
    ) -> Result<bool> {
        let conversation = self
            .conversations
            .get_mut(id)
            .ok_or_else(|| StoreError::ConversationNotFound(id.clone()))?;
        let matches = conversation
            .last_message
            .as_ref()
            .is_some_and(|m| m.timestamp == summarised_at && m.sender_id == summary.sender_id);
        if !matches {
            return Ok(false);
        }
        if conversation.updated_at == summarised_at {
            conversation.updated_at = summary.timestamp;
        }
        conversation.last_message = Some(summary);

        self.reposition(id);
        Ok(true)
    }

    /// Explicitly set the unread count (selection reset).
    pub fn set_unread(&mut self, id: &ConversationId, count: u32) -> Result<()> {
        let conversation = self
            .conversations
            .get_mut(id)
            .ok_or_else(|| StoreError::ConversationNotFound(id.clone()))?;
        conversation.unread_count = count;
        Ok(())
    }

    /// Apply a server-confirmed read receipt; may lower the unread count.
    pub fn apply_read_receipt(&mut self, id: &ConversationId, unread: u32) -> Result<()> {
        self.set_unread(id, unread)
    }

    pub fn set_pinned(&mut self, id: &ConversationId, pinned: bool) -> Result<()> {
        let conversation = self
            .conversations
            .get_mut(id)
            .ok_or_else(|| StoreError::ConversationNotFound(id.clone()))?;
        conversation.is_pinned = pinned;
        self.reposition(id);
        Ok(())
    }

    pub fn set_archived(&mut self, id: &ConversationId, archived: bool) -> Result<()> {
        let conversation = self
            .conversations
            .get_mut(id)
            .ok_or_else(|| StoreError::ConversationNotFound(id.clone()))?;
        conversation.is_archived = archived;
        Ok(())
    }

    pub fn remove(&mut self, id: &ConversationId) -> Option<Conversation> {
        let removed = self.conversations.remove(id)?;
        self.order.retain(|o| o != id);
        Some(removed)
    }

    pub fn get(&self, id: &ConversationId) -> Option<&Conversation> {
        self.conversations.get(id)
    }

    pub fn contains(&self, id: &ConversationId) -> bool {
        self.conversations.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    pub fn total_unread(&self) -> u32 {
        self.conversations.values().map(|c| c.unread_count).sum()
    }

    /// Lazily filtered view in display order. The iterator is `Clone`, so a
    /// caller can restart it without recomputing anything.
    pub fn list<'a>(
        &'a self,
        filter: &'a ConversationFilter,
        now: DateTime<Utc>,
    ) -> ConversationIter<'a> {
        ConversationIter {
            ids: self.order.iter(),
            conversations: &self.conversations,
            filter,
            now,
        }
    }

    pub fn clear(&mut self) {
        self.conversations.clear();
        self.order.clear();
    }

    fn reposition(&mut self, id: &ConversationId) {
        if let Some(pos) = self.order.iter().position(|o| o == id) {
            self.order.remove(pos);
        }
        let Some(target) = self.conversations.get(id) else {
            return;
        };
        let key = sort_key(target);
        let conversations = &self.conversations;
        let idx = self
            .order
            .partition_point(|other| match conversations.get(other) {
                Some(c) => sort_key(c).cmp(&key) == Ordering::Less,
                None => true,
            });
        self.order.insert(idx, id.clone());
    }
}

fn sort_key(c: &Conversation) -> (Reverse<bool>, Reverse<DateTime<Utc>>, &ConversationId) {
    (Reverse(c.is_pinned), Reverse(c.activity_at()), &c.id)
}

fn newest(a: Option<MessageSummary>, b: Option<MessageSummary>) -> Option<MessageSummary> {
    match (a, b) {
        (Some(a), Some(b)) => Some(if b.timestamp >= a.timestamp { b } else { a }),
        (a, b) => b.or(a),
    }
}

/// Iterator returned by [`ConversationStore::list`].
#[derive(Clone)]
pub struct ConversationIter<'a> {
    ids: std::slice::Iter<'a, ConversationId>,
    conversations: &'a HashMap<ConversationId, Conversation>,
    filter: &'a ConversationFilter,
    now: DateTime<Utc>,
}

impl<'a> Iterator for ConversationIter<'a> {
    type Item = &'a Conversation;

    fn next(&mut self) -> Option<Self::Item> {
        for id in self.ids.by_ref() {
            if let Some(c) = self.conversations.get(id) {
                if self.filter.matches(c, self.now) {
                    return Some(c);
                }
            }
        }
        None
    }
}
