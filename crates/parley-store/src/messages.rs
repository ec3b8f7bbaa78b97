//! Ordered per-conversation message history.
//!
//! Messages of a conversation live in a `Vec` sorted by `(created_at, id)`.
//! Optimistic entries carry a temporary id until the server confirms them;
//! the alias table maps every confirmed temporary id to its server id so a
//! late confirmation or a racing push echo always lands on the same entry.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use parley_shared::constants::DELETED_MESSAGE_PLACEHOLDER;
use parley_shared::models::{Attachment, Message, MessageKind, MessageStatus, ScanStatus};
use parley_shared::protocol::MessagePage;
use parley_shared::types::{AttachmentId, ConversationId, MessageId, PageCursor, UserId};

use crate::error::{Result, StoreError};

/// Content of a message the user is about to send.
#[derive(Debug, Clone)]
pub struct Draft {
    pub sender_id: UserId,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub reply_to: Option<MessageId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A new entry was added.
    Inserted,
    /// An existing entry (possibly an optimistic one) absorbed the message.
    Merged,
}

#[derive(Debug, Default)]
struct Thread {
    messages: Vec<Message>,
    cursor: Option<PageCursor>,
    has_more: bool,
}

impl Thread {
    fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| &m.id == id)
    }
}

#[derive(Debug, Default)]
pub struct MessageStore {
    threads: HashMap<ConversationId, Thread>,
    /// Conversation of every stored message id.
    locations: HashMap<MessageId, ConversationId>,
    /// Temporary id -> server id, filled on confirmation.
    aliases: HashMap<MessageId, MessageId>,
    /// Attachment id -> id of the message carrying it.
    attachments: HashMap<AttachmentId, MessageId>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a fetched page into the conversation and record its cursor.
    /// Returns how many messages were new.
    pub fn load(&mut self, conversation_id: &ConversationId, page: MessagePage) -> usize {
        let thread = self.threads.entry(conversation_id.clone()).or_default();
        thread.cursor = page.next_cursor;
        thread.has_more = page.has_more;

        let mut inserted = 0;
        for message in page.messages {
            if &message.conversation_id != conversation_id {
                warn!(
                    message = %message.id,
                    conversation = %conversation_id,
                    "Dropping message from another conversation in page"
                );
                continue;
            }
            if self.apply_incoming(message) == ApplyOutcome::Inserted {
                inserted += 1;
            }
        }
        debug!(conversation = %conversation_id, inserted, "Loaded message page");
        inserted
    }

    /// Insert a pending entry with a fresh temporary id and status `sending`.
    pub fn append_optimistic(&mut self, conversation_id: &ConversationId, draft: Draft) -> MessageId {
        let id = MessageId::temporary();
        let message = Message {
            id: id.clone(),
            conversation_id: conversation_id.clone(),
            sender_id: draft.sender_id,
            kind: MessageKind::infer(&draft.content, &draft.attachments),
            content: draft.content,
            attachments: draft.attachments,
            status: MessageStatus::Sending,
            created_at: draft.created_at,
            reply_to: draft.reply_to,
            is_read: true,
            client_id: None,
            is_edited: false,
            is_deleted: false,
        };
        self.insert(message);
        id
    }

    /// Swap a pending entry for its server-confirmed copy.
    ///
    /// The entry keeps its slot unless the server timestamp moves it, in
    /// which case only that entry is rotated into place. If the confirmed
    /// message was already stored on its own, the pending entry collapses
    /// into it.
    pub fn reconcile(&mut self, temp_id: &MessageId, confirmed: Message) -> Result<()> {
        let Some(conversation_id) = self.locations.get(temp_id).cloned() else {
            // Already reconciled through the push echo.
            if self.aliases.contains_key(temp_id) {
                self.apply_incoming(confirmed);
                return Ok(());
            }
            return Err(StoreError::MessageNotFound(temp_id.clone()));
        };
        if conversation_id != confirmed.conversation_id {
            return Err(StoreError::ConversationMismatch {
                expected: conversation_id,
                actual: confirmed.conversation_id,
            });
        }

        let server_id = confirmed.id.clone();
        self.aliases.insert(temp_id.clone(), server_id.clone());

        if self.locations.contains_key(&server_id) {
            debug!(temp = %temp_id, message = %server_id, "Collapsing pending entry into stored echo");
            self.remove_entry(&conversation_id, temp_id);
            self.merge_into(&conversation_id, &server_id, confirmed);
            return Ok(());
        }

        let thread = self
            .threads
            .get_mut(&conversation_id)
            .ok_or_else(|| StoreError::ConversationNotFound(conversation_id.clone()))?;
        let idx = thread
            .position(temp_id)
            .ok_or_else(|| StoreError::MessageNotFound(temp_id.clone()))?;

        let entry = &mut thread.messages[idx];
        entry.id = server_id.clone();
        entry.status = entry.status.merge(confirmed.status);
        entry.created_at = confirmed.created_at;
        entry.content = confirmed.content;
        entry.kind = confirmed.kind;
        entry.client_id = Some(temp_id.clone());
        if !confirmed.attachments.is_empty() {
            entry.attachments = merge_attachments(&entry.attachments, confirmed.attachments);
        }
        for attachment in &entry.attachments {
            self.attachments.insert(attachment.id.clone(), server_id.clone());
        }
        settle(&mut thread.messages, idx);

        self.locations.remove(temp_id);
        self.locations.insert(server_id, conversation_id);
        Ok(())
    }

    /// Store a message from REST or push, de-duplicating by id, alias and
    /// echoed client id.
    pub fn apply_incoming(&mut self, message: Message) -> ApplyOutcome {
        let id = self.resolve(&message.id);
        if let Some(conversation_id) = self.locations.get(&id).cloned() {
            self.merge_into(&conversation_id, &id, message);
            return ApplyOutcome::Merged;
        }

        if let Some(client_id) = message.client_id.clone() {
            if self.locations.contains_key(&client_id) {
                if let Err(e) = self.reconcile(&client_id, message.clone()) {
                    warn!(error = %e, "Echo did not match its pending entry, storing separately");
                    self.insert(message);
                    return ApplyOutcome::Inserted;
                }
                return ApplyOutcome::Merged;
            }
        }

        self.insert(message);
        ApplyOutcome::Inserted
    }

    /// Take the edited content of a stored message. Edits of a deleted
    /// message are ignored. Returns `false` when nothing changed.
    pub fn apply_edit(&mut self, edited: &Message) -> Result<bool> {
        let message = self.get_mut(&edited.id)?;
        if message.is_deleted {
            debug!(message = %message.id, "Ignoring edit of deleted message");
            return Ok(false);
        }
        if message.is_edited && message.content == edited.content {
            return Ok(false);
        }
        message.content = edited.content.clone();
        message.is_edited = true;
        Ok(true)
    }

    /// Soft-delete a message: the entry keeps its slot, its content becomes
    /// the placeholder and its attachments are dropped.
    pub fn tombstone(&mut self, id: &MessageId) -> Result<bool> {
        let message = self.get_mut(id)?;
        if message.is_deleted {
            return Ok(false);
        }
        message.is_deleted = true;
        message.content = DELETED_MESSAGE_PLACEHOLDER.to_string();
        let dropped = std::mem::take(&mut message.attachments);
        for attachment in &dropped {
            self.attachments.remove(&attachment.id);
        }
        Ok(true)
    }

    /// Mark a message read. Returns `false` when it already was.
    pub fn mark_read(&mut self, id: &MessageId) -> Result<bool> {
        let message = self.get_mut(id)?;
        let status = message.status.merge(MessageStatus::Read);
        let changed = status != message.status || !message.is_read;
        message.status = status;
        message.is_read = true;
        Ok(changed)
    }

    /// Flag a pending entry as failed, keeping its content for a resend.
    ///
    /// Returns `false` when the entry was confirmed in the meantime.
    pub fn mark_failed(&mut self, temp_id: &MessageId) -> Result<bool> {
        let message = self.get_mut(temp_id)?;
        if message.status != MessageStatus::Sending {
            return Ok(false);
        }
        message.status = MessageStatus::Failed;
        Ok(true)
    }

    /// Put a failed entry back to `sending` under the same temporary id.
    pub fn resend(&mut self, temp_id: &MessageId) -> Result<Message> {
        let message = self.get_mut(temp_id)?;
        if message.status != MessageStatus::Failed || !message.id.is_temporary() {
            return Err(StoreError::NotPending(temp_id.clone()));
        }
        message.status = MessageStatus::Sending;
        Ok(message.clone())
    }

    /// Apply a scan transition to the attachment of a stored message.
    pub fn apply_scan_status(
        &mut self,
        attachment_id: &AttachmentId,
        status: ScanStatus,
    ) -> Result<MessageId> {
        let message_id = self
            .attachments
            .get(attachment_id)
            .cloned()
            .ok_or_else(|| StoreError::AttachmentNotFound(attachment_id.clone()))?;
        let message = self.get_mut(&message_id)?;
        let attachment = message
            .attachments
            .iter_mut()
            .find(|a| &a.id == attachment_id)
            .ok_or_else(|| StoreError::AttachmentNotFound(attachment_id.clone()))?;
        attachment.scan_status = attachment.scan_status.transition(status)?;
        Ok(message_id)
    }

    pub fn has_attachment(&self, attachment_id: &AttachmentId) -> bool {
        self.attachments.contains_key(attachment_id)
    }

    /// Current scan status of a stored attachment.
    pub fn scan_status(&self, attachment_id: &AttachmentId) -> Option<ScanStatus> {
        let message = self.get(self.attachments.get(attachment_id)?)?;
        message
            .attachments
            .iter()
            .find(|a| &a.id == attachment_id)
            .map(|a| a.scan_status)
    }

    /// Follow the alias table from a temporary id to its server id.
    pub fn resolve(&self, id: &MessageId) -> MessageId {
        self.aliases.get(id).unwrap_or(id).clone()
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        let id = self.resolve(id);
        let conversation_id = self.locations.get(&id)?;
        let thread = self.threads.get(conversation_id)?;
        thread.messages.iter().find(|m| m.id == id)
    }

    pub fn messages(&self, conversation_id: &ConversationId) -> &[Message] {
        self.threads
            .get(conversation_id)
            .map(|t| t.messages.as_slice())
            .unwrap_or(&[])
    }

    pub fn cursor(&self, conversation_id: &ConversationId) -> Option<&PageCursor> {
        self.threads.get(conversation_id)?.cursor.as_ref()
    }

    pub fn has_more(&self, conversation_id: &ConversationId) -> bool {
        self.threads
            .get(conversation_id)
            .is_some_and(|t| t.has_more)
    }

    pub fn remove_conversation(&mut self, conversation_id: &ConversationId) {
        let Some(thread) = self.threads.remove(conversation_id) else {
            return;
        };
        for message in &thread.messages {
            self.locations.remove(&message.id);
            for attachment in &message.attachments {
                self.attachments.remove(&attachment.id);
            }
        }
        self.aliases.retain(|_, server| self.locations.contains_key(server));
    }

    pub fn clear(&mut self) {
        self.threads.clear();
        self.locations.clear();
        self.aliases.clear();
        self.attachments.clear();
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn get_mut(&mut self, id: &MessageId) -> Result<&mut Message> {
        let id = self.resolve(id);
        let conversation_id = self
            .locations
            .get(&id)
            .ok_or_else(|| StoreError::MessageNotFound(id.clone()))?;
        self.threads
            .get_mut(conversation_id)
            .and_then(|t| t.messages.iter_mut().find(|m| m.id == id))
            .ok_or(StoreError::MessageNotFound(id))
    }

    fn insert(&mut self, message: Message) {
        for attachment in &message.attachments {
            self.attachments
                .insert(attachment.id.clone(), message.id.clone());
        }
        self.locations
            .insert(message.id.clone(), message.conversation_id.clone());

        let thread = self
            .threads
            .entry(message.conversation_id.clone())
            .or_default();
        let pos = thread
            .messages
            .partition_point(|m| (m.created_at, m.id.as_str()) < (message.created_at, message.id.as_str()));
        thread.messages.insert(pos, message);
    }

    fn merge_into(&mut self, conversation_id: &ConversationId, id: &MessageId, incoming: Message) {
        let Some(thread) = self.threads.get_mut(conversation_id) else {
            return;
        };
        let Some(idx) = thread.position(id) else {
            return;
        };

        let entry = &mut thread.messages[idx];
        entry.status = entry.status.merge(incoming.status);
        entry.is_read |= incoming.is_read;
        if entry.client_id.is_none() {
            entry.client_id = incoming.client_id;
        }
        // A tombstone is final; stale copies must not bring content back.
        if incoming.is_deleted && !entry.is_deleted {
            entry.is_deleted = true;
            entry.content = DELETED_MESSAGE_PLACEHOLDER.to_string();
            entry.attachments.clear();
        } else if !entry.is_deleted {
            entry.content = incoming.content;
            entry.kind = incoming.kind;
            entry.is_edited |= incoming.is_edited;
            if !incoming.attachments.is_empty() {
                entry.attachments = merge_attachments(&entry.attachments, incoming.attachments);
            }
        }
        for attachment in &entry.attachments {
            self.attachments.insert(attachment.id.clone(), id.clone());
        }
        let moved = entry.created_at != incoming.created_at;
        entry.created_at = incoming.created_at;
        if moved {
            settle(&mut thread.messages, idx);
        }
    }

    fn remove_entry(&mut self, conversation_id: &ConversationId, id: &MessageId) {
        self.locations.remove(id);
        if let Some(thread) = self.threads.get_mut(conversation_id) {
            if let Some(idx) = thread.position(id) {
                let removed = thread.messages.remove(idx);
                for attachment in &removed.attachments {
                    self.attachments.remove(&attachment.id);
                }
            }
        }
    }
}

/// Take the incoming attachment list, but never move a scan status backwards
/// or drop local metadata the server does not echo.
fn merge_attachments(existing: &[Attachment], incoming: Vec<Attachment>) -> Vec<Attachment> {
    incoming
        .into_iter()
        .map(|mut next| {
            if let Some(prev) = existing.iter().find(|a| a.id == next.id) {
                if prev.scan_status.is_terminal() && !next.scan_status.is_terminal() {
                    next.scan_status = prev.scan_status;
                }
                if next.metadata.checksum.is_none() {
                    next.metadata.checksum = prev.metadata.checksum.clone();
                }
                next.upload_progress = next.upload_progress.max(prev.upload_progress);
            }
            next
        })
        .collect()
}

/// Move the entry at `idx` to its sorted slot, shifting only the entries it
/// passes.
fn settle(messages: &mut [Message], idx: usize) {
    let at = messages[idx].created_at;
    let id = messages[idx].id.clone();
    let key = (at, id.as_str());

    let left = messages[..idx].partition_point(|m| (m.created_at, m.id.as_str()) < key);
    if left < idx {
        messages[left..=idx].rotate_right(1);
        return;
    }
    let right = messages[idx + 1..].partition_point(|m| (m.created_at, m.id.as_str()) < key);
    if right > 0 {
        messages[idx..=idx + right].rotate_left(1);
    }
}
