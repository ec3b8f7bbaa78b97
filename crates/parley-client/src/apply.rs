//! Push event reducers.
//!
//! Each push event is folded into the stores by a plain function over
//! `(stores, context, event)`. The returned [`Applied`] says what changed and
//! what follow-up work the controller owes (server read marks, conversation
//! refresh, scan watch bookkeeping). Nothing here touches the network.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use parley_shared::models::{Message, MessageSummary, ScanStatus};
use parley_shared::protocol::PushEvent;
use parley_shared::types::{AttachmentId, ConversationId, MessageId, UserId};
use parley_store::{ApplyOutcome, StoreError};

use crate::state::Stores;

/// Facts about the session the reducers need.
#[derive(Debug, Clone, Copy)]
pub struct ApplyContext<'a> {
    pub own_user: &'a UserId,
    pub active: Option<&'a ConversationId>,
    pub typing_ttl: Duration,
    pub now: Instant,
    pub received_at: DateTime<Utc>,
}

impl ApplyContext<'_> {
    fn is_active(&self, id: &ConversationId) -> bool {
        self.active == Some(id)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Applied {
    pub conversations_changed: bool,
    pub messages_changed: Option<ConversationId>,
    pub typing_changed: Option<ConversationId>,
    pub presence_changed: Option<(UserId, bool)>,
    pub scan: Option<(AttachmentId, ScanStatus)>,
    /// Push referenced a conversation we do not know: refresh the list.
    pub unknown_conversation: Option<ConversationId>,
    /// Inbound message shown in the active conversation.
    pub read_on_server: Option<MessageId>,
    pub removed_conversation: Option<ConversationId>,
    /// Attachments of newly stored messages still waiting for their scan.
    pub pending_scans: Vec<AttachmentId>,
}

pub fn apply_event(stores: &mut Stores, ctx: &ApplyContext<'_>, event: &PushEvent) -> Applied {
    match event {
        PushEvent::MessageNew(message) => {
            let mut applied = Applied::default();
            let conversation_id = message.conversation_id.clone();
            let known = stores.conversations.contains(&conversation_id);
            let outcome = stores.messages.apply_incoming(message.clone());
            applied.messages_changed = Some(conversation_id.clone());
            if outcome == ApplyOutcome::Inserted {
                applied.pending_scans = pending_scans(message);
            }

            if !known {
                debug!(conversation = %conversation_id, "Message for unknown conversation");
                applied.unknown_conversation = Some(conversation_id);
                return applied;
            }
            if outcome == ApplyOutcome::Inserted {
                let active = ctx.is_active(&conversation_id);
                if let Err(e) = stores.conversations.apply_last_message(
                    &conversation_id,
                    MessageSummary::of(message),
                    active,
                    ctx.own_user,
                ) {
                    warn!(error = %e, "Failed to update conversation summary");
                }
                applied.conversations_changed = true;

                if active && message.sender_id != *ctx.own_user {
                    let _ = stores.messages.mark_read(&message.id);
                    applied.read_on_server = Some(message.id.clone());
                }
                // A new message ends that sender's typing indicator.
                if stores
                    .typing
                    .clear_typing(&conversation_id, &message.sender_id)
                {
                    applied.typing_changed = Some(conversation_id);
                }
            }
            applied
        }

        PushEvent::MessageUpdated(message) => apply_edit(stores, message),

        PushEvent::MessageDeleted(removal) => apply_removal(stores, &removal.message_id),

        PushEvent::MessageRead(receipt) => {
            let mut applied = Applied::default();
            let mut any = false;
            for id in &receipt.message_ids {
                match stores.messages.mark_read(id) {
                    Ok(changed) => any |= changed,
                    Err(StoreError::MessageNotFound(_)) => {}
                    Err(e) => warn!(error = %e, "Failed to apply read receipt"),
                }
            }
            if any {
                applied.messages_changed = Some(receipt.conversation_id.clone());
            }
            if receipt.reader_id == *ctx.own_user {
                if let Some(unread) = receipt.unread_count {
                    match stores
                        .conversations
                        .apply_read_receipt(&receipt.conversation_id, unread)
                    {
                        Ok(()) => applied.conversations_changed = true,
                        Err(e) => debug!(error = %e, "Read receipt for unknown conversation"),
                    }
                }
            }
            applied
        }

        PushEvent::ConversationUpdated(conversation) => {
            let mut applied = Applied::default();
            let id = conversation.id.clone();
            match stores.conversations.upsert(conversation.clone()) {
                Ok(_) => {
                    if ctx.is_active(&id) {
                        let _ = stores.conversations.set_unread(&id, 0);
                    }
                    applied.conversations_changed = true;
                }
                Err(e) => warn!(conversation = %id, error = %e, "Rejected conversation update"),
            }
            applied
        }

        PushEvent::ConversationDeleted { conversation_id } => {
            let mut applied = Applied::default();
            let existed = stores.conversations.remove(conversation_id).is_some();
            stores.messages.remove_conversation(conversation_id);
            if existed {
                applied.conversations_changed = true;
                applied.removed_conversation = Some(conversation_id.clone());
            }
            applied
        }

        PushEvent::TypingStart(notice) => {
            let mut applied = Applied::default();
            let ttl = notice
                .ttl_ms
                .map(Duration::from_millis)
                .unwrap_or(ctx.typing_ttl);
            if stores
                .typing
                .set_typing(&notice.conversation_id, &notice.user_id, ttl, ctx.now)
            {
                applied.typing_changed = Some(notice.conversation_id.clone());
            }
            applied
        }

        PushEvent::TypingStop(notice) => {
            let mut applied = Applied::default();
            if stores
                .typing
                .clear_typing(&notice.conversation_id, &notice.user_id)
            {
                applied.typing_changed = Some(notice.conversation_id.clone());
            }
            applied
        }

        PushEvent::ScanStatus(update) => {
            let mut applied = Applied::default();
            if stores.messages.has_attachment(&update.attachment_id) {
                match stores
                    .messages
                    .apply_scan_status(&update.attachment_id, update.status)
                {
                    Ok(message_id) => {
                        if let Some(message) = stores.messages.get(&message_id) {
                            applied.messages_changed = Some(message.conversation_id.clone());
                        }
                    }
                    Err(e) => warn!(attachment = %update.attachment_id, error = %e, "Ignoring scan update"),
                }
            }
            applied.scan = Some((update.attachment_id.clone(), update.status));
            applied
        }

        PushEvent::UserStatus(presence) => {
            let changed = stores
                .presence
                .update(&presence.user_id, presence.online, ctx.received_at);
            Applied {
                presence_changed: changed.then(|| (presence.user_id.clone(), presence.online)),
                ..Applied::default()
            }
        }
    }
}

/// Fold the server copy of an edited message into the stores.
pub fn apply_edit(stores: &mut Stores, edited: &Message) -> Applied {
    let mut applied = Applied::default();
    match stores.messages.apply_edit(edited) {
        Ok(true) => {
            applied.messages_changed = Some(edited.conversation_id.clone());
            applied.conversations_changed = refresh_summary(stores, &edited.id);
        }
        Ok(false) => {}
        Err(e) => debug!(message = %edited.id, error = %e, "Edit for a message not loaded"),
    }
    applied
}

/// Replace a deleted message with its tombstone.
pub fn apply_removal(stores: &mut Stores, message_id: &MessageId) -> Applied {
    let mut applied = Applied::default();
    match stores.messages.tombstone(message_id) {
        Ok(true) => {
            applied.messages_changed = stores
                .messages
                .get(message_id)
                .map(|m| m.conversation_id.clone());
            applied.conversations_changed = refresh_summary(stores, message_id);
        }
        Ok(false) => {}
        Err(e) => debug!(message = %message_id, error = %e, "Delete for a message not loaded"),
    }
    applied
}

/// Attachments of `message` whose scan has not finished.
pub fn pending_scans(message: &Message) -> Vec<AttachmentId> {
    message
        .attachments
        .iter()
        .filter(|a| !a.scan_status.is_terminal())
        .map(|a| a.id.clone())
        .collect()
}

/// Re-summarise a changed message if it is its conversation's newest.
fn refresh_summary(stores: &mut Stores, id: &MessageId) -> bool {
    let Some(message) = stores.messages.get(id) else {
        return false;
    };
    let conversation_id = message.conversation_id.clone();
    let summarised_at = message.created_at;
    let summary = MessageSummary::of(message);
    stores
        .conversations
        .replace_last_message(&conversation_id, summarised_at, summary)
        .unwrap_or(false)
}
