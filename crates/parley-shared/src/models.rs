//! Domain models shared by the transport, the stores and the controller.
//!
//! Every struct derives `Serialize` and `Deserialize` so REST responses and
//! push payloads decode straight into them.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::types::{AttachmentId, ConversationId, JobId, MessageId, UserId};

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// Summary of the newest message, shown in the conversation list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageSummary {
    pub text: String,
    pub sender_id: UserId,
    pub timestamp: DateTime<Utc>,
    pub has_attachment: bool,
}

impl MessageSummary {
    pub fn of(message: &Message) -> Self {
        Self {
            text: message.content.clone(),
            sender_id: message.sender_id.clone(),
            timestamp: message.created_at,
            has_attachment: !message.attachments.is_empty(),
        }
    }
}

/// A direct or group conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub participants: BTreeSet<UserId>,
    #[serde(default)]
    pub is_group: bool,
    /// Display name, set for groups.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub last_message: Option<MessageSummary>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub is_pinned: bool,
    #[serde(default)]
    pub is_archived: bool,
    /// Job this conversation was opened for, if any.
    #[serde(default)]
    pub job_related: Option<JobId>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Timestamp used for list ordering: the last message, or `updated_at`
    /// for conversations without messages.
    pub fn activity_at(&self) -> DateTime<Utc> {
        self.last_message
            .as_ref()
            .map(|m| m.timestamp)
            .unwrap_or(self.updated_at)
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if self.participants.len() < 2 {
            return Err(ModelError::TooFewParticipants(self.participants.len()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    File,
    Mixed,
    System,
}

impl MessageKind {
    /// Derive the kind of a user-authored message from its parts.
    pub fn infer(content: &str, attachments: &[Attachment]) -> Self {
        if attachments.is_empty() {
            return MessageKind::Text;
        }
        if !content.trim().is_empty() {
            return MessageKind::Mixed;
        }
        if attachments.iter().all(|a| a.mime_type.starts_with("image/")) {
            MessageKind::Image
        } else {
            MessageKind::File
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    /// Progress rank along sending → sent → delivered → read.
    /// `Failed` ranks with `Sending`: a confirmation always wins over it.
    fn rank(self) -> u8 {
        match self {
            MessageStatus::Sending | MessageStatus::Failed => 0,
            MessageStatus::Sent => 1,
            MessageStatus::Delivered => 2,
            MessageStatus::Read => 3,
        }
    }

    /// Combine a stored status with an incoming one without regressing.
    pub fn merge(self, incoming: MessageStatus) -> MessageStatus {
        if incoming.rank() >= self.rank() {
            incoming
        } else {
            self
        }
    }
}

/// A single chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub reply_to: Option<MessageId>,
    #[serde(default)]
    pub is_read: bool,
    /// Temporary id the sender used before confirmation, echoed by the server.
    #[serde(default)]
    pub client_id: Option<MessageId>,
    #[serde(default)]
    pub is_edited: bool,
    /// Soft-deleted on the server; content is a placeholder.
    #[serde(default)]
    pub is_deleted: bool,
}

// ---------------------------------------------------------------------------
// Attachment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Pending,
    Clean,
    Infected,
    Failed,
    Skipped,
}

impl ScanStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ScanStatus::Pending)
    }

    /// Only clean or skipped files may be downloaded or displayed.
    pub fn is_downloadable(self) -> bool {
        match self {
            ScanStatus::Clean | ScanStatus::Skipped => true,
            ScanStatus::Pending | ScanStatus::Infected | ScanStatus::Failed => false,
        }
    }

    /// Validate a transition. Re-applying the current status is a no-op.
    pub fn transition(self, next: ScanStatus) -> Result<ScanStatus, ModelError> {
        match (self, next) {
            (current, next) if current == next => Ok(current),
            (ScanStatus::Pending, next) => Ok(next),
            (from, to) => Err(ModelError::IllegalScanTransition { from, to }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentMetadata {
    pub filename: String,
    pub original_mime_type: String,
    /// BLAKE3 of the uploaded bytes (hex), when computed locally.
    #[serde(default)]
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: AttachmentId,
    /// Absent until the upload has completed.
    #[serde(default)]
    pub url: Option<String>,
    pub mime_type: String,
    pub size: u64,
    #[serde(default)]
    pub upload_progress: u8,
    #[serde(rename = "virusScanStatus")]
    pub scan_status: ScanStatus,
    #[serde(default)]
    pub metadata: AttachmentMetadata,
}

impl Attachment {
    pub fn is_downloadable(&self) -> bool {
        self.url.is_some() && self.scan_status.is_downloadable()
    }
}
