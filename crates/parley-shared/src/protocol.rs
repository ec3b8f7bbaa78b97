use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Conversation, Message, MessageKind, ScanStatus};
use crate::types::{
    AttachmentId, ConversationId, EventCursor, MessageId, PageCursor, UserId,
};

/// Events delivered on the push channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum PushEvent {
    #[serde(rename = "message:new")]
    MessageNew(Message),

    #[serde(rename = "message:updated")]
    MessageUpdated(Message),

    #[serde(rename = "message:deleted")]
    MessageDeleted(MessageRemoval),

    #[serde(rename = "message:read")]
    MessageRead(ReadReceipt),

    #[serde(rename = "conversation:updated")]
    ConversationUpdated(Conversation),

    #[serde(rename = "conversation:deleted")]
    #[serde(rename_all = "camelCase")]
    ConversationDeleted { conversation_id: ConversationId },

    #[serde(rename = "typing:start")]
    TypingStart(TypingNotice),

    #[serde(rename = "typing:stop")]
    TypingStop(TypingNotice),

    /// Virus-scan status change keyed by attachment id.
    #[serde(rename = "attachment:scan")]
    ScanStatus(ScanUpdate),

    #[serde(rename = "user:status")]
    UserStatus(PresenceUpdate),
}

impl PushEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PushEvent::MessageNew(_) => "message:new",
            PushEvent::MessageUpdated(_) => "message:updated",
            PushEvent::MessageDeleted(_) => "message:deleted",
            PushEvent::MessageRead(_) => "message:read",
            PushEvent::ConversationUpdated(_) => "conversation:updated",
            PushEvent::ConversationDeleted { .. } => "conversation:deleted",
            PushEvent::TypingStart(_) => "typing:start",
            PushEvent::TypingStop(_) => "typing:stop",
            PushEvent::ScanStatus(_) => "attachment:scan",
            PushEvent::UserStatus(_) => "user:status",
        }
    }
}

/// A push event together with its position in the server event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PushEnvelope {
    #[serde(default)]
    pub cursor: Option<EventCursor>,
    pub event: PushEvent,
}

impl PushEnvelope {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageRemoval {
    #[serde(rename = "id")]
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub conversation_id: ConversationId,
    pub message_ids: Vec<MessageId>,
    pub reader_id: UserId,
    /// Server-confirmed unread count for the reader, when supplied.
    #[serde(default)]
    pub unread_count: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TypingNotice {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    /// Overrides the default expiry for this notice.
    #[serde(default)]
    pub ttl_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScanUpdate {
    pub attachment_id: AttachmentId,
    pub status: ScanStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdate {
    pub user_id: UserId,
    pub online: bool,
}

/// Frames the client sends over the push channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data")]
pub enum ClientFrame {
    #[serde(rename = "typing:start")]
    #[serde(rename_all = "camelCase")]
    TypingStart { conversation_id: ConversationId },

    #[serde(rename = "typing:stop")]
    #[serde(rename_all = "camelCase")]
    TypingStop { conversation_id: ConversationId },

    #[serde(rename = "conversation:join")]
    #[serde(rename_all = "camelCase")]
    JoinConversation { conversation_id: ConversationId },

    #[serde(rename = "conversation:leave")]
    #[serde(rename_all = "camelCase")]
    LeaveConversation { conversation_id: ConversationId },
}

impl ClientFrame {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ---------------------------------------------------------------------------
// REST payloads
// ---------------------------------------------------------------------------

/// One page of message history, newest page first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub messages: Vec<Message>,
    /// Cursor for the next (older) page.
    #[serde(default)]
    pub next_cursor: Option<PageCursor>,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    /// The pending (temporary) id; the server echoes it on the confirmed message.
    pub client_id: MessageId,
    pub content: String,
    #[serde(rename = "messageType")]
    pub kind: MessageKind,
    pub attachment_ids: Vec<AttachmentId>,
    #[serde(default)]
    pub reply_to: Option<MessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EditMessagePayload {
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DirectConversationPayload {
    pub recipient_id: UserId,
}

/// Server answer to a completed upload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UploadedAttachment {
    pub id: AttachmentId,
    pub url: String,
    #[serde(default)]
    pub scan_status: Option<ScanStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScanStatusResponse {
    pub attachment_id: AttachmentId,
    pub status: ScanStatus,
}

/// Where the client left off: the last event cursor and the newest timestamp seen.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SyncPoint {
    pub cursor: Option<EventCursor>,
    pub since: Option<DateTime<Utc>>,
}

/// Events missed while disconnected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResyncDelta {
    pub events: Vec<PushEnvelope>,
    #[serde(default)]
    pub cursor: Option<EventCursor>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_typing_envelope() {
        let json = r#"{
            "cursor": "ev-41",
            "event": {
                "type": "typing:start",
                "data": { "conversationId": "c1", "userId": "u2" }
            }
        }"#;
        let env = PushEnvelope::from_json(json).unwrap();
        assert_eq!(env.cursor, Some(EventCursor("ev-41".into())));
        match env.event {
            PushEvent::TypingStart(notice) => {
                assert_eq!(notice.conversation_id.as_str(), "c1");
                assert_eq!(notice.ttl_ms, None);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_decode_message_new_with_client_id() {
        let json = r#"{
            "event": {
                "type": "message:new",
                "data": {
                    "id": "m99",
                    "conversationId": "c1",
                    "senderId": "u1",
                    "content": "hi",
                    "type": "text",
                    "status": "sent",
                    "createdAt": "2024-05-01T10:00:00Z",
                    "clientId": "temp-1"
                }
            }
        }"#;
        let env = PushEnvelope::from_json(json).unwrap();
        let PushEvent::MessageNew(msg) = env.event else {
            panic!("expected message:new");
        };
        assert_eq!(msg.client_id, Some(MessageId::from("temp-1")));
        assert!(msg.attachments.is_empty());
        assert!(!msg.is_read);
    }

    #[test]
    fn test_decode_message_deleted() {
        let json = r#"{
            "cursor": "ev-7",
            "event": {
                "type": "message:deleted",
                "data": { "id": "m4", "conversationId": "c1" }
            }
        }"#;
        let env = PushEnvelope::from_json(json).unwrap();
        assert_eq!(env.event.name(), "message:deleted");
        assert_eq!(
            env.event,
            PushEvent::MessageDeleted(MessageRemoval {
                message_id: MessageId::from("m4"),
                conversation_id: ConversationId::from("c1"),
            })
        );
    }

    #[test]
    fn test_client_frame_encoding() {
        let frame = ClientFrame::TypingStop {
            conversation_id: ConversationId::from("c9"),
        };
        let json = frame.to_json().unwrap();
        assert_eq!(json, r#"{"type":"typing:stop","data":{"conversationId":"c9"}}"#);
    }
}
