//! Request/response seam between the engine and the chat backend.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use parley_shared::models::{Conversation, Message};
use parley_shared::protocol::{
    MessagePage, ResyncDelta, ScanStatusResponse, SendMessagePayload, SyncPoint,
    UploadedAttachment,
};
use parley_shared::types::{AttachmentId, ConversationId, MessageId, PageCursor, UserId};

use crate::error::Result;

/// Upload progress callback, called with a percentage in `0..=100`.
pub type ProgressFn = Arc<dyn Fn(u8) + Send + Sync>;

/// A file ready to be uploaded.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub filename: String,
    pub mime_type: String,
    pub bytes: Bytes,
}

/// Calls against the chat backend.
///
/// Implementations only retry idempotent reads (once, on a transient
/// failure). Writes are never retried here; the caller decides.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn fetch_conversations(&self) -> Result<Vec<Conversation>>;

    /// Fetch one page of history. `None` asks for the newest page.
    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
        cursor: Option<&PageCursor>,
    ) -> Result<MessagePage>;

    /// Send a message; the payload carries the pending id as `client_id`.
    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        payload: &SendMessagePayload,
    ) -> Result<Message>;

    /// Replace the content of a sent message; returns the edited copy.
    async fn edit_message(&self, message_id: &MessageId, content: &str) -> Result<Message>;

    /// Soft-delete a message.
    async fn delete_message(&self, message_id: &MessageId) -> Result<()>;

    async fn mark_message_read(&self, message_id: &MessageId) -> Result<()>;

    async fn mark_conversation_read(&self, conversation_id: &ConversationId) -> Result<()>;

    /// Find or create the direct conversation with `recipient_id`.
    async fn create_direct_conversation(&self, recipient_id: &UserId) -> Result<Conversation>;

    async fn set_archived(&self, conversation_id: &ConversationId, archived: bool) -> Result<()>;

    async fn set_pinned(&self, conversation_id: &ConversationId, pinned: bool) -> Result<()>;

    async fn upload_attachment(
        &self,
        conversation_id: &ConversationId,
        upload: UploadRequest,
        progress: ProgressFn,
    ) -> Result<UploadedAttachment>;

    async fn fetch_scan_status(&self, attachment_id: &AttachmentId) -> Result<ScanStatusResponse>;

    /// Events missed since `since`. `Ok(None)` when the server cannot
    /// supply a delta and the caller has to refetch.
    async fn fetch_resync_delta(&self, since: &SyncPoint) -> Result<Option<ResyncDelta>>;
}
