use thiserror::Error;

use parley_shared::types::{AttachmentId, ConversationId, MessageId};
use parley_shared::ModelError;

/// Errors produced by the store layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No conversation with this id is loaded.
    #[error("Conversation not found: {0}")]
    ConversationNotFound(ConversationId),

    /// No message with this id (or alias) is stored.
    #[error("Message not found: {0}")]
    MessageNotFound(MessageId),

    /// No stored message carries this attachment.
    #[error("Attachment not found: {0}")]
    AttachmentNotFound(AttachmentId),

    /// Operation only valid on optimistic entries.
    #[error("Message {0} is not a pending optimistic entry")]
    NotPending(MessageId),

    /// A confirmation for a different conversation than the pending entry.
    #[error("Confirmed message belongs to {actual}, pending entry to {expected}")]
    ConversationMismatch {
        expected: ConversationId,
        actual: ConversationId,
    },

    /// Model invariant violated (scan transition, participant count).
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
