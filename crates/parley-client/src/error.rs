use thiserror::Error;

use parley_net::NetError;
use parley_shared::types::{MessageId, UploadId};
use parley_store::StoreError;

/// Why a selected file was refused before upload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("File is empty")]
    Empty,

    #[error("File too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },

    #[error("File type not allowed: {0}")]
    TypeNotAllowed(String),
}

impl serde::Serialize for ValidationError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// Errors surfaced by the engine API.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Net(#[from] NetError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Upload {0} has not completed")]
    UploadNotReady(UploadId),

    #[error("Message has no content and no attachments")]
    EmptyMessage,

    #[error("Message {0} has not been confirmed by the server")]
    NotConfirmed(MessageId),

    #[error("Message {0} was deleted")]
    MessageDeleted(MessageId),

    #[error("Cannot open a conversation with yourself")]
    OwnConversation,

    #[error("Failed to read file: {0}")]
    Io(#[from] std::io::Error),

    /// The engine task has terminated (logout or session end).
    #[error("Engine stopped")]
    EngineStopped,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ClientError>;
