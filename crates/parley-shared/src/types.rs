use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::TEMP_ID_PREFIX;

// Server-assigned identifiers are opaque strings; the backend decides their shape.
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// A platform user (hirer or worker).
    UserId
);
string_id!(ConversationId);
string_id!(
    /// Either a server id or, before confirmation, a client-generated
    /// temporary id (see [`MessageId::temporary`]).
    MessageId
);
string_id!(AttachmentId);
string_id!(
    /// Reference to a job in the marketplace that a conversation is about.
    JobId
);

impl MessageId {
    /// Generate a fresh temporary id for an optimistic entry.
    pub fn temporary() -> Self {
        Self(format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4()))
    }

    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_ID_PREFIX)
    }
}

/// Local handle for an upload that has no server id yet.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct UploadId(pub Uuid);

impl UploadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UploadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque position in the server's event log, carried on push envelopes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct EventCursor(pub String);

/// Opaque pagination cursor for message history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct PageCursor(pub String);

/// State of the push channel as seen by the rest of the engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Push channel is live.
    Connected,
    /// Push channel is down or not yet established; data may be stale.
    Degraded,
}
