//! Engine state visible to consumers.
//!
//! The [`Stores`] bundle is owned by the engine task; consumers only ever get
//! a cloned [`Snapshot`].

use serde::{Deserialize, Serialize};

use parley_shared::models::{Conversation, Message};
use parley_shared::types::{ConnectionState, ConversationId, UserId};
use parley_store::{ConversationStore, MessageStore, PresenceTracker, TypingTracker};

use crate::attachments::UploadRecord;

/// Credentials of the signed-in user.
#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: UserId,
    /// Bearer token for the REST API and the push channel.
    pub token: String,
}

impl Session {
    pub fn new(user_id: UserId, token: impl Into<String>) -> Self {
        Self {
            user_id,
            token: token.into(),
        }
    }
}

/// Per-selection state machine: `Idle -> Loading -> Ready <-> Reconciling`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "conversationId", rename_all = "snake_case")]
pub enum SelectionState {
    #[default]
    Idle,
    /// First page of the selected conversation is in flight.
    Loading(ConversationId),
    Ready(ConversationId),
    /// Catching up after a reconnect.
    Reconciling(ConversationId),
}

impl SelectionState {
    pub fn conversation(&self) -> Option<&ConversationId> {
        match self {
            SelectionState::Idle => None,
            SelectionState::Loading(id)
            | SelectionState::Ready(id)
            | SelectionState::Reconciling(id) => Some(id),
        }
    }

    pub fn is_active(&self, id: &ConversationId) -> bool {
        self.conversation() == Some(id)
    }
}

/// All stores of one session.
#[derive(Debug)]
pub struct Stores {
    pub conversations: ConversationStore,
    pub messages: MessageStore,
    pub typing: TypingTracker,
    pub presence: PresenceTracker,
}

impl Stores {
    pub fn new(own_user: UserId) -> Self {
        Self {
            conversations: ConversationStore::new(),
            messages: MessageStore::new(),
            typing: TypingTracker::new(own_user),
            presence: PresenceTracker::new(),
        }
    }

    pub fn clear(&mut self) {
        self.conversations.clear();
        self.messages.clear();
        self.typing.clear();
        self.presence.clear();
    }
}

/// Point-in-time copy of what the presentation layer renders.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub selection: SelectionState,
    pub connection: ConnectionState,
    /// Unfiltered, in display order.
    pub conversations: Vec<Conversation>,
    /// Messages of the active conversation, oldest first.
    pub messages: Vec<Message>,
    /// Users typing in the active conversation.
    pub typing: Vec<UserId>,
    pub online: Vec<UserId>,
    pub uploads: Vec<UploadRecord>,
    pub total_unread: u32,
    /// Older history is available for the active conversation.
    pub has_more: bool,
}
