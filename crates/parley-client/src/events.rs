//! Typed event bus between the engine and its presentation layer.
//!
//! Handlers are registered per [`EventKind`] and run synchronously on the
//! engine task, outside the registry lock. Events only say *what* changed;
//! consumers read the new state through a snapshot.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde::Serialize;

use parley_shared::types::{AttachmentId, ConnectionState, ConversationId, MessageId, UploadId, UserId};

use crate::state::SelectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ConversationsChanged,
    MessagesChanged,
    TypingChanged,
    PresenceChanged,
    ConnectionChanged,
    SelectionChanged,
    AttachmentChanged,
    SendFailed,
    LoadFailed,
    MarkReadReport,
    SessionEnded,
}

/// Outcome of a bulk mark-read: which ids the server confirmed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MarkReadReport {
    pub confirmed: Vec<MessageId>,
    pub failed: Vec<(MessageId, String)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineEvent {
    ConversationsChanged,
    MessagesChanged {
        conversation_id: ConversationId,
    },
    TypingChanged {
        conversation_id: ConversationId,
        users: Vec<UserId>,
    },
    PresenceChanged {
        user_id: UserId,
        online: bool,
    },
    ConnectionChanged {
        state: ConnectionState,
    },
    SelectionChanged {
        state: SelectionState,
    },
    AttachmentChanged {
        upload_id: UploadId,
        attachment_id: Option<AttachmentId>,
    },
    SendFailed {
        conversation_id: ConversationId,
        temp_id: MessageId,
        error: String,
    },
    LoadFailed {
        conversation_id: Option<ConversationId>,
        error: String,
    },
    MarkReadReport {
        report: MarkReadReport,
    },
    SessionEnded,
}

impl EngineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            EngineEvent::ConversationsChanged => EventKind::ConversationsChanged,
            EngineEvent::MessagesChanged { .. } => EventKind::MessagesChanged,
            EngineEvent::TypingChanged { .. } => EventKind::TypingChanged,
            EngineEvent::PresenceChanged { .. } => EventKind::PresenceChanged,
            EngineEvent::ConnectionChanged { .. } => EventKind::ConnectionChanged,
            EngineEvent::SelectionChanged { .. } => EventKind::SelectionChanged,
            EngineEvent::AttachmentChanged { .. } => EventKind::AttachmentChanged,
            EngineEvent::SendFailed { .. } => EventKind::SendFailed,
            EngineEvent::LoadFailed { .. } => EventKind::LoadFailed,
            EngineEvent::MarkReadReport { .. } => EventKind::MarkReadReport,
            EngineEvent::SessionEnded => EventKind::SessionEnded,
        }
    }
}

type Handler = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: Vec<(u64, EventKind, Handler)>,
}

#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for one kind of event. The handler stays
    /// registered until the returned [`Subscription`] is dropped or
    /// unsubscribed.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        registry.next_id += 1;
        let id = registry.next_id;
        registry.handlers.push((id, kind, Arc::new(handler)));
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    pub fn emit(&self, event: &EngineEvent) {
        let kind = event.kind();
        let handlers: Vec<Handler> = {
            let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
            registry
                .handlers
                .iter()
                .filter(|(_, k, _)| *k == kind)
                .map(|(_, _, h)| h.clone())
                .collect()
        };
        for handler in handlers {
            handler(event);
        }
    }

    pub fn handler_count(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handlers
            .len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.handler_count())
            .finish()
    }
}

/// Registration handle returned by [`EventBus::on`].
#[must_use = "dropping a Subscription unregisters its handler"]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut registry = registry.lock().unwrap_or_else(PoisonError::into_inner);
            registry.handlers.retain(|(id, _, _)| *id != self.id);
        }
    }
}
