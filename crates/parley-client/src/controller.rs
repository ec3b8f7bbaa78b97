//! Synchronization controller.
//!
//! The [`SyncController`] owns every store of a session and is driven by the
//! engine loop: user commands, transport notifications, task completions and
//! the typing sweep all land here, one at a time. Network work is spawned
//! onto a [`JoinSet`] and reports back through the completion channel, so no
//! method on the controller ever awaits I/O.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, error, info, warn};

use parley_net::{
    Backoff, ChatApi, NetError, ProgressFn, ResyncOutcome, TransportCommand, TransportNotification,
};
use parley_shared::models::{Conversation, Message, MessageSummary, ScanStatus};
use parley_shared::protocol::{
    ClientFrame, MessagePage, PushEnvelope, PushEvent, SendMessagePayload, UploadedAttachment,
};
use parley_shared::types::{
    AttachmentId, ConnectionState, ConversationId, MessageId, PageCursor, UploadId, UserId,
};
use parley_store::{ConversationFilter, Draft, StoreError};

use crate::apply::{self, apply_event, Applied, ApplyContext};
use crate::attachments::{self, AttachmentPipeline, FileCandidate, SelectionReport};
use crate::config::EngineConfig;
use crate::error::{ClientError, Result};
use crate::events::{EngineEvent, EventBus, MarkReadReport};
use crate::state::{SelectionState, Session, Snapshot, Stores};

// ---------------------------------------------------------------------------
// Completions
// ---------------------------------------------------------------------------

/// Reply channel of a request that resolves once the server answers.
pub type Reply<T> = oneshot::Sender<T>;

/// Per-user conversation flags stored on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationFlag {
    Pinned,
    Archived,
}

/// Results of spawned work, posted back to the engine loop.
#[derive(Debug)]
pub enum Completion {
    Conversations(std::result::Result<Vec<Conversation>, NetError>),
    Page {
        conversation_id: ConversationId,
        generation: u64,
        older: bool,
        result: std::result::Result<MessagePage, NetError>,
    },
    Sent {
        conversation_id: ConversationId,
        temp_id: MessageId,
        result: std::result::Result<Message, NetError>,
    },
    MarkedRead(Vec<(MessageId, std::result::Result<(), NetError>)>),
    /// Fire-and-forget request whose only interesting outcome is an error.
    Background {
        what: &'static str,
        result: std::result::Result<(), NetError>,
    },
    UploadProgress {
        upload_id: UploadId,
        percent: u8,
    },
    Uploaded {
        upload_id: UploadId,
        result: std::result::Result<UploadedAttachment, NetError>,
    },
    ScanResolved {
        attachment_id: AttachmentId,
        result: std::result::Result<ScanStatus, NetError>,
    },
    Edited {
        result: std::result::Result<Message, NetError>,
        reply: Reply<Result<()>>,
    },
    Deleted {
        message_id: MessageId,
        result: std::result::Result<(), NetError>,
        reply: Reply<Result<()>>,
    },
    Flagged {
        conversation_id: ConversationId,
        flag: ConversationFlag,
        value: bool,
        result: std::result::Result<(), NetError>,
        reply: Reply<Result<()>>,
    },
    DirectOpened {
        result: std::result::Result<Conversation, NetError>,
        reply: Reply<Result<ConversationId>>,
    },
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct SyncController {
    config: EngineConfig,
    session: Session,
    api: Arc<dyn ChatApi>,
    bus: EventBus,
    stores: Stores,
    pipeline: AttachmentPipeline,

    selection: SelectionState,
    connection: ConnectionState,
    /// Bumped on every (re)selection; page results from older generations
    /// are discarded.
    generation: u64,
    page_task: Option<AbortHandle>,
    older_in_flight: bool,
    refreshing: bool,
    /// A refresh was asked for while one was in flight.
    refresh_pending: bool,
    scan_watches: HashMap<AttachmentId, AbortHandle>,
    /// Local timestamp of every unconfirmed send, keyed by temporary id.
    pending_sends: HashMap<MessageId, DateTime<Utc>>,

    tasks: JoinSet<()>,
    completions: mpsc::UnboundedSender<Completion>,
    transport: mpsc::Sender<TransportCommand>,
    ended: bool,
}

impl SyncController {
    pub fn init(
        config: EngineConfig,
        session: Session,
        api: Arc<dyn ChatApi>,
        bus: EventBus,
        completions: mpsc::UnboundedSender<Completion>,
        transport: mpsc::Sender<TransportCommand>,
    ) -> Self {
        info!(user = %session.user_id, "Initialising sync controller");
        let pipeline = AttachmentPipeline::new(
            config.max_attachment_bytes,
            config.allowed_mime_types.clone(),
        );
        Self {
            stores: Stores::new(session.user_id.clone()),
            config,
            session,
            api,
            bus,
            pipeline,
            selection: SelectionState::Idle,
            connection: ConnectionState::Degraded,
            generation: 0,
            page_task: None,
            older_in_flight: false,
            refreshing: false,
            refresh_pending: false,
            scan_watches: HashMap::new(),
            pending_sends: HashMap::new(),
            tasks: JoinSet::new(),
            completions,
            transport,
            ended: false,
        }
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    fn ensure_running(&self) -> Result<()> {
        if self.ended {
            Err(ClientError::EngineStopped)
        } else {
            Ok(())
        }
    }

    // --- Lifecycle ---

    /// Open the push channel and load the conversation list.
    pub fn start(&mut self) -> Result<()> {
        self.ensure_running()?;
        info!("Starting synchronization");
        self.command(TransportCommand::Connect);
        self.refresh_conversations();
        Ok(())
    }

    /// Close the push channel. Stores are kept; the next `start` catches up.
    pub fn stop(&mut self) -> Result<()> {
        self.ensure_running()?;
        info!("Stopping synchronization");
        self.command(TransportCommand::Disconnect);
        self.set_connection(ConnectionState::Degraded);
        Ok(())
    }

    pub fn logout(&mut self) {
        info!(user = %self.session.user_id, "Logging out");
        self.teardown();
    }

    /// Abort all work, shut the transport down and forget the session data.
    pub fn teardown(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;
        self.tasks.abort_all();
        self.scan_watches.clear();
        self.pending_sends.clear();
        self.page_task = None;
        self.command(TransportCommand::Shutdown);
        self.stores.clear();
        self.pipeline.clear();
        self.selection = SelectionState::Idle;
        self.connection = ConnectionState::Degraded;
        self.bus.emit(&EngineEvent::SessionEnded);
    }

    fn end_session(&mut self, error: &NetError) {
        error!(error = %error, "Authentication lost, ending session");
        self.teardown();
    }

    // --- Selection ---

    pub fn select(&mut self, conversation_id: ConversationId) -> Result<()> {
        self.ensure_running()?;
        if let Some(previous) = self.selection.conversation().cloned() {
            if previous != conversation_id {
                self.command(TransportCommand::Send(ClientFrame::LeaveConversation {
                    conversation_id: previous,
                }));
            }
        }
        info!(conversation = %conversation_id, "Selecting conversation");

        self.set_selection(SelectionState::Loading(conversation_id.clone()));
        if self.stores.conversations.set_unread(&conversation_id, 0).is_ok() {
            self.bus.emit(&EngineEvent::ConversationsChanged);
        }
        self.command(TransportCommand::Send(ClientFrame::JoinConversation {
            conversation_id: conversation_id.clone(),
        }));
        self.fetch_first_page(conversation_id.clone());

        let api = self.api.clone();
        self.spawn(async move {
            Completion::Background {
                what: "mark conversation read",
                result: api.mark_conversation_read(&conversation_id).await,
            }
        });
        Ok(())
    }

    /// Request the next older page of the active conversation. Returns
    /// `false` when there is nothing to load or a request is in flight.
    pub fn load_older(&mut self) -> Result<bool> {
        self.ensure_running()?;
        let SelectionState::Ready(conversation_id) = self.selection.clone() else {
            return Ok(false);
        };
        if self.older_in_flight || !self.stores.messages.has_more(&conversation_id) {
            return Ok(false);
        }
        let Some(cursor) = self.stores.messages.cursor(&conversation_id).cloned() else {
            return Ok(false);
        };

        self.older_in_flight = true;
        self.spawn_page(conversation_id, Some(cursor), true);
        Ok(true)
    }

    fn fetch_first_page(&mut self, conversation_id: ConversationId) {
        if let Some(task) = self.page_task.take() {
            task.abort();
        }
        self.generation += 1;
        self.older_in_flight = false;
        let handle = self.spawn_page(conversation_id, None, false);
        self.page_task = Some(handle);
    }

    fn spawn_page(
        &mut self,
        conversation_id: ConversationId,
        cursor: Option<PageCursor>,
        older: bool,
    ) -> AbortHandle {
        let api = self.api.clone();
        let generation = self.generation;
        self.spawn(async move {
            let result = api.fetch_messages(&conversation_id, cursor.as_ref()).await;
            Completion::Page {
                conversation_id,
                generation,
                older,
                result,
            }
        })
    }

    fn refresh_conversations(&mut self) {
        if self.refreshing {
            // The running fetch may predate whatever asked for this one.
            self.refresh_pending = true;
            return;
        }
        self.refreshing = true;
        let api = self.api.clone();
        self.spawn(async move { Completion::Conversations(api.fetch_conversations().await) });
    }

    // --- Sending ---

    pub fn send(
        &mut self,
        conversation_id: ConversationId,
        content: String,
        uploads: &[UploadId],
        reply_to: Option<MessageId>,
    ) -> Result<MessageId> {
        self.ensure_running()?;
        if content.trim().is_empty() && uploads.is_empty() {
            return Err(ClientError::EmptyMessage);
        }
        let attachments = self.pipeline.ready_attachments(uploads)?;

        let temp_id = self.stores.messages.append_optimistic(
            &conversation_id,
            Draft {
                sender_id: self.session.user_id.clone(),
                content,
                attachments,
                reply_to,
                created_at: Utc::now(),
            },
        );
        if let Some(pending) = self.stores.messages.get(&temp_id).cloned() {
            self.pending_sends.insert(temp_id.clone(), pending.created_at);
            self.touch_conversation(&pending);
            self.spawn_send(&pending);
        }
        debug!(conversation = %conversation_id, temp_id = %temp_id, "Message queued");
        self.bus.emit(&EngineEvent::MessagesChanged { conversation_id });
        Ok(temp_id)
    }

    /// Retry a failed message under its temporary id.
    pub fn resend(&mut self, temp_id: &MessageId) -> Result<()> {
        self.ensure_running()?;
        let pending = self.stores.messages.resend(temp_id)?;
        info!(temp_id = %temp_id, "Resending message");
        self.spawn_send(&pending);
        self.bus.emit(&EngineEvent::MessagesChanged {
            conversation_id: pending.conversation_id,
        });
        Ok(())
    }

    fn spawn_send(&mut self, pending: &Message) {
        let payload = SendMessagePayload {
            client_id: pending.id.clone(),
            content: pending.content.clone(),
            kind: pending.kind,
            attachment_ids: pending.attachments.iter().map(|a| a.id.clone()).collect(),
            reply_to: pending.reply_to.clone(),
        };
        let conversation_id = pending.conversation_id.clone();
        let temp_id = pending.id.clone();
        let api = self.api.clone();
        self.spawn(async move {
            let result = api.send_message(&conversation_id, &payload).await;
            Completion::Sent {
                conversation_id,
                temp_id,
                result,
            }
        });
    }

    /// Fold an own message into its conversation summary.
    fn touch_conversation(&mut self, message: &Message) {
        let active = self.selection.is_active(&message.conversation_id);
        match self.stores.conversations.apply_last_message(
            &message.conversation_id,
            MessageSummary::of(message),
            active,
            &self.session.user_id,
        ) {
            Ok(_) => self.bus.emit(&EngineEvent::ConversationsChanged),
            Err(e) => debug!(error = %e, "No summary to update"),
        }
    }

    /// Put the server copy of a confirmed send into the conversation summary
    /// in place of the optimistic one, whatever the two clocks say.
    fn settle_summary(&mut self, temp_id: &MessageId, confirmed: &Message) -> bool {
        let Some(sent_at) = self.pending_sends.remove(temp_id) else {
            return false;
        };
        match self.stores.conversations.replace_last_message(
            &confirmed.conversation_id,
            sent_at,
            MessageSummary::of(confirmed),
        ) {
            Ok(true) => {
                self.bus.emit(&EngineEvent::ConversationsChanged);
                true
            }
            Ok(false) => false,
            Err(e) => {
                debug!(error = %e, "No summary to settle");
                false
            }
        }
    }

    // --- Edits ---

    /// Edit a confirmed message. Resolves once the server has accepted it.
    pub fn edit(&mut self, message_id: MessageId, content: String, reply: Reply<Result<()>>) {
        let checked = self.editable(&message_id).and_then(|id| {
            if content.trim().is_empty() {
                Err(ClientError::EmptyMessage)
            } else {
                Ok(id)
            }
        });
        let id = match checked {
            Ok(id) => id,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        info!(message = %id, "Editing message");
        let api = self.api.clone();
        self.spawn(async move {
            Completion::Edited {
                result: api.edit_message(&id, &content).await,
                reply,
            }
        });
    }

    /// Delete a confirmed message; it stays in place as a tombstone.
    pub fn delete(&mut self, message_id: MessageId, reply: Reply<Result<()>>) {
        let id = match self.editable(&message_id) {
            Ok(id) => id,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        info!(message = %id, "Deleting message");
        let api = self.api.clone();
        self.spawn(async move {
            let result = api.delete_message(&id).await;
            Completion::Deleted {
                message_id: id,
                result,
                reply,
            }
        });
    }

    fn editable(&self, message_id: &MessageId) -> Result<MessageId> {
        self.ensure_running()?;
        let message = self
            .stores
            .messages
            .get(message_id)
            .ok_or_else(|| StoreError::MessageNotFound(message_id.clone()))?;
        if message.id.is_temporary() {
            return Err(ClientError::NotConfirmed(message.id.clone()));
        }
        if message.is_deleted {
            return Err(ClientError::MessageDeleted(message.id.clone()));
        }
        Ok(message.id.clone())
    }

    // --- Conversation management ---

    /// Pin or archive a conversation once the server has stored the flag.
    pub fn set_flag(
        &mut self,
        conversation_id: ConversationId,
        flag: ConversationFlag,
        value: bool,
        reply: Reply<Result<()>>,
    ) {
        if let Err(e) = self.ensure_running().and_then(|()| {
            if self.stores.conversations.contains(&conversation_id) {
                Ok(())
            } else {
                Err(StoreError::ConversationNotFound(conversation_id.clone()).into())
            }
        }) {
            let _ = reply.send(Err(e));
            return;
        }
        debug!(conversation = %conversation_id, ?flag, value, "Updating conversation flag");
        let api = self.api.clone();
        self.spawn(async move {
            let result = match flag {
                ConversationFlag::Pinned => api.set_pinned(&conversation_id, value).await,
                ConversationFlag::Archived => api.set_archived(&conversation_id, value).await,
            };
            Completion::Flagged {
                conversation_id,
                flag,
                value,
                result,
                reply,
            }
        });
    }

    /// Find or create the direct conversation with `recipient`.
    pub fn open_direct(&mut self, recipient: UserId, reply: Reply<Result<ConversationId>>) {
        if let Err(e) = self.ensure_running() {
            let _ = reply.send(Err(e));
            return;
        }
        if recipient == self.session.user_id {
            let _ = reply.send(Err(ClientError::OwnConversation));
            return;
        }
        info!(recipient = %recipient, "Opening direct conversation");
        let api = self.api.clone();
        self.spawn(async move {
            Completion::DirectOpened {
                result: api.create_direct_conversation(&recipient).await,
                reply,
            }
        });
    }

    // --- Read state ---

    /// Mark messages read: applied locally at once, confirmed per message.
    pub fn mark_read(&mut self, ids: Vec<MessageId>) -> Result<()> {
        self.ensure_running()?;
        let mut changed = Vec::new();
        let mut remote = Vec::new();
        for id in ids {
            let id = self.stores.messages.resolve(&id);
            match self.stores.messages.mark_read(&id) {
                Ok(_) => {
                    if let Some(message) = self.stores.messages.get(&id) {
                        if !changed.contains(&message.conversation_id) {
                            changed.push(message.conversation_id.clone());
                        }
                    }
                    if !id.is_temporary() {
                        remote.push(id);
                    }
                }
                Err(e) => debug!(message = %id, error = %e, "Cannot mark unknown message read"),
            }
        }
        for conversation_id in changed {
            self.bus.emit(&EngineEvent::MessagesChanged { conversation_id });
        }
        if remote.is_empty() {
            return Ok(());
        }

        let api = self.api.clone();
        self.spawn(async move {
            let requests = remote.iter().map(|id| api.mark_message_read(id));
            let results = join_all(requests).await;
            Completion::MarkedRead(remote.into_iter().zip(results).collect())
        });
        Ok(())
    }

    // --- Attachments ---

    pub fn upload_attachments(
        &mut self,
        conversation_id: ConversationId,
        files: Vec<FileCandidate>,
    ) -> Result<SelectionReport> {
        self.ensure_running()?;
        let (report, requests) = self.pipeline.select_files(&conversation_id, files);

        for (upload_id, request) in requests {
            let api = self.api.clone();
            let conversation_id = conversation_id.clone();
            let progress_tx = self.completions.clone();
            let progress: ProgressFn = Arc::new(move |percent| {
                let _ = progress_tx.send(Completion::UploadProgress { upload_id, percent });
            });
            self.spawn(async move {
                let result =
                    attachments::upload(api.as_ref(), &conversation_id, request, progress).await;
                Completion::Uploaded { upload_id, result }
            });
            self.bus.emit(&EngineEvent::AttachmentChanged {
                upload_id,
                attachment_id: None,
            });
        }
        Ok(report)
    }

    /// Wait for a scan push; fall back to polling when none arrives in time.
    fn watch_scan(&mut self, attachment_id: AttachmentId) {
        let api = self.api.clone();
        let wait = self.config.scan_event_timeout;
        let attempts = self.config.scan_poll_attempts;
        let backoff = Backoff::new(self.config.scan_poll_base, self.config.scan_poll_cap);
        let id = attachment_id.clone();
        let handle = self.spawn(async move {
            tokio::time::sleep(wait).await;
            debug!(attachment = %id, "No scan event in time, polling");
            let result = attachments::poll_scan_status(api.as_ref(), &id, attempts, backoff).await;
            Completion::ScanResolved {
                attachment_id: id,
                result,
            }
        });
        if let Some(previous) = self.scan_watches.insert(attachment_id, handle) {
            previous.abort();
        }
    }

    /// Watch stored attachments whose scan is still pending and that no
    /// watch covers yet.
    fn watch_pending(&mut self, attachment_ids: Vec<AttachmentId>) {
        for id in attachment_ids {
            if self.scan_watches.contains_key(&id) {
                continue;
            }
            if self.stores.messages.scan_status(&id) == Some(ScanStatus::Pending) {
                debug!(attachment = %id, "Watching inbound attachment scan");
                self.watch_scan(id);
            }
        }
    }

    fn apply_scan(&mut self, attachment_id: &AttachmentId, status: ScanStatus) {
        if status.is_terminal() {
            if let Some(watch) = self.scan_watches.remove(attachment_id) {
                watch.abort();
            }
        }
        match self.pipeline.apply_scan(attachment_id, status) {
            Ok(Some(upload_id)) => self.bus.emit(&EngineEvent::AttachmentChanged {
                upload_id,
                attachment_id: Some(attachment_id.clone()),
            }),
            Ok(None) => {}
            Err(e) => warn!(attachment = %attachment_id, error = %e, "Rejected scan transition"),
        }
    }

    // --- Typing ---

    pub fn set_typing(&mut self, conversation_id: ConversationId, typing: bool) -> Result<()> {
        self.ensure_running()?;
        let frame = if typing {
            ClientFrame::TypingStart { conversation_id }
        } else {
            ClientFrame::TypingStop { conversation_id }
        };
        self.command(TransportCommand::Send(frame));
        Ok(())
    }

    /// Purge expired typing indicators.
    pub fn sweep(&mut self, now: Instant) {
        for conversation_id in self.stores.typing.sweep(now) {
            self.emit_typing(conversation_id, now);
        }
    }

    fn emit_typing(&self, conversation_id: ConversationId, now: Instant) {
        let users = self.stores.typing.typing_users(&conversation_id, now);
        self.bus.emit(&EngineEvent::TypingChanged {
            conversation_id,
            users,
        });
    }

    // --- Transport ---

    pub fn on_transport(&mut self, notification: TransportNotification) {
        if self.ended {
            return;
        }
        match notification {
            TransportNotification::Connected { resync } => {
                info!(resync = resync.is_some(), "Push channel connected");
                self.set_connection(ConnectionState::Connected);
                self.reset_ephemeral();
                if let Some(active) = self.selection.conversation().cloned() {
                    self.command(TransportCommand::Send(ClientFrame::JoinConversation {
                        conversation_id: active,
                    }));
                }
                match resync {
                    None => {}
                    Some(ResyncOutcome::Delta(delta)) => self.apply_delta(delta.events),
                    Some(ResyncOutcome::Unavailable) => self.full_resync(),
                }
            }
            TransportNotification::Disconnected => {
                warn!("Push channel lost, data may be stale");
                self.set_connection(ConnectionState::Degraded);
            }
            TransportNotification::Event(envelope) => self.apply_push(&envelope.event),
            TransportNotification::SessionRejected => self.end_session(&NetError::Unauthorized),
        }
    }

    /// Only a loaded selection goes through `Reconciling`; one still
    /// `Loading` waits for its first page as before.
    fn apply_delta(&mut self, events: Vec<PushEnvelope>) {
        let ready = match &self.selection {
            SelectionState::Ready(id) => Some(id.clone()),
            _ => None,
        };
        if let Some(id) = &ready {
            self.set_selection(SelectionState::Reconciling(id.clone()));
        }
        debug!(events = events.len(), "Applying resync delta");
        for envelope in &events {
            self.apply_push(&envelope.event);
        }
        if let Some(id) = ready {
            if self.selection == SelectionState::Reconciling(id.clone()) {
                self.set_selection(SelectionState::Ready(id));
            }
        }
    }

    /// No delta: refetch the list and the active conversation only.
    fn full_resync(&mut self) {
        info!("No resync delta, refetching");
        self.refresh_conversations();
        if let Some(id) = self.selection.conversation().cloned() {
            if matches!(self.selection, SelectionState::Ready(_)) {
                self.set_selection(SelectionState::Reconciling(id.clone()));
            }
            self.fetch_first_page(id);
        }
    }

    /// Typing and presence are rebuilt from live events after a reconnect.
    fn reset_ephemeral(&mut self) {
        if !self.stores.typing.is_empty() {
            self.stores.typing.clear();
            if let Some(active) = self.selection.conversation().cloned() {
                self.bus.emit(&EngineEvent::TypingChanged {
                    conversation_id: active,
                    users: Vec::new(),
                });
            }
        }
        let online = self.stores.presence.online_users();
        self.stores.presence.clear();
        for user_id in online {
            self.bus.emit(&EngineEvent::PresenceChanged {
                user_id,
                online: false,
            });
        }
    }

    fn apply_push(&mut self, event: &PushEvent) {
        debug!(event = event.name(), "Applying push event");
        let now = tokio::time::Instant::now().into_std();
        let applied = {
            let ctx = ApplyContext {
                own_user: &self.session.user_id,
                active: self.selection.conversation(),
                typing_ttl: self.config.typing_ttl,
                now,
                received_at: Utc::now(),
            };
            apply_event(&mut self.stores, &ctx, event)
        };
        if let PushEvent::MessageNew(message) = event {
            if let Some(client_id) = &message.client_id {
                self.settle_summary(client_id, message);
            }
        }
        self.follow_up(applied, now);
    }

    fn follow_up(&mut self, applied: Applied, now: Instant) {
        if applied.conversations_changed {
            self.bus.emit(&EngineEvent::ConversationsChanged);
        }
        if let Some(conversation_id) = applied.messages_changed {
            self.bus.emit(&EngineEvent::MessagesChanged { conversation_id });
        }
        if let Some(conversation_id) = applied.typing_changed {
            self.emit_typing(conversation_id, now);
        }
        if let Some((user_id, online)) = applied.presence_changed {
            self.bus.emit(&EngineEvent::PresenceChanged { user_id, online });
        }
        if let Some((attachment_id, status)) = applied.scan {
            self.apply_scan(&attachment_id, status);
        }
        if !applied.pending_scans.is_empty() {
            self.watch_pending(applied.pending_scans);
        }
        if let Some(conversation_id) = applied.unknown_conversation {
            debug!(conversation = %conversation_id, "Refreshing conversation list");
            self.refresh_conversations();
        }
        if let Some(message_id) = applied.read_on_server {
            let api = self.api.clone();
            self.spawn(async move {
                Completion::Background {
                    what: "mark message read",
                    result: api.mark_message_read(&message_id).await,
                }
            });
        }
        if let Some(removed) = applied.removed_conversation {
            if self.selection.is_active(&removed) {
                info!(conversation = %removed, "Active conversation was deleted");
                if let Some(task) = self.page_task.take() {
                    task.abort();
                }
                self.generation += 1;
                self.set_selection(SelectionState::Idle);
            }
        }
    }

    // --- Completions ---

    pub fn on_completion(&mut self, completion: Completion) {
        if self.ended {
            return;
        }
        match completion {
            Completion::Conversations(result) => {
                self.refreshing = false;
                match result {
                    Ok(list) => self.merge_conversations(list),
                    Err(e) if e.is_auth() => return self.end_session(&e),
                    Err(e) => {
                        warn!(error = %e, "Failed to fetch conversations");
                        self.bus.emit(&EngineEvent::LoadFailed {
                            conversation_id: None,
                            error: e.to_string(),
                        });
                    }
                }
                if std::mem::take(&mut self.refresh_pending) {
                    debug!("Running the refresh queued behind the last one");
                    self.refresh_conversations();
                }
            }

            Completion::Page {
                conversation_id,
                generation,
                older,
                result,
            } => {
                if generation != self.generation {
                    debug!(conversation = %conversation_id, "Discarding stale page");
                    return;
                }
                if older {
                    self.older_in_flight = false;
                } else {
                    self.page_task = None;
                }
                match result {
                    Ok(page) => {
                        let pending: Vec<_> =
                            page.messages.iter().flat_map(apply::pending_scans).collect();
                        let inserted = self.stores.messages.load(&conversation_id, page);
                        self.watch_pending(pending);
                        debug!(conversation = %conversation_id, inserted, older, "Page applied");
                        if !older {
                            self.set_selection(SelectionState::Ready(conversation_id.clone()));
                        }
                        self.bus.emit(&EngineEvent::MessagesChanged { conversation_id });
                    }
                    Err(e) if e.is_auth() => self.end_session(&e),
                    Err(e) => {
                        warn!(conversation = %conversation_id, error = %e, "Failed to load messages");
                        if !older {
                            self.set_selection(SelectionState::Ready(conversation_id.clone()));
                        }
                        self.bus.emit(&EngineEvent::LoadFailed {
                            conversation_id: Some(conversation_id),
                            error: e.to_string(),
                        });
                    }
                }
            }

            Completion::Sent {
                conversation_id,
                temp_id,
                result,
            } => match result {
                Ok(confirmed) => {
                    debug!(temp_id = %temp_id, id = %confirmed.id, "Message confirmed");
                    if let Err(e) = self.stores.messages.reconcile(&temp_id, confirmed.clone()) {
                        warn!(temp_id = %temp_id, error = %e, "Could not reconcile confirmation");
                    }
                    if !self.settle_summary(&temp_id, &confirmed) {
                        self.touch_conversation(&confirmed);
                    }
                    self.bus.emit(&EngineEvent::MessagesChanged { conversation_id });
                }
                Err(e) if e.is_auth() => self.end_session(&e),
                Err(e) => {
                    warn!(temp_id = %temp_id, error = %e, "Send failed");
                    if let Ok(true) = self.stores.messages.mark_failed(&temp_id) {
                        self.bus.emit(&EngineEvent::SendFailed {
                            conversation_id: conversation_id.clone(),
                            temp_id,
                            error: e.to_string(),
                        });
                        self.bus.emit(&EngineEvent::MessagesChanged { conversation_id });
                    }
                }
            },

            Completion::MarkedRead(results) => {
                let mut report = MarkReadReport::default();
                let mut auth_error = None;
                for (id, result) in results {
                    match result {
                        Ok(()) => report.confirmed.push(id),
                        Err(e) => {
                            if e.is_auth() {
                                auth_error = Some(e.clone());
                            }
                            report.failed.push((id, e.to_string()));
                        }
                    }
                }
                if let Some(e) = auth_error {
                    self.end_session(&e);
                    return;
                }
                if !report.failed.is_empty() {
                    warn!(failed = report.failed.len(), "Some read marks were not confirmed");
                }
                self.bus.emit(&EngineEvent::MarkReadReport { report });
            }

            Completion::Background { what, result } => match result {
                Ok(()) => {}
                Err(e) if e.is_auth() => self.end_session(&e),
                Err(e) => warn!(what, error = %e, "Background request failed"),
            },

            Completion::UploadProgress { upload_id, percent } => {
                if self.pipeline.record_progress(upload_id, percent) {
                    self.bus.emit(&EngineEvent::AttachmentChanged {
                        upload_id,
                        attachment_id: None,
                    });
                }
            }

            Completion::Uploaded { upload_id, result } => match result {
                Ok(uploaded) => {
                    let Some(attachment) = self.pipeline.complete(upload_id, uploaded) else {
                        return;
                    };
                    info!(upload = %upload_id, attachment = %attachment.id, "Upload complete");
                    if !attachment.scan_status.is_terminal() {
                        self.watch_scan(attachment.id.clone());
                    }
                    self.bus.emit(&EngineEvent::AttachmentChanged {
                        upload_id,
                        attachment_id: Some(attachment.id),
                    });
                }
                Err(e) if e.is_auth() => self.end_session(&e),
                Err(e) => {
                    warn!(upload = %upload_id, error = %e, "Upload failed");
                    self.pipeline.fail(upload_id, &e);
                    self.bus.emit(&EngineEvent::AttachmentChanged {
                        upload_id,
                        attachment_id: None,
                    });
                }
            },

            Completion::ScanResolved {
                attachment_id,
                result,
            } => {
                self.scan_watches.remove(&attachment_id);
                let status = match result {
                    Ok(status) => status,
                    Err(e) if e.is_auth() => return self.end_session(&e),
                    Err(_) => ScanStatus::Failed,
                };
                if self.stores.messages.has_attachment(&attachment_id) {
                    match self.stores.messages.apply_scan_status(&attachment_id, status) {
                        Ok(message_id) => {
                            if let Some(message) = self.stores.messages.get(&message_id) {
                                self.bus.emit(&EngineEvent::MessagesChanged {
                                    conversation_id: message.conversation_id.clone(),
                                });
                            }
                        }
                        Err(e) => warn!(attachment = %attachment_id, error = %e, "Scan result not applied"),
                    }
                }
                self.apply_scan(&attachment_id, status);
            }

            Completion::Edited { result, reply } => {
                let outcome = match result {
                    Ok(edited) => {
                        let applied = apply::apply_edit(&mut self.stores, &edited);
                        self.follow_up(applied, tokio::time::Instant::now().into_std());
                        Ok(())
                    }
                    Err(e) => Err(self.request_failed("edit message", e)),
                };
                let _ = reply.send(outcome);
            }

            Completion::Deleted {
                message_id,
                result,
                reply,
            } => {
                let outcome = match result {
                    Ok(()) => {
                        let applied = apply::apply_removal(&mut self.stores, &message_id);
                        self.follow_up(applied, tokio::time::Instant::now().into_std());
                        Ok(())
                    }
                    Err(e) => Err(self.request_failed("delete message", e)),
                };
                let _ = reply.send(outcome);
            }

            Completion::Flagged {
                conversation_id,
                flag,
                value,
                result,
                reply,
            } => {
                let outcome = match result {
                    Ok(()) => {
                        let stored = match flag {
                            ConversationFlag::Pinned => {
                                self.stores.conversations.set_pinned(&conversation_id, value)
                            }
                            ConversationFlag::Archived => {
                                self.stores.conversations.set_archived(&conversation_id, value)
                            }
                        };
                        if stored.is_ok() {
                            self.bus.emit(&EngineEvent::ConversationsChanged);
                        }
                        stored.map_err(ClientError::from)
                    }
                    Err(e) => Err(self.request_failed("update conversation flag", e)),
                };
                let _ = reply.send(outcome);
            }

            Completion::DirectOpened { result, reply } => {
                let outcome = match result {
                    Ok(conversation) => {
                        let id = conversation.id.clone();
                        self.merge_conversations(vec![conversation]);
                        if self.stores.conversations.contains(&id) {
                            Ok(id)
                        } else {
                            Err(StoreError::ConversationNotFound(id).into())
                        }
                    }
                    Err(e) => Err(self.request_failed("open direct conversation", e)),
                };
                let _ = reply.send(outcome);
            }
        }
    }

    /// Log a failed user request; an auth failure also ends the session.
    fn request_failed(&mut self, what: &'static str, error: NetError) -> ClientError {
        if error.is_auth() {
            self.end_session(&error);
        } else {
            warn!(what, error = %error, "Request failed");
        }
        error.into()
    }

    fn merge_conversations(&mut self, list: Vec<Conversation>) {
        let count = list.len();
        for conversation in list {
            let id = conversation.id.clone();
            if let Err(e) = self.stores.conversations.upsert(conversation) {
                warn!(conversation = %id, error = %e, "Skipping invalid conversation");
                continue;
            }
            if self.selection.is_active(&id) {
                let _ = self.stores.conversations.set_unread(&id, 0);
            }
        }
        debug!(count, "Conversation list merged");
        self.bus.emit(&EngineEvent::ConversationsChanged);
    }

    // --- Reads ---

    pub fn snapshot(&self) -> Snapshot {
        let now = tokio::time::Instant::now().into_std();
        let active = self.selection.conversation();
        let all = ConversationFilter::default();
        Snapshot {
            selection: self.selection.clone(),
            connection: self.connection,
            conversations: self
                .stores
                .conversations
                .list(&all, Utc::now())
                .cloned()
                .collect(),
            messages: active
                .map(|id| self.stores.messages.messages(id).to_vec())
                .unwrap_or_default(),
            typing: active
                .map(|id| self.stores.typing.typing_users(id, now))
                .unwrap_or_default(),
            online: self.stores.presence.online_users(),
            uploads: self.pipeline.uploads().to_vec(),
            total_unread: self.stores.conversations.total_unread(),
            has_more: active.is_some_and(|id| self.stores.messages.has_more(id)),
        }
    }

    pub fn conversations(&self, filter: &ConversationFilter) -> Vec<Conversation> {
        self.stores
            .conversations
            .list(filter, Utc::now())
            .cloned()
            .collect()
    }

    pub fn messages(&self, conversation_id: &ConversationId) -> Result<Vec<Message>> {
        if !self.stores.conversations.contains(conversation_id) {
            return Err(StoreError::ConversationNotFound(conversation_id.clone()).into());
        }
        Ok(self.stores.messages.messages(conversation_id).to_vec())
    }

    // --- Task plumbing ---

    pub fn has_tasks(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Reap one finished task.
    pub async fn next_finished(&mut self) {
        if let Some(Err(e)) = self.tasks.join_next().await {
            if e.is_panic() {
                error!(error = %e, "Background task panicked");
            }
        }
    }

    fn spawn<F>(&mut self, work: F) -> AbortHandle
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let tx = self.completions.clone();
        self.tasks.spawn(async move {
            let _ = tx.send(work.await);
        })
    }

    fn command(&self, command: TransportCommand) {
        if let Err(e) = self.transport.try_send(command) {
            debug!(error = %e, "Transport command dropped");
        }
    }

    fn set_selection(&mut self, state: SelectionState) {
        if self.selection != state {
            self.selection = state.clone();
            self.bus.emit(&EngineEvent::SelectionChanged { state });
        }
    }

    fn set_connection(&mut self, state: ConnectionState) {
        if self.connection != state {
            self.connection = state;
            self.bus.emit(&EngineEvent::ConnectionChanged { state });
        }
    }
}
