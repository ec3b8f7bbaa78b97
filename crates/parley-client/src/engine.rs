//! Engine task and its handle.
//!
//! [`spawn_engine`] starts the push supervisor and a single engine task that
//! owns the [`SyncController`]. The returned [`EngineHandle`] is the only way
//! in: every call becomes an [`EngineCommand`] with a oneshot reply, so the
//! stores are never shared across tasks.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use parley_net::{
    spawn_transport, ChatApi, HttpApi, PushConnector, TransportNotification, WsConnector,
};
use parley_shared::models::{Conversation, Message};
use parley_shared::types::{ConversationId, MessageId, UploadId, UserId};
use parley_store::ConversationFilter;

use crate::attachments::{FileCandidate, SelectionReport};
use crate::config::EngineConfig;
use crate::controller::{Completion, ConversationFlag, Reply, SyncController};
use crate::error::{ClientError, Result};
use crate::events::{EngineEvent, EventBus, EventKind, Subscription};
use crate::state::{Session, Snapshot};

// ---------------------------------------------------------------------------
// Command types
// ---------------------------------------------------------------------------

/// Requests sent *into* the engine task.
#[derive(Debug)]
pub enum EngineCommand {
    Start(Reply<Result<()>>),
    Stop(Reply<Result<()>>),
    Logout(Reply<()>),
    Select {
        conversation_id: ConversationId,
        reply: Reply<Result<()>>,
    },
    LoadOlder(Reply<Result<bool>>),
    Send {
        conversation_id: ConversationId,
        content: String,
        uploads: Vec<UploadId>,
        reply_to: Option<MessageId>,
        reply: Reply<Result<MessageId>>,
    },
    Resend {
        temp_id: MessageId,
        reply: Reply<Result<()>>,
    },
    Edit {
        message_id: MessageId,
        content: String,
        reply: Reply<Result<()>>,
    },
    Delete {
        message_id: MessageId,
        reply: Reply<Result<()>>,
    },
    MarkRead {
        ids: Vec<MessageId>,
        reply: Reply<Result<()>>,
    },
    SetFlag {
        conversation_id: ConversationId,
        flag: ConversationFlag,
        value: bool,
        reply: Reply<Result<()>>,
    },
    OpenDirect {
        recipient: UserId,
        reply: Reply<Result<ConversationId>>,
    },
    UploadAttachments {
        conversation_id: ConversationId,
        files: Vec<FileCandidate>,
        reply: Reply<Result<SelectionReport>>,
    },
    SetTyping {
        conversation_id: ConversationId,
        typing: bool,
        reply: Reply<Result<()>>,
    },
    Snapshot(Reply<Snapshot>),
    Conversations {
        filter: ConversationFilter,
        reply: Reply<Vec<Conversation>>,
    },
    Messages {
        conversation_id: ConversationId,
        reply: Reply<Result<Vec<Message>>>,
    },
}

// ---------------------------------------------------------------------------
// Spawning
// ---------------------------------------------------------------------------

/// Spawn the engine with explicit collaborators.
pub fn spawn_engine(
    config: EngineConfig,
    session: Session,
    api: Arc<dyn ChatApi>,
    connector: Arc<dyn PushConnector>,
) -> EngineHandle {
    let (transport_tx, transport_rx) = spawn_transport(&config.transport, connector, api.clone());
    let (completion_tx, completion_rx) = mpsc::unbounded_channel::<Completion>();
    let (cmd_tx, cmd_rx) = mpsc::channel::<EngineCommand>(64);

    let bus = EventBus::new();
    let sweep_every = config.typing_sweep_interval;
    let controller = SyncController::init(
        config,
        session,
        api,
        bus.clone(),
        completion_tx,
        transport_tx,
    );

    tokio::spawn(run(controller, cmd_rx, transport_rx, completion_rx, sweep_every));

    EngineHandle { cmd_tx, bus }
}

/// Spawn the engine against the HTTP API and WebSocket push channel.
pub fn connect(config: EngineConfig, session: Session) -> Result<EngineHandle> {
    let api = HttpApi::new(&config.transport, session.token.clone())?;
    let connector = WsConnector::new(&config.transport, session.token.clone())?;
    Ok(spawn_engine(config, session, Arc::new(api), Arc::new(connector)))
}

// ---------------------------------------------------------------------------
// Engine loop
// ---------------------------------------------------------------------------

enum Step {
    Command(Option<EngineCommand>),
    Transport(Option<TransportNotification>),
    Completion(Completion),
    Sweep,
    Reaped,
}

async fn run(
    mut controller: SyncController,
    mut cmd_rx: mpsc::Receiver<EngineCommand>,
    mut transport_rx: mpsc::Receiver<TransportNotification>,
    mut completion_rx: mpsc::UnboundedReceiver<Completion>,
    sweep_every: std::time::Duration,
) {
    let mut sweep = interval(sweep_every);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut transport_open = true;

    info!("Engine task started");

    loop {
        let has_tasks = controller.has_tasks();
        let step = tokio::select! {
            cmd = cmd_rx.recv() => Step::Command(cmd),
            notification = transport_rx.recv(), if transport_open => Step::Transport(notification),
            Some(completion) = completion_rx.recv() => Step::Completion(completion),
            _ = sweep.tick() => Step::Sweep,
            _ = controller.next_finished(), if has_tasks => Step::Reaped,
        };

        match step {
            Step::Command(Some(cmd)) => handle_command(&mut controller, cmd),
            Step::Command(None) => {
                info!("All engine handles dropped");
                controller.teardown();
            }
            Step::Transport(Some(notification)) => controller.on_transport(notification),
            Step::Transport(None) => {
                debug!("Transport supervisor gone");
                transport_open = false;
            }
            Step::Completion(completion) => controller.on_completion(completion),
            Step::Sweep => controller.sweep(tokio::time::Instant::now().into_std()),
            Step::Reaped => {}
        }

        if controller.is_ended() {
            break;
        }
    }

    info!("Engine task terminated");
}

fn handle_command(controller: &mut SyncController, cmd: EngineCommand) {
    // A dropped reply receiver only means the caller stopped waiting.
    match cmd {
        EngineCommand::Start(reply) => {
            let _ = reply.send(controller.start());
        }
        EngineCommand::Stop(reply) => {
            let _ = reply.send(controller.stop());
        }
        EngineCommand::Logout(reply) => {
            controller.logout();
            let _ = reply.send(());
        }
        EngineCommand::Select {
            conversation_id,
            reply,
        } => {
            let _ = reply.send(controller.select(conversation_id));
        }
        EngineCommand::LoadOlder(reply) => {
            let _ = reply.send(controller.load_older());
        }
        EngineCommand::Send {
            conversation_id,
            content,
            uploads,
            reply_to,
            reply,
        } => {
            let _ = reply.send(controller.send(conversation_id, content, &uploads, reply_to));
        }
        EngineCommand::Resend { temp_id, reply } => {
            let _ = reply.send(controller.resend(&temp_id));
        }
        EngineCommand::Edit {
            message_id,
            content,
            reply,
        } => controller.edit(message_id, content, reply),
        EngineCommand::Delete { message_id, reply } => controller.delete(message_id, reply),
        EngineCommand::MarkRead { ids, reply } => {
            let _ = reply.send(controller.mark_read(ids));
        }
        EngineCommand::SetFlag {
            conversation_id,
            flag,
            value,
            reply,
        } => controller.set_flag(conversation_id, flag, value, reply),
        EngineCommand::OpenDirect { recipient, reply } => controller.open_direct(recipient, reply),
        EngineCommand::UploadAttachments {
            conversation_id,
            files,
            reply,
        } => {
            let _ = reply.send(controller.upload_attachments(conversation_id, files));
        }
        EngineCommand::SetTyping {
            conversation_id,
            typing,
            reply,
        } => {
            let _ = reply.send(controller.set_typing(conversation_id, typing));
        }
        EngineCommand::Snapshot(reply) => {
            let _ = reply.send(controller.snapshot());
        }
        EngineCommand::Conversations { filter, reply } => {
            let _ = reply.send(controller.conversations(&filter));
        }
        EngineCommand::Messages {
            conversation_id,
            reply,
        } => {
            let _ = reply.send(controller.messages(&conversation_id));
        }
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable front door to a running engine.
///
/// Every method fails with [`ClientError::EngineStopped`] once the engine
/// task has ended (logout or loss of authentication).
#[derive(Clone, Debug)]
pub struct EngineHandle {
    cmd_tx: mpsc::Sender<EngineCommand>,
    bus: EventBus,
}

impl EngineHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> EngineCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(reply))
            .await
            .map_err(|_| ClientError::EngineStopped)?;
        rx.await.map_err(|_| ClientError::EngineStopped)
    }

    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.bus.on(kind, handler)
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub async fn start(&self) -> Result<()> {
        self.request(EngineCommand::Start).await?
    }

    pub async fn stop(&self) -> Result<()> {
        self.request(EngineCommand::Stop).await?
    }

    pub async fn logout(&self) -> Result<()> {
        self.request(EngineCommand::Logout).await
    }

    pub async fn select(&self, conversation_id: ConversationId) -> Result<()> {
        self.request(|reply| EngineCommand::Select {
            conversation_id,
            reply,
        })
        .await?
    }

    pub async fn load_older(&self) -> Result<bool> {
        self.request(EngineCommand::LoadOlder).await?
    }

    /// Queue a message; returns its temporary id.
    pub async fn send(
        &self,
        conversation_id: ConversationId,
        content: impl Into<String>,
        uploads: Vec<UploadId>,
        reply_to: Option<MessageId>,
    ) -> Result<MessageId> {
        let content = content.into();
        self.request(|reply| EngineCommand::Send {
            conversation_id,
            content,
            uploads,
            reply_to,
            reply,
        })
        .await?
    }

    pub async fn resend(&self, temp_id: MessageId) -> Result<()> {
        self.request(|reply| EngineCommand::Resend { temp_id, reply })
            .await?
    }

    /// Replace the content of a confirmed message. Resolves once the server
    /// has accepted the edit.
    pub async fn edit(&self, message_id: MessageId, content: impl Into<String>) -> Result<()> {
        let content = content.into();
        self.request(|reply| EngineCommand::Edit {
            message_id,
            content,
            reply,
        })
        .await?
    }

    pub async fn delete(&self, message_id: MessageId) -> Result<()> {
        self.request(|reply| EngineCommand::Delete { message_id, reply })
            .await?
    }

    pub async fn set_pinned(&self, conversation_id: ConversationId, pinned: bool) -> Result<()> {
        self.request(|reply| EngineCommand::SetFlag {
            conversation_id,
            flag: ConversationFlag::Pinned,
            value: pinned,
            reply,
        })
        .await?
    }

    pub async fn set_archived(&self, conversation_id: ConversationId, archived: bool) -> Result<()> {
        self.request(|reply| EngineCommand::SetFlag {
            conversation_id,
            flag: ConversationFlag::Archived,
            value: archived,
            reply,
        })
        .await?
    }

    /// Find or create the direct conversation with `recipient`.
    pub async fn open_direct(&self, recipient: UserId) -> Result<ConversationId> {
        self.request(|reply| EngineCommand::OpenDirect { recipient, reply })
            .await?
    }

    pub async fn mark_read(&self, ids: Vec<MessageId>) -> Result<()> {
        self.request(|reply| EngineCommand::MarkRead { ids, reply })
            .await?
    }

    pub async fn upload_attachments(
        &self,
        conversation_id: ConversationId,
        files: Vec<FileCandidate>,
    ) -> Result<SelectionReport> {
        self.request(|reply| EngineCommand::UploadAttachments {
            conversation_id,
            files,
            reply,
        })
        .await?
    }

    pub async fn set_typing(&self, conversation_id: ConversationId, typing: bool) -> Result<()> {
        self.request(|reply| EngineCommand::SetTyping {
            conversation_id,
            typing,
            reply,
        })
        .await?
    }

    pub async fn snapshot(&self) -> Result<Snapshot> {
        self.request(EngineCommand::Snapshot).await
    }

    pub async fn conversations(&self, filter: ConversationFilter) -> Result<Vec<Conversation>> {
        self.request(|reply| EngineCommand::Conversations { filter, reply })
            .await
    }

    pub async fn messages(&self, conversation_id: ConversationId) -> Result<Vec<Message>> {
        self.request(|reply| EngineCommand::Messages {
            conversation_id,
            reply,
        })
        .await?
    }
}
