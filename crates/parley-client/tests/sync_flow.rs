//! End-to-end engine scenarios against in-memory fakes of the chat API and
//! the push channel.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::channel::mpsc as fmpsc;
use futures::StreamExt;
use tokio::sync::mpsc;

use parley_client::{
    spawn_engine, ClientError, EngineConfig, EngineEvent, EngineHandle, EventKind, FileCandidate,
    SelectionState, Session, Snapshot,
};
use parley_net::{ChatApi, NetError, ProgressFn, PushConnector, PushSession, UploadRequest};
use parley_shared::constants::DELETED_MESSAGE_PLACEHOLDER;
use parley_shared::models::{
    Attachment, AttachmentMetadata, Conversation, Message, MessageKind, MessageStatus, ScanStatus,
};
use parley_shared::protocol::{
    ClientFrame, MessagePage, MessageRemoval, PresenceUpdate, PushEnvelope, PushEvent,
    ResyncDelta, ScanStatusResponse, SendMessagePayload, SyncPoint, TypingNotice,
    UploadedAttachment,
};
use parley_shared::types::{
    AttachmentId, ConnectionState, ConversationId, MessageId, PageCursor, UserId,
};
use parley_store::{Category, ConversationFilter};

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeApi {
    conversations: Mutex<Vec<Conversation>>,
    pages: Mutex<HashMap<ConversationId, MessagePage>>,
    /// Failures handed out to the next sends, in order.
    send_failures: Mutex<VecDeque<NetError>>,
    /// Server ids handed out to the next sends; `m<n>` once empty.
    server_ids: Mutex<VecDeque<String>>,
    sent: Mutex<Vec<SendMessagePayload>>,
    read_failures: Mutex<HashSet<MessageId>>,
    delta: Mutex<Option<ResyncDelta>>,
    unauthorized: AtomicBool,
    next_id: AtomicU32,
    /// Held back before answering the next conversation list request.
    list_delay: Mutex<Option<Duration>>,
    list_calls: AtomicU32,
    page_delays: Mutex<HashMap<ConversationId, Duration>>,
    page_calls: AtomicU32,
    /// Server timestamp stamped on confirmed sends; `Utc::now()` when unset.
    send_clock: Mutex<Option<DateTime<Utc>>>,
    delivered: Mutex<Vec<Message>>,
    deleted: Mutex<Vec<MessageId>>,
    flags: Mutex<Vec<(ConversationId, &'static str, bool)>>,
    scan_results: Mutex<HashMap<AttachmentId, ScanStatus>>,
}

impl FakeApi {
    fn with_conversations(ids: &[&str]) -> Arc<Self> {
        let api = Self::default();
        *api.conversations.lock().unwrap() = ids.iter().map(|id| conversation(id)).collect();
        Arc::new(api)
    }

    fn set_page(&self, conversation_id: &str, messages: Vec<Message>) {
        self.pages.lock().unwrap().insert(
            ConversationId::from(conversation_id),
            MessagePage {
                messages,
                next_cursor: None,
                has_more: false,
            },
        );
    }
}

#[async_trait]
impl ChatApi for FakeApi {
    async fn fetch_conversations(&self) -> parley_net::Result<Vec<Conversation>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.unauthorized.load(Ordering::SeqCst) {
            return Err(NetError::Unauthorized);
        }
        // The answer reflects the server at request time.
        let list = self.conversations.lock().unwrap().clone();
        let delay = self.list_delay.lock().unwrap().take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(list)
    }

    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
        _cursor: Option<&PageCursor>,
    ) -> parley_net::Result<MessagePage> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        let page = self
            .pages
            .lock()
            .unwrap()
            .get(conversation_id)
            .cloned()
            .unwrap_or_default();
        let delay = self.page_delays.lock().unwrap().get(conversation_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(page)
    }

    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        payload: &SendMessagePayload,
    ) -> parley_net::Result<Message> {
        self.sent.lock().unwrap().push(payload.clone());
        if let Some(e) = self.send_failures.lock().unwrap().pop_front() {
            return Err(e);
        }
        let id = self.server_ids.lock().unwrap().pop_front().unwrap_or_else(|| {
            format!("m{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 100)
        });
        let created_at = self.send_clock.lock().unwrap().unwrap_or_else(Utc::now);
        let confirmed = Message {
            id: MessageId::new(id),
            conversation_id: conversation_id.clone(),
            sender_id: UserId::from("me"),
            content: payload.content.clone(),
            kind: payload.kind,
            attachments: Vec::new(),
            status: MessageStatus::Sent,
            created_at,
            reply_to: payload.reply_to.clone(),
            is_read: true,
            client_id: Some(payload.client_id.clone()),
            is_edited: false,
            is_deleted: false,
        };
        self.delivered.lock().unwrap().push(confirmed.clone());
        Ok(confirmed)
    }

    async fn edit_message(
        &self,
        message_id: &MessageId,
        content: &str,
    ) -> parley_net::Result<Message> {
        let delivered = self.delivered.lock().unwrap().clone();
        let mut message = delivered
            .into_iter()
            .find(|m| &m.id == message_id)
            .ok_or(NetError::NotFound)?;
        message.content = content.to_string();
        message.is_edited = true;
        Ok(message)
    }

    async fn delete_message(&self, message_id: &MessageId) -> parley_net::Result<()> {
        self.deleted.lock().unwrap().push(message_id.clone());
        Ok(())
    }

    async fn mark_message_read(&self, message_id: &MessageId) -> parley_net::Result<()> {
        if self.read_failures.lock().unwrap().contains(message_id) {
            return Err(NetError::Transient("read mark dropped".into()));
        }
        Ok(())
    }

    async fn mark_conversation_read(&self, _: &ConversationId) -> parley_net::Result<()> {
        Ok(())
    }

    async fn create_direct_conversation(
        &self,
        recipient_id: &UserId,
    ) -> parley_net::Result<Conversation> {
        let mut direct = conversation(&format!("d-{recipient_id}"));
        direct.participants = BTreeSet::from([UserId::from("me"), recipient_id.clone()]);
        self.conversations.lock().unwrap().push(direct.clone());
        Ok(direct)
    }

    async fn set_archived(
        &self,
        conversation_id: &ConversationId,
        archived: bool,
    ) -> parley_net::Result<()> {
        self.flags
            .lock()
            .unwrap()
            .push((conversation_id.clone(), "archived", archived));
        Ok(())
    }

    async fn set_pinned(&self, conversation_id: &ConversationId, pinned: bool) -> parley_net::Result<()> {
        self.flags
            .lock()
            .unwrap()
            .push((conversation_id.clone(), "pinned", pinned));
        Ok(())
    }

    async fn upload_attachment(
        &self,
        _: &ConversationId,
        _upload: UploadRequest,
        progress: ProgressFn,
    ) -> parley_net::Result<UploadedAttachment> {
        progress(40);
        progress(99);
        Ok(UploadedAttachment {
            id: AttachmentId::from("a1"),
            url: "https://files.example/a1".into(),
            scan_status: Some(ScanStatus::Pending),
        })
    }

    async fn fetch_scan_status(
        &self,
        attachment_id: &AttachmentId,
    ) -> parley_net::Result<ScanStatusResponse> {
        let status = self
            .scan_results
            .lock()
            .unwrap()
            .get(attachment_id)
            .copied()
            .unwrap_or(ScanStatus::Pending);
        Ok(ScanStatusResponse {
            attachment_id: attachment_id.clone(),
            status,
        })
    }

    async fn fetch_resync_delta(&self, _: &SyncPoint) -> parley_net::Result<Option<ResyncDelta>> {
        Ok(self.delta.lock().unwrap().take())
    }
}

type PushTx = fmpsc::UnboundedSender<parley_net::Result<PushEnvelope>>;

/// Hands out prepared sessions; refuses once they run out.
#[derive(Default)]
struct FakeConnector {
    sessions: Mutex<VecDeque<PushSession>>,
}

impl FakeConnector {
    fn prepare(&self) -> (PushTx, mpsc::Receiver<ClientFrame>) {
        let (push_tx, push_rx) = fmpsc::unbounded();
        let (out_tx, out_rx) = mpsc::channel(64);
        self.sessions.lock().unwrap().push_back(PushSession {
            events: push_rx.boxed(),
            outbound: out_tx,
        });
        (push_tx, out_rx)
    }
}

#[async_trait]
impl PushConnector for FakeConnector {
    async fn connect(&self) -> parley_net::Result<PushSession> {
        self.sessions
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| NetError::Transient("no session prepared".into()))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, hour, minute, 0).unwrap()
}

fn conversation(id: &str) -> Conversation {
    Conversation {
        id: ConversationId::from(id),
        participants: BTreeSet::from([UserId::from("me"), UserId::from("bob")]),
        is_group: false,
        name: None,
        last_message: None,
        unread_count: 0,
        is_pinned: false,
        is_archived: false,
        job_related: None,
        updated_at: at(9, 0),
    }
}

fn message(id: &str, conversation_id: &str, created_at: DateTime<Utc>) -> Message {
    Message {
        id: MessageId::from(id),
        conversation_id: ConversationId::from(conversation_id),
        sender_id: UserId::from("bob"),
        content: format!("text of {id}"),
        kind: MessageKind::Text,
        attachments: Vec::new(),
        status: MessageStatus::Sent,
        created_at,
        reply_to: None,
        is_read: false,
        client_id: None,
        is_edited: false,
        is_deleted: false,
    }
}

fn push(tx: &PushTx, event: PushEvent) {
    tx.unbounded_send(Ok(PushEnvelope {
        cursor: None,
        event,
    }))
    .expect("push channel open");
}

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.transport.reconnect_base = Duration::from_millis(10);
    config.transport.reconnect_cap = Duration::from_millis(40);
    config.typing_ttl = Duration::from_millis(150);
    config.typing_sweep_interval = Duration::from_millis(20);
    config.scan_event_timeout = Duration::from_millis(60);
    config.scan_poll_attempts = 3;
    config.scan_poll_base = Duration::from_millis(10);
    config.scan_poll_cap = Duration::from_millis(40);
    config
}

fn engine(api: Arc<FakeApi>, connector: Arc<FakeConnector>) -> EngineHandle {
    spawn_engine(
        test_config(),
        Session::new(UserId::from("me"), "token"),
        api,
        connector,
    )
}

/// Poll snapshots until `check` holds.
async fn eventually(handle: &EngineHandle, check: impl Fn(&Snapshot) -> bool) -> Snapshot {
    for _ in 0..300 {
        let snapshot = handle.snapshot().await.expect("engine running");
        if check(&snapshot) {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held");
}

/// Start the engine and wait for the list and the push channel.
async fn started(handle: &EngineHandle, conversations: usize) {
    handle.start().await.unwrap();
    eventually(handle, |s| {
        s.connection == ConnectionState::Connected && s.conversations.len() == conversations
    })
    .await;
}

async fn select_ready(handle: &EngineHandle, id: &str) -> Snapshot {
    let id = ConversationId::from(id);
    handle.select(id.clone()).await.unwrap();
    eventually(handle, |s| s.selection == SelectionState::Ready(id.clone())).await
}

fn ids(snapshot: &Snapshot) -> Vec<&str> {
    snapshot.messages.iter().map(|m| m.id.as_str()).collect()
}

fn record(handle: &EngineHandle, kind: EventKind) -> (Arc<Mutex<Vec<EngineEvent>>>, parley_client::Subscription) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let sub = handle.on(kind, move |event| sink.lock().unwrap().push(event.clone()));
    (seen, sub)
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_late_push_lands_in_order() {
    let api = FakeApi::with_conversations(&["c1"]);
    api.set_page(
        "c1",
        vec![message("B", "c1", at(10, 2)), message("A", "c1", at(10, 0))],
    );
    let connector = Arc::new(FakeConnector::default());
    let (push_tx, _out) = connector.prepare();
    let handle = engine(api, connector);

    started(&handle, 1).await;
    select_ready(&handle, "c1").await;

    push(&push_tx, PushEvent::MessageNew(message("C", "c1", at(10, 1))));
    let snapshot = eventually(&handle, |s| s.messages.len() == 3).await;
    assert_eq!(ids(&snapshot), vec!["A", "C", "B"]);
}

#[tokio::test]
async fn test_optimistic_send_collapses_with_echo() {
    let api = FakeApi::with_conversations(&["c1"]);
    api.server_ids.lock().unwrap().push_back("m99".into());
    let connector = Arc::new(FakeConnector::default());
    let (push_tx, _out) = connector.prepare();
    let handle = engine(api.clone(), connector);

    started(&handle, 1).await;
    select_ready(&handle, "c1").await;

    let temp_id = handle
        .send(ConversationId::from("c1"), "hi", Vec::new(), None)
        .await
        .unwrap();
    assert!(temp_id.is_temporary());

    let snapshot = eventually(&handle, |s| s.messages.iter().any(|m| m.id.as_str() == "m99")).await;
    let echo = snapshot.messages[0].clone();
    push(&push_tx, PushEvent::MessageNew(echo));

    tokio::time::sleep(Duration::from_millis(50)).await;
    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.messages.len(), 1);
    let confirmed = &snapshot.messages[0];
    assert_eq!(confirmed.id.as_str(), "m99");
    assert_eq!(confirmed.content, "hi");
    assert_eq!(confirmed.status, MessageStatus::Sent);

    let sent = api.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].client_id, temp_id);
}

#[tokio::test]
async fn test_unread_counts_until_selected() {
    let api = FakeApi::with_conversations(&["c1", "c2"]);
    let connector = Arc::new(FakeConnector::default());
    let (push_tx, _out) = connector.prepare();
    let handle = engine(api, connector);

    started(&handle, 2).await;
    select_ready(&handle, "c1").await;

    for (i, minute) in [(1, 5), (2, 6), (3, 7)] {
        push(&push_tx, PushEvent::MessageNew(message(&format!("x{i}"), "c2", at(10, minute))));
    }
    let unread_of = |s: &Snapshot, id: &str| {
        s.conversations
            .iter()
            .find(|c| c.id.as_str() == id)
            .map(|c| c.unread_count)
    };
    let snapshot = eventually(&handle, |s| unread_of(s, "c2") == Some(3)).await;
    assert_eq!(snapshot.total_unread, 3);
    // Newest activity first.
    assert_eq!(snapshot.conversations[0].id.as_str(), "c2");

    // Inbound while selected stays at zero.
    push(&push_tx, PushEvent::MessageNew(message("y1", "c1", at(10, 8))));
    eventually(&handle, |s| s.messages.len() == 1).await;
    assert_eq!(unread_of(&handle.snapshot().await.unwrap(), "c1"), Some(0));

    let snapshot = select_ready(&handle, "c2").await;
    assert_eq!(unread_of(&snapshot, "c2"), Some(0));
    assert_eq!(snapshot.total_unread, 0);
}

#[tokio::test]
async fn test_scan_without_event_fails_safe() {
    let api = FakeApi::with_conversations(&["c1"]);
    let connector = Arc::new(FakeConnector::default());
    let (_push_tx, _out) = connector.prepare();
    let handle = engine(api, connector);

    started(&handle, 1).await;
    select_ready(&handle, "c1").await;

    let report = handle
        .upload_attachments(
            ConversationId::from("c1"),
            vec![
                FileCandidate::new("report.pdf", "application/pdf", vec![7u8; 512]),
                FileCandidate::new("empty.png", "image/png", Vec::<u8>::new()),
            ],
        )
        .await
        .unwrap();
    assert_eq!(report.accepted.len(), 1);
    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].filename, "empty.png");

    let snapshot = eventually(&handle, |s| {
        s.uploads
            .first()
            .is_some_and(|u| u.scan_status() == Some(ScanStatus::Failed))
    })
    .await;
    assert_eq!(snapshot.uploads[0].progress, 100);
    let attachment = snapshot.uploads[0].attachment.as_ref().unwrap();
    assert!(!attachment.is_downloadable());
}

#[tokio::test]
async fn test_scan_push_settles_upload() {
    let api = FakeApi::with_conversations(&["c1"]);
    let connector = Arc::new(FakeConnector::default());
    let (push_tx, _out) = connector.prepare();
    let handle = engine(api, connector);

    started(&handle, 1).await;
    let report = handle
        .upload_attachments(
            ConversationId::from("c1"),
            vec![FileCandidate::new("cat.png", "image/png", vec![1u8; 64])],
        )
        .await
        .unwrap();
    eventually(&handle, |s| s.uploads.first().is_some_and(|u| u.attachment.is_some())).await;

    push(
        &push_tx,
        PushEvent::ScanStatus(parley_shared::protocol::ScanUpdate {
            attachment_id: AttachmentId::from("a1"),
            status: ScanStatus::Clean,
        }),
    );
    eventually(&handle, |s| s.uploads[0].scan_status() == Some(ScanStatus::Clean)).await;

    // The poll fallback was cancelled: the status stays clean past the timeout.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.uploads[0].scan_status(), Some(ScanStatus::Clean));

    let temp_id = handle
        .send(ConversationId::from("c1"), "", report.accepted.clone(), None)
        .await
        .unwrap();
    assert!(temp_id.is_temporary());
}

#[tokio::test]
async fn test_reconnect_applies_missed_messages_once() {
    let api = FakeApi::with_conversations(&["c1"]);
    let connector = Arc::new(FakeConnector::default());
    let (first_tx, _first_out) = connector.prepare();
    let handle = engine(api.clone(), connector.clone());

    started(&handle, 1).await;
    select_ready(&handle, "c1").await;
    push(&first_tx, PushEvent::MessageNew(message("m1", "c1", at(10, 0))));
    eventually(&handle, |s| s.messages.len() == 1).await;

    // Three messages arrive while disconnected; the delta also repeats m1.
    let missed: Vec<PushEnvelope> = [
        message("m1", "c1", at(10, 0)),
        message("m2", "c1", at(10, 1)),
        message("m3", "c1", at(10, 2)),
        message("m4", "c1", at(10, 3)),
    ]
    .into_iter()
    .map(|m| PushEnvelope {
        cursor: None,
        event: PushEvent::MessageNew(m),
    })
    .collect();
    *api.delta.lock().unwrap() = Some(ResyncDelta {
        events: missed,
        cursor: None,
    });
    let (second_tx, mut second_out) = connector.prepare();
    drop(first_tx);

    eventually(&handle, |s| s.messages.len() == 4 && s.connection == ConnectionState::Connected).await;
    // The active room is rejoined on the new channel.
    let frame = tokio::time::timeout(Duration::from_secs(1), second_out.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        frame,
        ClientFrame::JoinConversation {
            conversation_id: ConversationId::from("c1")
        }
    );

    // A late duplicate on the new channel changes nothing.
    push(&second_tx, PushEvent::MessageNew(message("m4", "c1", at(10, 3))));
    tokio::time::sleep(Duration::from_millis(50)).await;
    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(ids(&snapshot), vec!["m1", "m2", "m3", "m4"]);
    assert_eq!(snapshot.selection, SelectionState::Ready(ConversationId::from("c1")));
}

#[tokio::test]
async fn test_failed_send_can_be_resent() {
    let api = FakeApi::with_conversations(&["c1"]);
    api.send_failures
        .lock()
        .unwrap()
        .push_back(NetError::Transient("gateway timeout".into()));
    let connector = Arc::new(FakeConnector::default());
    let (_push_tx, _out) = connector.prepare();
    let handle = engine(api.clone(), connector);
    let (failures, _sub) = record(&handle, EventKind::SendFailed);

    started(&handle, 1).await;
    select_ready(&handle, "c1").await;

    let temp_id = handle
        .send(ConversationId::from("c1"), "retry me", Vec::new(), None)
        .await
        .unwrap();
    let snapshot = eventually(&handle, |s| {
        s.messages.first().is_some_and(|m| m.status == MessageStatus::Failed)
    })
    .await;
    assert_eq!(snapshot.messages[0].id, temp_id);
    assert_eq!(snapshot.messages[0].content, "retry me");
    assert_eq!(failures.lock().unwrap().len(), 1);

    handle.resend(temp_id.clone()).await.unwrap();
    let snapshot = eventually(&handle, |s| {
        s.messages.first().is_some_and(|m| m.status == MessageStatus::Sent)
    })
    .await;
    assert_eq!(snapshot.messages.len(), 1);
    assert!(!snapshot.messages[0].id.is_temporary());

    let sent = api.sent.lock().unwrap();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|p| p.client_id == temp_id));
}

#[tokio::test]
async fn test_mark_read_reports_partial_failure() {
    let api = FakeApi::with_conversations(&["c1"]);
    api.set_page(
        "c1",
        vec![message("m1", "c1", at(10, 0)), message("m2", "c1", at(10, 1))],
    );
    api.read_failures.lock().unwrap().insert(MessageId::from("m2"));
    let connector = Arc::new(FakeConnector::default());
    let (_push_tx, _out) = connector.prepare();
    let handle = engine(api, connector);
    let (reports, _sub) = record(&handle, EventKind::MarkReadReport);

    started(&handle, 1).await;
    select_ready(&handle, "c1").await;

    handle
        .mark_read(vec![MessageId::from("m1"), MessageId::from("m2")])
        .await
        .unwrap();
    // Local state is updated before the server answers and is not rolled back.
    let snapshot = handle.snapshot().await.unwrap();
    assert!(snapshot.messages.iter().all(|m| m.is_read));

    for _ in 0..100 {
        if !reports.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let reports = reports.lock().unwrap();
    let EngineEvent::MarkReadReport { report } = &reports[0] else {
        panic!("unexpected event {:?}", reports[0]);
    };
    assert_eq!(report.confirmed, vec![MessageId::from("m1")]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, MessageId::from("m2"));
}

#[tokio::test]
async fn test_typing_indicator_expires() {
    let api = FakeApi::with_conversations(&["c1"]);
    let connector = Arc::new(FakeConnector::default());
    let (push_tx, _out) = connector.prepare();
    let handle = engine(api, connector);

    started(&handle, 1).await;
    select_ready(&handle, "c1").await;

    let notice = |user: &str| TypingNotice {
        conversation_id: ConversationId::from("c1"),
        user_id: UserId::from(user),
        ttl_ms: None,
    };
    push(&push_tx, PushEvent::TypingStart(notice("me")));
    push(&push_tx, PushEvent::TypingStart(notice("bob")));
    let snapshot = eventually(&handle, |s| !s.typing.is_empty()).await;
    assert_eq!(snapshot.typing, vec![UserId::from("bob")]);

    eventually(&handle, |s| s.typing.is_empty()).await;
}

#[tokio::test]
async fn test_lost_authentication_ends_session() {
    let api = FakeApi::with_conversations(&["c1"]);
    api.unauthorized.store(true, Ordering::SeqCst);
    let connector = Arc::new(FakeConnector::default());
    let (_push_tx, _out) = connector.prepare();
    let handle = engine(api, connector);
    let (ended, _sub) = record(&handle, EventKind::SessionEnded);

    handle.start().await.unwrap();
    for _ in 0..100 {
        if !ended.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(ended.lock().unwrap().as_slice(), &[EngineEvent::SessionEnded]);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(matches!(handle.snapshot().await, Err(ClientError::EngineStopped)));
}

#[tokio::test]
async fn test_logout_stops_engine() {
    let api = FakeApi::with_conversations(&["c1"]);
    let connector = Arc::new(FakeConnector::default());
    let (_push_tx, _out) = connector.prepare();
    let handle = engine(api, connector);

    started(&handle, 1).await;
    handle.logout().await.unwrap();

    let err = handle.select(ConversationId::from("c1")).await.unwrap_err();
    assert!(matches!(err, ClientError::EngineStopped));
}

#[tokio::test]
async fn test_refresh_requested_during_fetch_runs_afterwards() {
    let api = FakeApi::with_conversations(&["c1"]);
    *api.list_delay.lock().unwrap() = Some(Duration::from_millis(300));
    let connector = Arc::new(FakeConnector::default());
    let (push_tx, _out) = connector.prepare();
    let handle = engine(api.clone(), connector);

    handle.start().await.unwrap();
    eventually(&handle, |s| s.connection == ConnectionState::Connected).await;

    // c9 is created after the slow list request was answered server-side.
    api.conversations.lock().unwrap().push(conversation("c9"));
    push(&push_tx, PushEvent::MessageNew(message("n1", "c9", at(11, 0))));

    let snapshot = eventually(&handle, |s| {
        s.conversations.iter().any(|c| c.id.as_str() == "c9")
    })
    .await;
    assert_eq!(snapshot.conversations.len(), 2);
    assert_eq!(api.list_calls.load(Ordering::SeqCst), 2);
    assert_eq!(handle.messages(ConversationId::from("c9")).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_reconnect_while_loading_waits_for_first_page() {
    let api = FakeApi::with_conversations(&["c1"]);
    api.set_page("c1", vec![message("m1", "c1", at(10, 0))]);
    api.page_delays
        .lock()
        .unwrap()
        .insert(ConversationId::from("c1"), Duration::from_millis(400));
    *api.delta.lock().unwrap() = Some(ResyncDelta::default());
    let connector = Arc::new(FakeConnector::default());
    let (first_tx, _first_out) = connector.prepare();
    let handle = engine(api, connector.clone());

    started(&handle, 1).await;
    let c1 = ConversationId::from("c1");
    handle.select(c1.clone()).await.unwrap();

    let (_second_tx, mut second_out) = connector.prepare();
    drop(first_tx);
    let frame = tokio::time::timeout(Duration::from_secs(1), second_out.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frame, ClientFrame::JoinConversation { conversation_id: c1.clone() });

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.selection, SelectionState::Loading(c1.clone()));
    assert!(snapshot.messages.is_empty());

    let snapshot = eventually(&handle, |s| s.selection == SelectionState::Ready(c1.clone())).await;
    assert_eq!(ids(&snapshot), vec!["m1"]);
}

#[tokio::test]
async fn test_reconnect_clears_presence() {
    let api = FakeApi::with_conversations(&["c1"]);
    let connector = Arc::new(FakeConnector::default());
    let (first_tx, _first_out) = connector.prepare();
    let handle = engine(api, connector.clone());
    let (changes, _sub) = record(&handle, EventKind::PresenceChanged);

    started(&handle, 1).await;
    push(
        &first_tx,
        PushEvent::UserStatus(PresenceUpdate {
            user_id: UserId::from("bob"),
            online: true,
        }),
    );
    eventually(&handle, |s| s.online == vec![UserId::from("bob")]).await;

    let (_second_tx, _second_out) = connector.prepare();
    drop(first_tx);
    eventually(&handle, |s| s.online.is_empty()).await;

    let changes = changes.lock().unwrap();
    assert_eq!(
        changes.last(),
        Some(&EngineEvent::PresenceChanged {
            user_id: UserId::from("bob"),
            online: false,
        })
    );
}

#[tokio::test]
async fn test_reconnect_without_delta_refetches() {
    let api = FakeApi::with_conversations(&["c1"]);
    api.set_page("c1", vec![message("m1", "c1", at(10, 0))]);
    let connector = Arc::new(FakeConnector::default());
    let (first_tx, _first_out) = connector.prepare();
    let handle = engine(api.clone(), connector.clone());

    started(&handle, 1).await;
    select_ready(&handle, "c1").await;
    let lists_before = api.list_calls.load(Ordering::SeqCst);
    let pages_before = api.page_calls.load(Ordering::SeqCst);

    // Missed while offline; the server has no delta to offer.
    api.set_page(
        "c1",
        vec![message("m1", "c1", at(10, 0)), message("m2", "c1", at(10, 5))],
    );
    api.conversations.lock().unwrap().push(conversation("c2"));
    let (_second_tx, _second_out) = connector.prepare();
    drop(first_tx);

    let snapshot = eventually(&handle, |s| {
        s.messages.len() == 2
            && s.conversations.len() == 2
            && s.selection == SelectionState::Ready(ConversationId::from("c1"))
    })
    .await;
    assert_eq!(ids(&snapshot), vec!["m1", "m2"]);
    assert_eq!(api.list_calls.load(Ordering::SeqCst), lists_before + 1);
    assert_eq!(api.page_calls.load(Ordering::SeqCst), pages_before + 1);
}

#[tokio::test]
async fn test_switching_conversation_discards_stale_page() {
    let api = FakeApi::with_conversations(&["c1", "c2"]);
    api.set_page("c1", vec![message("a1", "c1", at(10, 0))]);
    api.set_page("c2", vec![message("b1", "c2", at(10, 1))]);
    api.page_delays
        .lock()
        .unwrap()
        .insert(ConversationId::from("c1"), Duration::from_millis(200));
    let connector = Arc::new(FakeConnector::default());
    let (_push_tx, _out) = connector.prepare();
    let handle = engine(api, connector);

    started(&handle, 2).await;
    handle.select(ConversationId::from("c1")).await.unwrap();
    let snapshot = select_ready(&handle, "c2").await;
    assert_eq!(ids(&snapshot), vec!["b1"]);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.selection, SelectionState::Ready(ConversationId::from("c2")));
    assert_eq!(ids(&snapshot), vec!["b1"]);
    assert!(handle
        .messages(ConversationId::from("c1"))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_deleting_active_conversation_clears_selection() {
    let api = FakeApi::with_conversations(&["c1", "c2"]);
    api.set_page("c1", vec![message("m1", "c1", at(10, 0))]);
    let connector = Arc::new(FakeConnector::default());
    let (push_tx, _out) = connector.prepare();
    let handle = engine(api, connector);
    let (selections, _sub) = record(&handle, EventKind::SelectionChanged);

    started(&handle, 2).await;
    select_ready(&handle, "c1").await;
    push(
        &push_tx,
        PushEvent::ConversationDeleted {
            conversation_id: ConversationId::from("c1"),
        },
    );

    let snapshot = eventually(&handle, |s| s.selection == SelectionState::Idle).await;
    assert!(snapshot.messages.is_empty());
    assert_eq!(snapshot.conversations.len(), 1);
    assert_eq!(
        selections.lock().unwrap().last(),
        Some(&EngineEvent::SelectionChanged {
            state: SelectionState::Idle
        })
    );
    assert!(handle.messages(ConversationId::from("c1")).await.is_err());
}

#[tokio::test]
async fn test_edit_and_delete_own_message() {
    let api = FakeApi::with_conversations(&["c1"]);
    api.send_failures
        .lock()
        .unwrap()
        .push_back(NetError::Transient("dropped".into()));
    api.server_ids.lock().unwrap().push_back("m50".into());
    let connector = Arc::new(FakeConnector::default());
    let (push_tx, _out) = connector.prepare();
    let handle = engine(api.clone(), connector);

    started(&handle, 1).await;
    select_ready(&handle, "c1").await;
    let failed = handle
        .send(ConversationId::from("c1"), "lost", Vec::new(), None)
        .await
        .unwrap();
    eventually(&handle, |s| {
        s.messages
            .first()
            .is_some_and(|m| m.status == MessageStatus::Failed)
    })
    .await;
    assert!(matches!(
        handle.edit(failed, "found").await,
        Err(ClientError::NotConfirmed(_))
    ));

    handle
        .send(ConversationId::from("c1"), "helo", Vec::new(), None)
        .await
        .unwrap();
    eventually(&handle, |s| s.messages.iter().any(|m| m.id.as_str() == "m50")).await;

    let m50 = MessageId::from("m50");
    let find = |snapshot: &Snapshot, id: &str| {
        snapshot
            .messages
            .iter()
            .find(|m| m.id.as_str() == id)
            .cloned()
            .unwrap()
    };
    assert!(matches!(
        handle.edit(m50.clone(), "  ").await,
        Err(ClientError::EmptyMessage)
    ));
    handle.edit(m50.clone(), "hello").await.unwrap();
    let snapshot = handle.snapshot().await.unwrap();
    let edited = find(&snapshot, "m50");
    assert_eq!(edited.content, "hello");
    assert!(edited.is_edited);
    let summary = snapshot.conversations[0].last_message.as_ref().unwrap();
    assert_eq!(summary.text, "hello");

    handle.delete(m50.clone()).await.unwrap();
    let snapshot = handle.snapshot().await.unwrap();
    let removed = find(&snapshot, "m50");
    assert!(removed.is_deleted);
    assert_eq!(removed.content, DELETED_MESSAGE_PLACEHOLDER);
    assert_eq!(api.deleted.lock().unwrap().as_slice(), &[m50.clone()]);
    assert!(matches!(
        handle.edit(m50, "again").await,
        Err(ClientError::MessageDeleted(_))
    ));

    // Edits and deletions made elsewhere arrive as push events.
    push(&push_tx, PushEvent::MessageNew(message("b1", "c1", at(10, 0))));
    eventually(&handle, |s| s.messages.len() == 3).await;
    let mut changed = message("b1", "c1", at(10, 0));
    changed.content = "edited by bob".into();
    push(&push_tx, PushEvent::MessageUpdated(changed));
    let snapshot = eventually(&handle, |s| {
        s.messages.iter().any(|m| m.id.as_str() == "b1" && m.is_edited)
    })
    .await;
    assert_eq!(find(&snapshot, "b1").content, "edited by bob");
    push(
        &push_tx,
        PushEvent::MessageDeleted(MessageRemoval {
            message_id: MessageId::from("b1"),
            conversation_id: ConversationId::from("c1"),
        }),
    );
    let snapshot = eventually(&handle, |s| {
        s.messages.iter().any(|m| m.id.as_str() == "b1" && m.is_deleted)
    })
    .await;
    assert_eq!(find(&snapshot, "b1").content, DELETED_MESSAGE_PLACEHOLDER);
}

#[tokio::test]
async fn test_direct_conversation_pin_and_archive() {
    let api = FakeApi::with_conversations(&["c1"]);
    let connector = Arc::new(FakeConnector::default());
    let (_push_tx, _out) = connector.prepare();
    let handle = engine(api.clone(), connector);

    started(&handle, 1).await;
    assert!(matches!(
        handle.open_direct(UserId::from("me")).await,
        Err(ClientError::OwnConversation)
    ));
    let direct = handle.open_direct(UserId::from("carol")).await.unwrap();
    assert_eq!(direct.as_str(), "d-carol");

    handle.set_pinned(direct.clone(), true).await.unwrap();
    handle
        .set_archived(ConversationId::from("c1"), true)
        .await
        .unwrap();

    let visible = handle.conversations(ConversationFilter::default()).await.unwrap();
    let visible: Vec<_> = visible.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(visible, vec!["d-carol"]);
    let archived = handle
        .conversations(ConversationFilter::category(Category::Archived))
        .await
        .unwrap();
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].id.as_str(), "c1");

    assert_eq!(
        api.flags.lock().unwrap().as_slice(),
        &[
            (direct, "pinned", true),
            (ConversationId::from("c1"), "archived", true),
        ]
    );
    assert!(matches!(
        handle.set_archived(ConversationId::from("nope"), true).await,
        Err(ClientError::Store(_))
    ));
}

#[tokio::test]
async fn test_inbound_pending_attachment_is_polled() {
    let api = FakeApi::with_conversations(&["c1"]);
    let mut inbound = message("m1", "c1", at(10, 0));
    inbound.kind = MessageKind::File;
    inbound.attachments.push(Attachment {
        id: AttachmentId::from("att-in"),
        url: Some("https://files.example/att-in".into()),
        mime_type: "application/pdf".into(),
        size: 4096,
        upload_progress: 100,
        scan_status: ScanStatus::Pending,
        metadata: AttachmentMetadata::default(),
    });
    api.set_page("c1", vec![inbound]);
    api.scan_results
        .lock()
        .unwrap()
        .insert(AttachmentId::from("att-in"), ScanStatus::Clean);
    let connector = Arc::new(FakeConnector::default());
    let (_push_tx, _out) = connector.prepare();
    let handle = engine(api, connector);

    started(&handle, 1).await;
    select_ready(&handle, "c1").await;

    let snapshot = eventually(&handle, |s| {
        s.messages
            .first()
            .is_some_and(|m| m.attachments[0].scan_status == ScanStatus::Clean)
    })
    .await;
    assert!(snapshot.messages[0].attachments[0].is_downloadable());
}

#[tokio::test]
async fn test_confirmed_send_replaces_skewed_summary() {
    let api = FakeApi::with_conversations(&["c1", "c2"]);
    *api.send_clock.lock().unwrap() = Some(at(9, 30));
    let connector = Arc::new(FakeConnector::default());
    let (push_tx, _out) = connector.prepare();
    let handle = engine(api, connector);

    started(&handle, 2).await;
    push(&push_tx, PushEvent::MessageNew(message("x1", "c2", at(10, 0))));
    eventually(&handle, |s| s.total_unread == 1).await;
    select_ready(&handle, "c1").await;

    // The local clock is far ahead of the server's.
    handle
        .send(ConversationId::from("c1"), "hi", Vec::new(), None)
        .await
        .unwrap();
    let snapshot = eventually(&handle, |s| {
        s.messages.first().is_some_and(|m| !m.id.is_temporary())
    })
    .await;
    let c1 = snapshot
        .conversations
        .iter()
        .find(|c| c.id.as_str() == "c1")
        .unwrap();
    assert_eq!(c1.last_message.as_ref().unwrap().timestamp, at(9, 30));
    assert_eq!(snapshot.conversations[0].id.as_str(), "c2");
}
