//! Push channel supervisor with tokio mpsc command/notification pattern.
//!
//! The supervisor runs in a dedicated tokio task and owns at most one push
//! session. It reconnects with exponential backoff while a connection is
//! wanted, asks the API for a resync delta after every reconnect, and stops
//! for good when the server rejects the session.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use parley_shared::protocol::{ClientFrame, PushEnvelope, PushEvent, ResyncDelta, SyncPoint};

use crate::api::ChatApi;
use crate::backoff::Backoff;
use crate::config::TransportConfig;
use crate::error::{NetError, Result};
use crate::push::{PushConnector, PushSession};

// ---------------------------------------------------------------------------
// Command / notification types
// ---------------------------------------------------------------------------

/// Commands sent *into* the supervisor task.
#[derive(Debug)]
pub enum TransportCommand {
    /// Open the push channel and keep it open.
    Connect,
    /// Close the push channel and stop reconnecting.
    Disconnect,
    /// Best-effort outbound frame; dropped while disconnected.
    Send(ClientFrame),
    /// Stop the supervisor task.
    Shutdown,
}

/// What the supervisor could recover after a reconnect.
#[derive(Debug, Clone, PartialEq)]
pub enum ResyncOutcome {
    /// Events missed while disconnected, in order.
    Delta(ResyncDelta),
    /// No delta available; the caller has to refetch.
    Unavailable,
}

/// Notifications sent *from* the supervisor to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportNotification {
    /// The channel is live. `resync` is `None` on the first connect of the
    /// supervisor's lifetime.
    Connected { resync: Option<ResyncOutcome> },
    /// The channel dropped; a reconnect is scheduled if still wanted.
    Disconnected,
    /// A push event, in receive order.
    Event(PushEnvelope),
    /// The server refused our credentials. No more reconnects.
    SessionRejected,
}

/// Spawn the push supervisor in a background tokio task.
///
/// Returns `(command_tx, notification_rx)`. The task ends on
/// [`TransportCommand::Shutdown`], when every command sender is dropped, or
/// when the notification receiver is dropped.
pub fn spawn_transport(
    config: &TransportConfig,
    connector: Arc<dyn PushConnector>,
    api: Arc<dyn ChatApi>,
) -> (
    mpsc::Sender<TransportCommand>,
    mpsc::Receiver<TransportNotification>,
) {
    spawn_with_backoff(
        connector,
        api,
        Backoff::new(config.reconnect_base, config.reconnect_cap),
    )
}

pub(crate) fn spawn_with_backoff(
    connector: Arc<dyn PushConnector>,
    api: Arc<dyn ChatApi>,
    backoff: Backoff,
) -> (
    mpsc::Sender<TransportCommand>,
    mpsc::Receiver<TransportNotification>,
) {
    let (cmd_tx, cmd_rx) = mpsc::channel::<TransportCommand>(256);
    let (notif_tx, notif_rx) = mpsc::channel::<TransportNotification>(256);

    let supervisor = Supervisor {
        connector,
        api,
        backoff,
        notif_tx,
        sync: SyncPoint::default(),
        ever_connected: false,
    };
    tokio::spawn(supervisor.run(cmd_rx));

    (cmd_tx, notif_rx)
}

struct Supervisor {
    connector: Arc<dyn PushConnector>,
    api: Arc<dyn ChatApi>,
    backoff: Backoff,
    notif_tx: mpsc::Sender<TransportNotification>,
    /// Where we left off, sent with the resync request.
    sync: SyncPoint,
    ever_connected: bool,
}

enum Step {
    Command(Option<TransportCommand>),
    Push(Option<Result<PushEnvelope>>),
    Dial,
}

impl Supervisor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<TransportCommand>) {
        let mut wanted = false;
        let mut session: Option<PushSession> = None;
        let mut retry_at: Option<Instant> = None;

        loop {
            let step = if let Some(live) = session.as_mut() {
                tokio::select! {
                    cmd = cmd_rx.recv() => Step::Command(cmd),
                    event = live.events.next() => Step::Push(event),
                }
            } else if wanted {
                let deadline = retry_at.unwrap_or_else(Instant::now);
                tokio::select! {
                    cmd = cmd_rx.recv() => Step::Command(cmd),
                    _ = sleep_until(deadline) => Step::Dial,
                }
            } else {
                Step::Command(cmd_rx.recv().await)
            };

            let keep_going = match step {
                // --- Incoming commands ---
                Step::Command(Some(TransportCommand::Connect)) => {
                    if session.is_none() && !wanted {
                        info!("Push channel requested");
                        wanted = true;
                        retry_at = None;
                        self.backoff.reset();
                    }
                    true
                }
                Step::Command(Some(TransportCommand::Disconnect)) => {
                    wanted = false;
                    retry_at = None;
                    if session.take().is_some() {
                        info!("Push channel closed on request");
                        self.notify(TransportNotification::Disconnected).await
                    } else {
                        true
                    }
                }
                Step::Command(Some(TransportCommand::Send(frame))) => {
                    match session.as_ref() {
                        Some(live) => {
                            if let Err(e) = live.outbound.try_send(frame) {
                                warn!(error = %e, "Dropping outbound frame");
                            }
                        }
                        None => debug!(frame = ?frame, "Not connected, dropping outbound frame"),
                    }
                    true
                }
                Step::Command(Some(TransportCommand::Shutdown)) => {
                    info!("Transport shutdown requested");
                    false
                }
                Step::Command(None) => {
                    info!("Command channel closed, shutting down transport");
                    false
                }

                // --- Push events ---
                Step::Push(Some(Ok(envelope))) => {
                    self.track(&envelope);
                    self.notify(TransportNotification::Event(envelope)).await
                }
                Step::Push(Some(Err(NetError::Decode(e)))) => {
                    warn!(error = %e, "Skipping undecodable push frame");
                    true
                }
                Step::Push(Some(Err(e))) if e.is_auth() => {
                    session = None;
                    wanted = false;
                    self.reject().await
                }
                Step::Push(end) => {
                    if let Some(Err(e)) = end {
                        warn!(error = %e, "Push channel error");
                    }
                    session = None;
                    if self.sync.since.is_none() {
                        self.sync.since = Some(Utc::now());
                    }
                    let delay = self.backoff.next_delay();
                    retry_at = Some(Instant::now() + delay);
                    info!(retry_in_ms = delay.as_millis() as u64, "Push channel lost");
                    self.notify(TransportNotification::Disconnected).await
                }

                // --- Reconnect ---
                Step::Dial => match self.connector.connect().await {
                    Ok(live) => {
                        self.backoff.reset();
                        retry_at = None;
                        let resync = if self.ever_connected {
                            Some(self.resync().await)
                        } else {
                            None
                        };
                        self.ever_connected = true;
                        session = Some(live);
                        self.notify(TransportNotification::Connected { resync }).await
                    }
                    Err(e) if e.is_auth() => {
                        wanted = false;
                        self.reject().await
                    }
                    Err(e) => {
                        let delay = self.backoff.next_delay();
                        retry_at = Some(Instant::now() + delay);
                        warn!(
                            error = %e,
                            attempt = self.backoff.attempt(),
                            retry_in_ms = delay.as_millis() as u64,
                            "Push connect failed"
                        );
                        true
                    }
                },
            };

            if !keep_going {
                break;
            }
        }

        info!("Transport supervisor terminated");
    }

    /// Returns `false` once nobody listens anymore.
    async fn notify(&self, notification: TransportNotification) -> bool {
        self.notif_tx.send(notification).await.is_ok()
    }

    async fn reject(&self) -> bool {
        error!("Push channel rejected the session");
        self.notify(TransportNotification::SessionRejected).await
    }

    fn track(&mut self, envelope: &PushEnvelope) {
        if let Some(cursor) = &envelope.cursor {
            self.sync.cursor = Some(cursor.clone());
        }
        if let PushEvent::MessageNew(message) = &envelope.event {
            self.advance_since(message.created_at);
        }
    }

    fn advance_since(&mut self, at: DateTime<Utc>) {
        if self.sync.since.map_or(true, |since| at > since) {
            self.sync.since = Some(at);
        }
    }

    async fn resync(&mut self) -> ResyncOutcome {
        match self.api.fetch_resync_delta(&self.sync).await {
            Ok(Some(delta)) => {
                debug!(events = delta.events.len(), "Received resync delta");
                for envelope in &delta.events {
                    self.track(envelope);
                }
                if let Some(cursor) = &delta.cursor {
                    self.sync.cursor = Some(cursor.clone());
                }
                ResyncOutcome::Delta(delta)
            }
            Ok(None) => ResyncOutcome::Unavailable,
            Err(e) => {
                warn!(error = %e, "Resync delta request failed");
                ResyncOutcome::Unavailable
            }
        }
    }
}
