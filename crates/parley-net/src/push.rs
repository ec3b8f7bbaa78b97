//! Push channel seam.

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::mpsc;

use parley_shared::protocol::{ClientFrame, PushEnvelope};

use crate::error::Result;

/// An open push channel.
///
/// `events` yields envelopes in receive order and ends when the connection
/// drops. Frames queued on `outbound` are written by the connection; dropping
/// the sender closes the channel.
pub struct PushSession {
    pub events: BoxStream<'static, Result<PushEnvelope>>,
    pub outbound: mpsc::Sender<ClientFrame>,
}

impl std::fmt::Debug for PushSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushSession").finish_non_exhaustive()
    }
}

/// Opens push channels for the transport supervisor.
#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn connect(&self) -> Result<PushSession>;
}
