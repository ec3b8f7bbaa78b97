//! WebSocket push channel built on `tokio-tungstenite`.
//!
//! Text (or binary) frames carry JSON push envelopes. Outbound client frames
//! are written by a small writer task that lives as long as the session's
//! sender.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};
use url::Url;

use parley_shared::protocol::{ClientFrame, PushEnvelope};

use crate::config::TransportConfig;
use crate::error::{NetError, Result};
use crate::push::{PushConnector, PushSession};

const OUTBOUND_CAPACITY: usize = 64;

pub struct WsConnector {
    url: Url,
    token: String,
    handshake_timeout: Duration,
}

impl WsConnector {
    pub fn new(config: &TransportConfig, token: impl Into<String>) -> Result<Self> {
        Ok(Self {
            url: Url::parse(&config.push_url)?,
            token: token.into(),
            handshake_timeout: config.request_timeout,
        })
    }
}

#[async_trait]
impl PushConnector for WsConnector {
    async fn connect(&self) -> Result<PushSession> {
        let mut request = self.url.as_str().into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.token))
            .map_err(|e| NetError::InvalidRequest(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (stream, _response) = tokio::time::timeout(self.handshake_timeout, connect_async(request))
            .await
            .map_err(|_| NetError::Transient("push handshake timed out".into()))??;
        info!(url = %self.url, "Push channel open");

        let (mut sink, source) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<ClientFrame>(OUTBOUND_CAPACITY);

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let text = match frame.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode client frame");
                        continue;
                    }
                };
                if let Err(e) = sink.send(WsMessage::Text(text)).await {
                    debug!(error = %e, "Push writer stopped");
                    return;
                }
            }
            let _ = sink.close().await;
        });

        let events = source
            .filter_map(|msg| async move {
                match msg {
                    Ok(WsMessage::Text(text)) => {
                        Some(PushEnvelope::from_json(&text).map_err(NetError::from))
                    }
                    Ok(WsMessage::Binary(bytes)) => {
                        Some(serde_json::from_slice::<PushEnvelope>(&bytes).map_err(NetError::from))
                    }
                    Ok(WsMessage::Close(frame)) => {
                        debug!(frame = ?frame, "Push channel closed by server");
                        Some(Err(NetError::Closed))
                    }
                    Ok(_) => None,
                    Err(e) => Some(Err(NetError::from(e))),
                }
            })
            .boxed();

        Ok(PushSession {
            events,
            outbound: outbound_tx,
        })
    }
}
