//! REST implementation of [`ChatApi`] over `reqwest`.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};
use url::Url;

use parley_shared::constants::{APP_NAME, UPLOAD_CHUNK_SIZE};
use parley_shared::models::{Conversation, Message};
use parley_shared::protocol::{
    DirectConversationPayload, EditMessagePayload, MessagePage, ResyncDelta, ScanStatusResponse,
    SendMessagePayload, SyncPoint, UploadedAttachment,
};
use parley_shared::types::{AttachmentId, ConversationId, MessageId, PageCursor, UserId};

use crate::api::{ChatApi, ProgressFn, UploadRequest};
use crate::config::TransportConfig;
use crate::error::{NetError, Result};

pub struct HttpApi {
    client: Client,
    base: String,
    token: String,
    page_size: u32,
}

impl HttpApi {
    pub fn new(config: &TransportConfig, token: impl Into<String>) -> Result<Self> {
        // Fail early on a malformed base URL.
        Url::parse(&config.api_url)?;

        let client = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(format!("{APP_NAME}/{}", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base: config.api_url.trim_end_matches('/').to_string(),
            token: token.into(),
            page_size: config.page_size,
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        Ok(Url::parse(&format!("{}/{}", self.base, path))?)
    }

    /// GET with exactly one retry on a transient failure.
    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        match self.get_once(&url).await {
            Err(e) if e.is_transient() => {
                warn!(url = %url, error = %e, "GET failed, retrying once");
                self.get_once(&url).await
            }
            other => other,
        }
    }

    async fn get_once<T: DeserializeOwned>(&self, url: &Url) -> Result<T> {
        let resp = self
            .client
            .get(url.clone())
            .bearer_auth(&self.token)
            .send()
            .await?;
        decode(resp).await
    }

    /// Writes go out once; retrying is the caller's decision.
    async fn write_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: &B,
    ) -> Result<T> {
        let resp = self
            .client
            .request(method, url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        decode(resp).await
    }

    async fn write_empty(&self, method: Method, url: Url) -> Result<()> {
        let resp = self
            .client
            .request(method, url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        check(resp).await.map(|_| ())
    }
}

async fn check(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(NetError::from_status(status.as_u16(), body))
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let resp = check(resp).await?;
    let bytes = resp.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Stream `bytes` in chunks, reporting cumulative progress as each chunk is
/// handed to the connection. Stops at 99; 100 is reported once the server
/// has answered.
fn progress_body(bytes: Bytes, progress: ProgressFn) -> reqwest::Body {
    let total = bytes.len().max(1);
    let chunks: Vec<Bytes> = (0..bytes.len())
        .step_by(UPLOAD_CHUNK_SIZE)
        .map(|start| bytes.slice(start..(start + UPLOAD_CHUNK_SIZE).min(bytes.len())))
        .collect();

    let mut sent = 0usize;
    let stream = futures::stream::iter(chunks).map(move |chunk| {
        sent += chunk.len();
        let pct = (sent * 100 / total).min(99) as u8;
        progress(pct);
        Ok::<Bytes, std::io::Error>(chunk)
    });
    reqwest::Body::wrap_stream(stream)
}

#[async_trait]
impl ChatApi for HttpApi {
    async fn fetch_conversations(&self) -> Result<Vec<Conversation>> {
        let url = self.url("conversations")?;
        let conversations: Vec<Conversation> = self.get_json(url).await?;
        debug!(count = conversations.len(), "Fetched conversations");
        Ok(conversations)
    }

    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
        cursor: Option<&PageCursor>,
    ) -> Result<MessagePage> {
        let mut url = self.url(&format!("conversations/{conversation_id}/messages"))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", &self.page_size.to_string());
            if let Some(cursor) = cursor {
                query.append_pair("cursor", &cursor.0);
            }
        }
        self.get_json(url).await
    }

    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        payload: &SendMessagePayload,
    ) -> Result<Message> {
        let url = self.url(&format!("conversations/{conversation_id}/messages"))?;
        self.write_json(Method::POST, url, payload).await
    }

    async fn edit_message(&self, message_id: &MessageId, content: &str) -> Result<Message> {
        let url = self.url(&format!("messages/{message_id}"))?;
        let payload = EditMessagePayload {
            content: content.to_string(),
        };
        self.write_json(Method::PUT, url, &payload).await
    }

    async fn delete_message(&self, message_id: &MessageId) -> Result<()> {
        let url = self.url(&format!("messages/{message_id}"))?;
        self.write_empty(Method::DELETE, url).await
    }

    async fn mark_message_read(&self, message_id: &MessageId) -> Result<()> {
        let url = self.url(&format!("messages/{message_id}/read"))?;
        self.write_empty(Method::POST, url).await
    }

    async fn mark_conversation_read(&self, conversation_id: &ConversationId) -> Result<()> {
        let url = self.url(&format!("conversations/{conversation_id}/read"))?;
        self.write_empty(Method::POST, url).await
    }

    async fn create_direct_conversation(&self, recipient_id: &UserId) -> Result<Conversation> {
        let url = self.url("conversations/direct")?;
        let payload = DirectConversationPayload {
            recipient_id: recipient_id.clone(),
        };
        let conversation: Conversation = self.write_json(Method::POST, url, &payload).await?;
        debug!(conversation = %conversation.id, "Direct conversation ready");
        Ok(conversation)
    }

    async fn set_archived(&self, conversation_id: &ConversationId, archived: bool) -> Result<()> {
        let action = if archived { "archive" } else { "unarchive" };
        let url = self.url(&format!("conversations/{conversation_id}/{action}"))?;
        self.write_empty(Method::POST, url).await
    }

    async fn set_pinned(&self, conversation_id: &ConversationId, pinned: bool) -> Result<()> {
        let action = if pinned { "pin" } else { "unpin" };
        let url = self.url(&format!("conversations/{conversation_id}/{action}"))?;
        self.write_empty(Method::POST, url).await
    }

    async fn upload_attachment(
        &self,
        conversation_id: &ConversationId,
        upload: UploadRequest,
        progress: ProgressFn,
    ) -> Result<UploadedAttachment> {
        let url = self.url(&format!("conversations/{conversation_id}/attachments"))?;
        let len = upload.bytes.len() as u64;
        progress(0);

        let part = Part::stream_with_length(progress_body(upload.bytes, progress.clone()), len)
            .file_name(upload.filename)
            .mime_str(&upload.mime_type)
            .map_err(|e| NetError::InvalidRequest(e.to_string()))?;
        let form = Form::new().part("file", part);

        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .multipart(form)
            .send()
            .await?;
        let uploaded: UploadedAttachment = decode(resp).await?;
        progress(100);
        debug!(attachment = %uploaded.id, bytes = len, "Upload complete");
        Ok(uploaded)
    }

    async fn fetch_scan_status(&self, attachment_id: &AttachmentId) -> Result<ScanStatusResponse> {
        let url = self.url(&format!("attachments/{attachment_id}/scan"))?;
        self.get_json(url).await
    }

    async fn fetch_resync_delta(&self, since: &SyncPoint) -> Result<Option<ResyncDelta>> {
        let mut url = self.url("sync/delta")?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(cursor) = &since.cursor {
                query.append_pair("cursor", &cursor.0);
            }
            if let Some(ts) = since.since {
                query.append_pair("since", &ts.to_rfc3339());
            }
        }
        match self.get_json(url).await {
            Ok(delta) => Ok(Some(delta)),
            Err(NetError::Rejected { status, .. }) if status == StatusCode::GONE.as_u16() => {
                debug!("Server has no delta for this sync point");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
