//! Attachment pipeline: validation, upload bookkeeping and scan tracking.
//!
//! The [`AttachmentPipeline`] itself is synchronous and owned by the engine
//! task. The network legs ([`upload`] and [`poll_scan_status`]) are free
//! async functions the controller runs in spawned tasks.

use std::path::Path;

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, info, warn};

use parley_net::{Backoff, ChatApi, NetError, ProgressFn, UploadRequest};
use parley_shared::models::{Attachment, AttachmentMetadata, ScanStatus};
use parley_shared::protocol::UploadedAttachment;
use parley_shared::types::{AttachmentId, ConversationId, UploadId};
use parley_shared::ModelError;

use crate::error::{ClientError, Result, ValidationError};

/// A file picked by the user, read into memory.
#[derive(Debug, Clone)]
pub struct FileCandidate {
    pub filename: String,
    pub mime_type: String,
    pub bytes: Bytes,
}

impl FileCandidate {
    pub fn new(filename: impl Into<String>, mime_type: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            filename: filename.into(),
            mime_type: mime_type.into(),
            bytes: bytes.into(),
        }
    }

    /// Read a file from disk, guessing its MIME type from the extension.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();
        let mime_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        let bytes = tokio::fs::read(path).await?;
        Ok(Self::new(filename, mime_type, bytes))
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub filename: String,
    pub error: ValidationError,
}

/// Per-file outcome of a selection; every file is reported on its own.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SelectionReport {
    pub accepted: Vec<UploadId>,
    pub rejected: Vec<Rejection>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "error", rename_all = "snake_case")]
pub enum UploadState {
    Uploading,
    Uploaded,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadRecord {
    pub id: UploadId,
    pub conversation_id: ConversationId,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    /// 0-100, never decreases.
    pub progress: u8,
    pub state: UploadState,
    /// Set once the server accepted the file.
    pub attachment: Option<Attachment>,
    #[serde(skip)]
    checksum: String,
}

impl UploadRecord {
    pub fn scan_status(&self) -> Option<ScanStatus> {
        self.attachment.as_ref().map(|a| a.scan_status)
    }
}

#[derive(Debug)]
pub struct AttachmentPipeline {
    max_bytes: u64,
    allowed: Vec<String>,
    uploads: Vec<UploadRecord>,
}

impl AttachmentPipeline {
    pub fn new(max_bytes: u64, allowed: Vec<String>) -> Self {
        Self {
            max_bytes,
            allowed: allowed.into_iter().map(|m| m.to_ascii_lowercase()).collect(),
            uploads: Vec::new(),
        }
    }

    pub fn validate(&self, file: &FileCandidate) -> std::result::Result<(), ValidationError> {
        let size = file.size();
        if size == 0 {
            return Err(ValidationError::Empty);
        }
        if size > self.max_bytes {
            return Err(ValidationError::TooLarge {
                size,
                max: self.max_bytes,
            });
        }
        let mime = file.mime_type.trim().to_ascii_lowercase();
        if !self.allowed.iter().any(|pattern| mime_matches(pattern, &mime)) {
            return Err(ValidationError::TypeNotAllowed(file.mime_type.clone()));
        }
        Ok(())
    }

    /// Validate each file and register the accepted ones for upload.
    ///
    /// Returns the report plus the upload requests the caller has to run.
    pub fn select_files(
        &mut self,
        conversation_id: &ConversationId,
        files: Vec<FileCandidate>,
    ) -> (SelectionReport, Vec<(UploadId, UploadRequest)>) {
        let mut report = SelectionReport::default();
        let mut requests = Vec::new();

        for file in files {
            if let Err(error) = self.validate(&file) {
                info!(file = %file.filename, error = %error, "Attachment rejected");
                report.rejected.push(Rejection {
                    filename: file.filename,
                    error,
                });
                continue;
            }

            let id = UploadId::new();
            let checksum = hex::encode(blake3::hash(&file.bytes).as_bytes());
            self.uploads.push(UploadRecord {
                id,
                conversation_id: conversation_id.clone(),
                filename: file.filename.clone(),
                mime_type: file.mime_type.clone(),
                size: file.size(),
                progress: 0,
                state: UploadState::Uploading,
                attachment: None,
                checksum,
            });
            report.accepted.push(id);
            requests.push((
                id,
                UploadRequest {
                    filename: file.filename,
                    mime_type: file.mime_type,
                    bytes: file.bytes,
                },
            ));
        }
        (report, requests)
    }

    /// Record upload progress. Returns `true` if the value moved forward.
    pub fn record_progress(&mut self, id: UploadId, percent: u8) -> bool {
        match self.record_mut(id) {
            Some(record) if percent.min(100) > record.progress => {
                record.progress = percent.min(100);
                true
            }
            _ => false,
        }
    }

    /// The server accepted the file: the attachment starts its scan.
    pub fn complete(&mut self, id: UploadId, uploaded: UploadedAttachment) -> Option<Attachment> {
        let record = self.record_mut(id)?;
        let attachment = Attachment {
            id: uploaded.id,
            url: Some(uploaded.url),
            mime_type: record.mime_type.clone(),
            size: record.size,
            upload_progress: 100,
            scan_status: uploaded.scan_status.unwrap_or(ScanStatus::Pending),
            metadata: AttachmentMetadata {
                filename: record.filename.clone(),
                original_mime_type: record.mime_type.clone(),
                checksum: Some(record.checksum.clone()),
            },
        };
        record.progress = 100;
        record.state = UploadState::Uploaded;
        record.attachment = Some(attachment.clone());
        Some(attachment)
    }

    pub fn fail(&mut self, id: UploadId, error: &NetError) {
        if let Some(record) = self.record_mut(id) {
            record.state = UploadState::Failed(error.to_string());
        }
    }

    /// Apply a scan transition. `Ok(None)` when no upload carries the
    /// attachment.
    pub fn apply_scan(
        &mut self,
        attachment_id: &AttachmentId,
        status: ScanStatus,
    ) -> std::result::Result<Option<UploadId>, ModelError> {
        let Some(record) = self
            .uploads
            .iter_mut()
            .find(|r| r.attachment.as_ref().is_some_and(|a| &a.id == attachment_id))
        else {
            return Ok(None);
        };
        if let Some(attachment) = record.attachment.as_mut() {
            attachment.scan_status = attachment.scan_status.transition(status)?;
        }
        Ok(Some(record.id))
    }

    /// Attachments of completed uploads, in the order given.
    pub fn ready_attachments(&self, ids: &[UploadId]) -> Result<Vec<Attachment>> {
        ids.iter()
            .map(|id| {
                self.get(*id)
                    .filter(|r| r.state == UploadState::Uploaded)
                    .and_then(|r| r.attachment.clone())
                    .ok_or(ClientError::UploadNotReady(*id))
            })
            .collect()
    }

    pub fn get(&self, id: UploadId) -> Option<&UploadRecord> {
        self.uploads.iter().find(|r| r.id == id)
    }

    pub fn uploads(&self) -> &[UploadRecord] {
        &self.uploads
    }

    pub fn clear(&mut self) {
        self.uploads.clear();
    }

    fn record_mut(&mut self, id: UploadId) -> Option<&mut UploadRecord> {
        self.uploads.iter_mut().find(|r| r.id == id)
    }
}

/// `image/*` matches any image subtype; anything else must match exactly.
fn mime_matches(pattern: &str, mime: &str) -> bool {
    match pattern.strip_suffix("/*") {
        Some(top) => mime
            .split_once('/')
            .is_some_and(|(kind, _)| kind == top),
        None => pattern == mime,
    }
}

// ---------------------------------------------------------------------------
// Network legs
// ---------------------------------------------------------------------------

/// Upload one file, retrying once after a transient failure.
pub async fn upload(
    api: &dyn ChatApi,
    conversation_id: &ConversationId,
    request: UploadRequest,
    progress: ProgressFn,
) -> std::result::Result<UploadedAttachment, NetError> {
    match api
        .upload_attachment(conversation_id, request.clone(), progress.clone())
        .await
    {
        Err(e) if e.is_transient() => {
            warn!(file = %request.filename, error = %e, "Upload failed, retrying once");
            api.upload_attachment(conversation_id, request, progress).await
        }
        other => other,
    }
}

/// Poll the scan status until it is terminal or `attempts` run out.
///
/// Exhaustion resolves to [`ScanStatus::Failed`]: an attachment whose scan
/// never finished is never downloadable.
pub async fn poll_scan_status(
    api: &dyn ChatApi,
    attachment_id: &AttachmentId,
    attempts: u32,
    mut backoff: Backoff,
) -> std::result::Result<ScanStatus, NetError> {
    for attempt in 1..=attempts {
        match api.fetch_scan_status(attachment_id).await {
            Ok(resp) if resp.status.is_terminal() => {
                debug!(attachment = %attachment_id, status = ?resp.status, attempt, "Scan finished");
                return Ok(resp.status);
            }
            Ok(_) => debug!(attachment = %attachment_id, attempt, "Scan still pending"),
            Err(e) if e.is_auth() => return Err(e),
            Err(e) => warn!(attachment = %attachment_id, attempt, error = %e, "Scan poll failed"),
        }
        if attempt < attempts {
            tokio::time::sleep(backoff.next_delay()).await;
        }
    }
    warn!(attachment = %attachment_id, attempts, "Scan status never resolved, failing safe");
    Ok(ScanStatus::Failed)
}
