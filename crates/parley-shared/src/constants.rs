/// Prefix of client-generated temporary message ids
pub const TEMP_ID_PREFIX: &str = "temp-";

/// Application name
pub const APP_NAME: &str = "Parley";

/// Messages requested per history page
pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// How long a remote "typing" notice stays visible without a refresh
pub const DEFAULT_TYPING_TTL_MS: u64 = 5_000;

/// Interval of the typing-expiry sweep
pub const TYPING_SWEEP_INTERVAL_MS: u64 = 1_000;

/// Maximum attachment size in bytes (10 MiB)
pub const MAX_ATTACHMENT_SIZE: u64 = 10 * 1024 * 1024;

/// MIME types accepted for attachments unless configured otherwise
pub const DEFAULT_ALLOWED_MIME_TYPES: &[&str] = &[
    "image/jpeg",
    "image/png",
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
];

/// Reconnect backoff base delay in milliseconds
pub const RECONNECT_BASE_MS: u64 = 1_000;

/// Reconnect backoff ceiling in milliseconds
pub const RECONNECT_CAP_MS: u64 = 30_000;

/// Time to wait for a scan-status push event before polling
pub const SCAN_EVENT_TIMEOUT_SECS: u64 = 30;

/// Scan-status polls before giving up and failing safe
pub const SCAN_POLL_ATTEMPTS: u32 = 5;

/// First delay between scan-status polls
pub const SCAN_POLL_BASE_MS: u64 = 2_000;

/// Per-request timeout for REST calls in seconds
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Chunk size used when streaming an upload body (progress granularity)
pub const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// Content shown in place of a soft-deleted message
pub const DELETED_MESSAGE_PLACEHOLDER: &str = "This message has been deleted";
