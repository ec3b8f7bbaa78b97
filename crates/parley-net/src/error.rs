use thiserror::Error;

/// Errors produced by the transport layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetError {
    /// Connection refused, timed out, reset, or a 5xx gateway answer.
    #[error("Transient network failure: {0}")]
    Transient(String),

    /// The session token was rejected (401/403).
    #[error("Authentication rejected")]
    Unauthorized,

    /// The server refused the request.
    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Resource not found")]
    NotFound,

    /// A response or push frame could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// The request could not be built (bad header, bad MIME type).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Push channel closed")]
    Closed,
}

impl NetError {
    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => NetError::Unauthorized,
            404 => NetError::NotFound,
            408 | 429 | 502 | 503 | 504 => NetError::Transient(format!("HTTP {status}")),
            _ => NetError::Rejected {
                status,
                message: body,
            },
        }
    }

    /// Worth one more attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, NetError::Transient(_) | NetError::Closed)
    }

    /// Loss of authentication; ends the session.
    pub fn is_auth(&self) -> bool {
        matches!(self, NetError::Unauthorized)
    }
}

impl From<reqwest::Error> for NetError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return NetError::from_status(status.as_u16(), e.to_string());
        }
        if e.is_decode() {
            return NetError::Decode(e.to_string());
        }
        if e.is_builder() {
            return NetError::InvalidRequest(e.to_string());
        }
        NetError::Transient(e.to_string())
    }
}

impl From<serde_json::Error> for NetError {
    fn from(e: serde_json::Error) -> Self {
        NetError::Decode(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for NetError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match e {
            WsError::ConnectionClosed | WsError::AlreadyClosed => NetError::Closed,
            WsError::Http(response) => {
                let status = response.status().as_u16();
                let body = response
                    .body()
                    .as_deref()
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .unwrap_or_default();
                NetError::from_status(status, body)
            }
            WsError::Url(e) => NetError::InvalidRequest(e.to_string()),
            other => NetError::Transient(other.to_string()),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, NetError>;
