//! Engine configuration loaded from environment variables.
//!
//! Transport settings (URLs, page size, timeouts) live in
//! [`TransportConfig`]; everything the engine itself tunes is here.

use std::time::Duration;

use parley_net::TransportConfig;
use parley_shared::constants::{
    DEFAULT_ALLOWED_MIME_TYPES, DEFAULT_TYPING_TTL_MS, MAX_ATTACHMENT_SIZE, RECONNECT_CAP_MS,
    SCAN_EVENT_TIMEOUT_SECS, SCAN_POLL_ATTEMPTS, SCAN_POLL_BASE_MS, TYPING_SWEEP_INTERVAL_MS,
};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub transport: TransportConfig,

    /// How long a remote typing indicator lives without a refresh.
    /// Env: `PARLEY_TYPING_TTL_MS`
    pub typing_ttl: Duration,

    pub typing_sweep_interval: Duration,

    /// Attachment size ceiling in bytes.
    /// Env: `PARLEY_MAX_ATTACHMENT_BYTES`
    pub max_attachment_bytes: u64,

    /// Accepted MIME types; `type/*` wildcards allowed.
    /// Env: `PARLEY_ALLOWED_MIME` (comma separated)
    pub allowed_mime_types: Vec<String>,

    /// Wait this long for a scan-status push before polling.
    /// Env: `PARLEY_SCAN_TIMEOUT_SECS`
    pub scan_event_timeout: Duration,

    /// Env: `PARLEY_SCAN_POLL_ATTEMPTS`
    pub scan_poll_attempts: u32,

    pub scan_poll_base: Duration,
    pub scan_poll_cap: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            typing_ttl: Duration::from_millis(DEFAULT_TYPING_TTL_MS),
            typing_sweep_interval: Duration::from_millis(TYPING_SWEEP_INTERVAL_MS),
            max_attachment_bytes: MAX_ATTACHMENT_SIZE,
            allowed_mime_types: DEFAULT_ALLOWED_MIME_TYPES
                .iter()
                .map(|m| m.to_string())
                .collect(),
            scan_event_timeout: Duration::from_secs(SCAN_EVENT_TIMEOUT_SECS),
            scan_poll_attempts: SCAN_POLL_ATTEMPTS,
            scan_poll_base: Duration::from_millis(SCAN_POLL_BASE_MS),
            scan_poll_cap: Duration::from_millis(RECONNECT_CAP_MS),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self {
            transport: TransportConfig::from_env(),
            ..Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup("PARLEY_TYPING_TTL_MS") {
            match val.parse::<u64>() {
                Ok(ms) if ms > 0 => self.typing_ttl = Duration::from_millis(ms),
                _ => tracing::warn!(value = %val, "Invalid PARLEY_TYPING_TTL_MS, using default"),
            }
        }

        if let Some(val) = lookup("PARLEY_MAX_ATTACHMENT_BYTES") {
            match val.parse::<u64>() {
                Ok(n) if n > 0 => self.max_attachment_bytes = n,
                _ => tracing::warn!(
                    value = %val,
                    "Invalid PARLEY_MAX_ATTACHMENT_BYTES, using default"
                ),
            }
        }

        if let Some(val) = lookup("PARLEY_ALLOWED_MIME") {
            let types: Vec<String> = val
                .split(',')
                .map(|t| t.trim().to_ascii_lowercase())
                .filter(|t| t.contains('/'))
                .collect();
            if types.is_empty() {
                tracing::warn!(value = %val, "Invalid PARLEY_ALLOWED_MIME, using default");
            } else {
                self.allowed_mime_types = types;
            }
        }

        if let Some(val) = lookup("PARLEY_SCAN_TIMEOUT_SECS") {
            match val.parse::<u64>() {
                Ok(secs) => self.scan_event_timeout = Duration::from_secs(secs),
                Err(_) => tracing::warn!(
                    value = %val,
                    "Invalid PARLEY_SCAN_TIMEOUT_SECS, using default"
                ),
            }
        }

        if let Some(val) = lookup("PARLEY_SCAN_POLL_ATTEMPTS") {
            match val.parse::<u32>() {
                Ok(n) if n > 0 => self.scan_poll_attempts = n,
                _ => tracing::warn!(
                    value = %val,
                    "Invalid PARLEY_SCAN_POLL_ATTEMPTS, using default"
                ),
            }
        }
    }
}
