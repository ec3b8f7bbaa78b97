//! Transport configuration loaded from environment variables.
//!
//! Defaults point at a local development backend so the engine starts with
//! zero configuration.

use std::time::Duration;

use parley_shared::constants::{
    DEFAULT_PAGE_SIZE, RECONNECT_BASE_MS, RECONNECT_CAP_MS, REQUEST_TIMEOUT_SECS,
};

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Base URL of the REST API.
    /// Env: `PARLEY_API_URL`
    /// Default: `http://localhost:5000/api`
    pub api_url: String,

    /// WebSocket endpoint of the push channel.
    /// Env: `PARLEY_PUSH_URL`
    /// Default: `ws://localhost:5000/ws`
    pub push_url: String,

    /// Per-request timeout, also bounds the push handshake.
    /// Env: `PARLEY_REQUEST_TIMEOUT_SECS`
    pub request_timeout: Duration,

    /// Messages per history page.
    /// Env: `PARLEY_PAGE_SIZE`
    pub page_size: u32,

    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:5000/api".to_string(),
            push_url: "ws://localhost:5000/ws".to_string(),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            page_size: DEFAULT_PAGE_SIZE,
            reconnect_base: Duration::from_millis(RECONNECT_BASE_MS),
            reconnect_cap: Duration::from_millis(RECONNECT_CAP_MS),
        }
    }
}

impl TransportConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    pub(crate) fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("PARLEY_API_URL") {
            self.api_url = url;
        }

        if let Some(url) = lookup("PARLEY_PUSH_URL") {
            self.push_url = url;
        }

        if let Some(val) = lookup("PARLEY_REQUEST_TIMEOUT_SECS") {
            match val.parse::<u64>() {
                Ok(secs) if secs > 0 => self.request_timeout = Duration::from_secs(secs),
                _ => tracing::warn!(
                    value = %val,
                    "Invalid PARLEY_REQUEST_TIMEOUT_SECS, using default"
                ),
            }
        }

        if let Some(val) = lookup("PARLEY_PAGE_SIZE") {
            match val.parse::<u32>() {
                Ok(n) if n > 0 => self.page_size = n,
                _ => tracing::warn!(value = %val, "Invalid PARLEY_PAGE_SIZE, using default"),
            }
        }
    }
}
