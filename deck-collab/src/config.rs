//! Session and catalog configuration.

use std::time::Duration;

/// Reconnect schedule for the WebSocket transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry; doubles on every failure
    pub initial_delay: Duration,
    /// Upper bound for the delay
    pub max_delay: Duration,
    /// Consecutive failures tolerated before giving up (None = retry forever)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            max_attempts: Some(10),
        }
    }
}

/// Configuration for one collaborative session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket URL of the presentation authority
    pub server_url: String,
    /// Presentation to join
    pub presentation_id: String,
    /// Nickname used to join and to resolve the local user
    pub nickname: String,
    /// Window over which content, position and size updates are merged
    pub coalesce_window: Duration,
    /// Maximum events held while disconnected
    pub offline_queue_capacity: usize,
    /// Buffer between the transport task and the session
    pub event_channel_capacity: usize,
    pub reconnect: ReconnectPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:3000".to_string(),
            presentation_id: String::new(),
            nickname: String::new(),
            coalesce_window: Duration::from_millis(100),
            offline_queue_capacity: 10_000,
            event_channel_capacity: 256,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl SessionConfig {
    pub fn new(nickname: impl Into<String>, presentation_id: impl Into<String>) -> Self {
        Self {
            nickname: nickname.into(),
            presentation_id: presentation_id.into(),
            ..Self::default()
        }
    }
}

/// Configuration for the HTTP presentation catalog.
#[derive(Debug, Clone)]
pub struct CatalogConfig {
    /// Base URL of the REST API
    pub base_url: String,
    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3000".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}
