//! Session configuration.

use std::time::Duration;

use crate::error::Error;

/// Environment variable read by [`SessionConfig::from_env`].
pub const API_KEY_ENV: &str = "AIGEN_API_KEY";

/// Configuration for a [`Session`](crate::Session).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket endpoint URL.
    pub endpoint: String,
    /// API key sent in the auth frame.
    pub api_key: String,
    /// Reconnect after an abnormal close (default: true).
    pub auto_reconnect: bool,
    /// Base backoff interval, doubled per attempt (default: 1s).
    pub reconnect_interval: Duration,
    /// Backoff ceiling (default: 30s).
    pub max_reconnect_interval: Duration,
    /// Give up after this many consecutive attempts. `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
    /// Heartbeat period while ready (default: 30s).
    pub heartbeat_interval: Duration,
    /// Timeout applied when a request does not specify one (default: 60s).
    pub request_timeout: Duration,
    /// Socket open timeout (default: 10s).
    pub connect_timeout: Duration,
    /// Time allowed between sending the auth frame and its answer (default: 10s).
    pub auth_timeout: Duration,
}

impl SessionConfig {
    /// Creates a configuration with default timings.
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            auto_reconnect: true,
            reconnect_interval: Duration::from_secs(1),
            max_reconnect_interval: Duration::from_secs(30),
            max_reconnect_attempts: None,
            heartbeat_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(10),
        }
    }

    /// Creates a configuration with the API key taken from `AIGEN_API_KEY`.
    pub fn from_env(endpoint: impl Into<String>) -> Result<Self, Error> {
        match std::env::var(API_KEY_ENV) {
            Ok(key) if !key.is_empty() => Ok(Self::new(endpoint, key)),
            _ => Err(Error::MissingApiKey(API_KEY_ENV)),
        }
    }
}
