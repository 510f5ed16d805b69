//! Reconnection backoff policy.

use std::time::Duration;

use crate::config::SessionConfig;

/// Exponential backoff capped at a maximum interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    /// Creates a policy starting at `base` and never exceeding `max`.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Takes the intervals from a session configuration.
    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.reconnect_interval, config.max_reconnect_interval)
    }

    /// Delay before reconnect attempt `attempt` (zero-based):
    /// `min(base * 2^attempt, max)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |d| d.min(self.max))
    }
}
