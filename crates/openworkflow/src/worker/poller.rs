//! The idle-tick policy between poll rounds.
//!
//! Deliberately simpler than an adaptive/backoff poller: the spec calls for
//! a flat ~100ms sleep whenever a round claims nothing, with no exponential
//! growth at this layer (backoff belongs to the step-retry policy, not the
//! poll loop).

use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct PollerConfig {
    pub idle_sleep: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            idle_sleep: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Poller {
    config: PollerConfig,
}

impl Poller {
    pub fn new(config: PollerConfig) -> Self {
        Self { config }
    }

    /// Sleep the flat idle interval. Called once per round that claimed no
    /// work and once per round that hit a transient backend error.
    pub async fn idle_backoff(&self) {
        tokio::time::sleep(self.config.idle_sleep).await;
    }
}
