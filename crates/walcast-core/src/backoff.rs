//! Exponential reconnect delay.

use std::time::Duration;

/// Bounds for [`Backoff`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

/// Delay is `min(min_delay * 2^attempt, max_delay)`; no jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay for the current attempt. Advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = 2u32
            .checked_pow(self.attempt)
            .and_then(|factor| self.config.min_delay.checked_mul(factor))
            .map_or(self.config.max_delay, |d| d.min(self.config.max_delay));
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Sleep for the next delay.
    pub async fn wait(&mut self) {
        let delay = self.next_delay();
        tokio::time::sleep(delay).await;
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
