use rand::Rng;
use std::time::Duration;

use crate::config::DeliveryConfig;

/// Bounded exponential backoff with jitter
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Delay before the attempt following attempt number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff);

        // Jitter of up to a quarter of the base either way
        let base_ms = base.as_millis() as i64;
        let half_spread = base_ms / 4;
        let jitter = rand::thread_rng().gen_range(-half_spread..=half_spread);
        Duration::from_millis((base_ms + jitter).max(1) as u64)
    }
}

/// Whether an HTTP status is worth another attempt. Authentication and other client errors
/// are final; throttling, timeouts and server errors are not.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429) || status >= 500
}
