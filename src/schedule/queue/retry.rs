use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Redelivery policy applied by the queue when a handler reports failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Redeliveries after the first attempt.
    pub max_retries: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            min_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(600),
        }
    }
}

impl RetryPolicy {
    /// Delay before the `retry`-th redelivery (1-based): `min * 2^(retry-1)`, capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        let delay = self.min_backoff.saturating_mul(1u32 << exponent);
        delay.min(self.max_backoff)
    }

    /// Total deliveries a message gets before it is dead-lettered.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}
