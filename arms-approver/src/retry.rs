use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bounded attempts with exponential backoff between them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(with = "crate::config::millis")]
    pub base_delay: Duration,
    /// Cap for later retries.
    #[serde(with = "crate::config::millis")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::record_default()
    }
}

impl RetryPolicy {
    /// Restarting a record from the packages list.
    pub fn record_default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
        }
    }

    /// Re-attaching to the debugging endpoint after the session dropped.
    pub fn reconnect_default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
        }
    }

    /// Exponential backoff delay for the given retry index (1-based).
    pub fn backoff_delay(&self, retry_index: u32) -> Duration {
        let shift = retry_index.saturating_sub(1).min(31);
        let multiplier = 1u32 << shift;
        let base = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay);
        base.min(self.max_delay)
    }
}
