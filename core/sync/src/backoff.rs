//! Inter-pass backoff for drain passes that leave retryable work behind.
//!
//! The whole queue backs off together: the delay grows with the number of
//! consecutive passes that ended with pending operations, not per operation.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the delay between automatic drain passes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first follow-up pass, in milliseconds.
    pub base_ms: u64,
    /// Maximum delay (cap for exponential growth), in milliseconds.
    pub cap_ms: u64,
    /// Multiplier for exponential backoff.
    pub multiplier: f64,
    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl BackoffConfig {
    /// Create a backoff configuration from base and cap delays.
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base_ms: base.as_millis() as u64,
            cap_ms: cap.as_millis() as u64,
            ..Self::default()
        }
    }

    /// Set backoff multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before follow-up pass number `step` (0-based).
    pub fn delay_for_pass(&self, step: u32) -> Duration {
        let exponent = step.min(i32::MAX as u32) as i32;
        let base_delay = self.base_ms as f64 * self.multiplier.max(1.0).powi(exponent);

        let capped_delay = base_delay.min(self.cap_ms as f64);

        let final_delay = if self.jitter {
            // Add random jitter of +/- 25%
            let jitter_factor = 0.75 + (rand::random::<f64>() * 0.5);
            (capped_delay * jitter_factor).min(self.cap_ms as f64)
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 2_000,
            cap_ms: 60_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}
