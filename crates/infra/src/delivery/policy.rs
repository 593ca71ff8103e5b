//! Retry and delivery policies.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Attempt budget and backoff shape.
///
/// The wait after attempt `n` (1-indexed) is
/// `initial_delay * multiplier^(n-1)`, clamped to `max_delay` when set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per message, including the first (default: 3).
    pub max_attempts: u32,
    /// Wait after the first failed attempt (default: 1s).
    pub initial_delay: Duration,
    /// Growth factor per attempt (default: 2.0).
    pub multiplier: f64,
    /// Optional cap on any single wait.
    pub max_delay: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            max_delay: None,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            multiplier: 1.0,
            max_delay: None,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, initial_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts,
            initial_delay,
            multiplier,
            max_delay: None,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Delay to wait after a failed attempt (1-indexed).
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exp = self.multiplier.powi(attempt.saturating_sub(1).min(i32::MAX as u32) as i32);
        let nanos = (self.initial_delay.as_nanos() as f64 * exp).round();
        let delay = if nanos < u64::MAX as f64 {
            Duration::from_nanos(nanos as u64)
        } else {
            Duration::MAX
        };

        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    /// Check if another attempt is allowed after `attempt` attempts.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Per-attempt limits and DLQ retention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Upper bound on one upstream call (default: 10s).
    pub attempt_timeout: Duration,
    /// How long dead-letter entries live untouched (default: 24h).
    pub dlq_retention: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(10),
            dlq_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}
