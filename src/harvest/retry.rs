//! Retry policy for downloads
//!
//! Exponential backoff, doubling from a base delay and capped at a maximum.

use std::time::Duration;

/// Whether a failure is worth another attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    Transient,
    Permanent,
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per item, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Delay before the attempt that follows failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }

    pub fn decide(&self, failure: FailureType, attempt: u32) -> RetryDecision {
        match failure {
            FailureType::Permanent => RetryDecision::GiveUp,
            FailureType::Transient if attempt >= self.max_attempts => RetryDecision::GiveUp,
            FailureType::Transient => RetryDecision::Retry {
                delay: self.backoff(attempt),
            },
        }
    }
}
