use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dlq::AttemptOutcome;
use crate::error::PaymentError;

/// A single retry attempt record, appended to an entry's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryRecord {
    /// 1-based attempt number.
    pub attempt: u32,
    /// When this attempt finished.
    pub timestamp: DateTime<Utc>,
    /// Error from the attempt, `None` on success.
    pub error: Option<PaymentError>,
    pub duration_ms: u64,
    pub outcome: AttemptOutcome,
}

impl RetryRecord {
    pub fn new(
        attempt: u32,
        timestamp: DateTime<Utc>,
        error: Option<PaymentError>,
        duration_ms: u64,
        outcome: AttemptOutcome,
    ) -> Self {
        Self {
            attempt,
            timestamp,
            error,
            duration_ms,
            outcome,
        }
    }
}

/// What to do with an entry after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry {
        delay: Duration,
        next_retry_at: DateTime<Utc>,
    },
    Exhausted,
}

/// Exponential backoff bounded by an attempt budget.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// Delay after `attempts_made` failed attempts.
    ///
    /// Formula: `base_ms * multiplier^(attempts_made - 1)`, so the first failure
    /// waits exactly the base delay.
    pub fn backoff(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_ms = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent);

        if !delay_ms.is_finite() || delay_ms >= u64::MAX as f64 {
            return Duration::from_millis(u64::MAX);
        }
        Duration::from_millis(delay_ms.max(0.0).round() as u64)
    }

    /// Decide between another retry and permanent failure.
    pub fn decide(&self, attempts_made: u32, now: DateTime<Utc>) -> RetryDecision {
        if attempts_made >= self.max_attempts {
            return RetryDecision::Exhausted;
        }

        let delay = self.backoff(attempts_made);
        let step = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        let next_retry_at = now.checked_add_signed(step).unwrap_or(DateTime::<Utc>::MAX_UTC);

        RetryDecision::Retry {
            delay,
            next_retry_at,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 60_000,
            backoff_multiplier: 2.0,
        }
    }
}
