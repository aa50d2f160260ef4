//! Retry backoff: `min(base * 2^(attempts-1), cap)`.
//!
//! With the default policy the first failure waits 30s, each further failure
//! doubles the wait, and from the 7th failure on every retry waits 30 minutes.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

pub const BASE_DELAY: Duration = Duration::from_secs(30);
pub const MAX_DELAY: Duration = Duration::from_secs(30 * 60);

/// Delay in whole seconds after `attempts` failures, using the default policy.
///
/// `attempts` is 1-based; 0 is treated as 1.
pub fn delay_seconds(attempts: u32) -> u64 {
    BackoffPolicy::default().delay_for_attempt(attempts).as_secs()
}

/// Exponential backoff with a hard cap. No jitter: one worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: BASE_DELAY,
            cap: MAX_DELAY,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let exponent = attempts.max(1) - 1;
        2u32.checked_pow(exponent)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.cap, |delay| delay.min(self.cap))
    }

    /// When a job that has now failed `attempts` times should run again.
    pub fn next_run_at(&self, now: DateTime<Utc>, attempts: u32) -> DateTime<Utc> {
        TimeDelta::from_std(self.delay_for_attempt(attempts))
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
