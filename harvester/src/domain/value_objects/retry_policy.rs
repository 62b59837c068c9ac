//! How long a transiently failed job waits before it is claimable again.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff schedule for released jobs.
///
/// The schedule is indexed by the job's `attempts` counter, the number of
/// times it has already been released.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Releases allowed before the job is finished as a permanent failure.
    pub max_retries: u32,
    pub initial_delay_secs: u64,
    /// Cap on a single delay before jitter.
    pub max_delay_secs: u64,
    pub backoff_multiplier: f64,
    /// Add up to half the delay again at random.
    pub use_jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_secs: 10,
            max_delay_secs: 600,
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_retries
    }

    /// Delay before the retry that follows `attempts` earlier releases.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let exponent = attempts.min(32) as i32;
        let scheduled = (self.initial_delay_secs as f64 * self.backoff_multiplier.powi(exponent))
            .min(self.max_delay_secs as f64);
        let factor = if self.use_jitter {
            1.0 + 0.5 * rand::random::<f64>()
        } else {
            1.0
        };
        Duration::from_secs_f64((scheduled * factor).max(0.0))
    }

    /// Whole seconds to pass to `release`, or `None` once retries are spent.
    ///
    /// Rounded up so the job is never claimable before the delay elapsed.
    pub fn release_delay_secs(&self, attempts: u32) -> Option<u64> {
        if !self.should_retry(attempts) {
            return None;
        }
        let delay = self.delay_for_attempt(attempts);
        Some(delay.as_secs() + u64::from(delay.subsec_nanos() > 0))
    }
}
