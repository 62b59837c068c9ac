//! Crash backoff for worker types.
//!
//! A panicking worker leaves its job claimed, so a type that panics on every
//! job would otherwise burn through the queue. Once a type has crashed more
//! than `failure_threshold` times inside `failure_window`, the manager stops
//! starting it for `base_backoff * 2^(excess - 1)`, capped at `max_backoff`.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct RestartTrackerConfig {
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub failure_window: Duration,
    pub failure_threshold: usize,
}

impl Default for RestartTrackerConfig {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5 * 60),
            failure_window: Duration::from_secs(60),
            failure_threshold: 3,
        }
    }
}

#[derive(Debug, Default)]
struct TypeCrashes {
    recent: VecDeque<Instant>,
    lifetime: u64,
    hold_until: Option<Instant>,
}

impl TypeCrashes {
    fn forget_before(&mut self, cutoff: Option<Instant>) {
        let Some(cutoff) = cutoff else { return };
        while self.recent.front().is_some_and(|&at| at <= cutoff) {
            self.recent.pop_front();
        }
    }
}

/// Per-jobtype crash history kept by the manager loop.
#[derive(Debug, Default)]
pub struct RestartTracker {
    config: RestartTrackerConfig,
    types: HashMap<String, TypeCrashes>,
}

impl RestartTracker {
    pub fn new() -> Self {
        Self::with_config(RestartTrackerConfig::default())
    }

    pub fn with_config(config: RestartTrackerConfig) -> Self {
        Self {
            config,
            types: HashMap::new(),
        }
    }

    /// Note a crash of `jobtype`; returns how long the type is now held back.
    pub fn record_crash(&mut self, jobtype: &str) -> Duration {
        self.record_crash_at(jobtype, Instant::now())
    }

    fn record_crash_at(&mut self, jobtype: &str, now: Instant) -> Duration {
        let cutoff = now.checked_sub(self.config.failure_window);
        let crashes = self.types.entry(jobtype.to_owned()).or_default();
        crashes.forget_before(cutoff);
        crashes.recent.push_back(now);
        crashes.lifetime += 1;

        let recent = crashes.recent.len();
        let hold = hold_for(&self.config, recent);
        crashes.hold_until = (!hold.is_zero()).then(|| now + hold);

        if hold.is_zero() {
            tracing::debug!(jobtype, recent, "Worker crashed");
        } else {
            tracing::warn!(jobtype, recent, ?hold, "Worker type keeps crashing, holding it back");
        }
        hold
    }

    /// A clean exit clears the recent history and any hold.
    pub fn record_success(&mut self, jobtype: &str) {
        if let Some(crashes) = self.types.get_mut(jobtype) {
            crashes.recent.clear();
            crashes.hold_until = None;
        }
    }

    pub fn may_start(&self, jobtype: &str) -> bool {
        self.may_start_at(jobtype, Instant::now())
    }

    fn may_start_at(&self, jobtype: &str, now: Instant) -> bool {
        match self.types.get(jobtype).and_then(|c| c.hold_until) {
            Some(until) => now >= until,
            None => true,
        }
    }

    pub fn total_crashes(&self, jobtype: &str) -> u64 {
        self.types.get(jobtype).map_or(0, |c| c.lifetime)
    }
}

fn hold_for(config: &RestartTrackerConfig, recent: usize) -> Duration {
    let Some(excess) = recent.checked_sub(config.failure_threshold).filter(|&n| n > 0) else {
        return Duration::ZERO;
    };
    let doublings = (excess - 1).min(16) as u32;
    config
        .base_backoff
        .saturating_mul(1 << doublings)
        .min(config.max_backoff)
}
