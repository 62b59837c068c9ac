//! Job database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A row of the `jobs` table.
///
/// `claimed` is the claim time in Unix seconds, or 0 while unclaimed.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct JobDbModel {
    pub id: i64,
    /// Key of the worker type that consumes this job.
    pub jobtype: String,
    /// Disambiguates jobs of the same type, usually a dataset key.
    pub remote_id: String,
    /// JSON blob with job-specific details
    pub details: String,
    /// Creation time
    pub timestamp: i64,
    pub claimed: i64,
    /// Not eligible before this time
    pub claim_after: i64,
    pub attempts: i64,
    /// Seconds between runs of a recurring job, 0 for one-shot jobs
    pub interval: i64,
}

impl JobDbModel {
    pub fn is_claimed(&self) -> bool {
        self.claimed != 0
    }

    /// Whether a worker may claim this job at `now`.
    pub fn is_eligible(&self, now: i64) -> bool {
        !self.is_claimed() && self.claim_after <= now
    }

    pub fn is_recurring(&self) -> bool {
        self.interval > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(claimed: i64, claim_after: i64) -> JobDbModel {
        JobDbModel {
            id: 1,
            jobtype: "scrape-thing".to_string(),
            remote_id: "42".to_string(),
            details: "{}".to_string(),
            timestamp: 100,
            claimed,
            claim_after,
            attempts: 0,
            interval: 0,
        }
    }

    #[test]
    fn test_eligibility() {
        assert!(model(0, 0).is_eligible(100));
        assert!(model(0, 100).is_eligible(100));
        assert!(!model(0, 101).is_eligible(100));
        assert!(!model(50, 0).is_eligible(100));
    }

    #[test]
    fn test_recurring() {
        let mut job = model(0, 0);
        assert!(!job.is_recurring());
        job.interval = 60;
        assert!(job.is_recurring());
    }
}
