//! Persistent job queue.
//!
//! Jobs are rows in the `jobs` table. Ownership of a job is decided solely by
//! the conditional update in [`JobQueue::claim`]; the queue keeps no in-memory
//! state besides a [`Notify`] used to wake the worker manager.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::database::models::JobDbModel;
use crate::database::repositories::{JobRepository, NewJobDbModel};
use crate::database::time::now_secs;
use crate::domain::RetryPolicy;
use crate::utils::json::{self, JsonContext};
use crate::{Error, Result};

/// A queued unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub jobtype: String,
    pub remote_id: String,
    pub details: Value,
    pub created_at: i64,
    /// Claim time, 0 while unclaimed.
    pub claimed_at: i64,
    pub claim_after: i64,
    pub attempts: u32,
    /// Seconds between runs, 0 for one-shot jobs.
    pub interval: u64,
}

impl Job {
    pub fn is_claimed(&self) -> bool {
        self.claimed_at != 0
    }

    pub fn is_recurring(&self) -> bool {
        self.interval > 0
    }

    /// Look up a top-level field of the details object.
    pub fn detail(&self, key: &str) -> Option<&Value> {
        self.details.get(key)
    }
}

impl From<JobDbModel> for Job {
    fn from(model: JobDbModel) -> Self {
        let details = json::parse_or_default::<Value>(
            &model.details,
            JsonContext::JobField {
                job_id: model.id,
                field: "details",
            },
            "Failed to parse job details",
        );
        Self {
            id: model.id,
            jobtype: model.jobtype,
            remote_id: model.remote_id,
            details,
            created_at: model.timestamp,
            claimed_at: model.claimed,
            claim_after: model.claim_after,
            attempts: model.attempts.max(0) as u32,
            interval: model.interval.max(0) as u64,
        }
    }
}

/// What to queue.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub jobtype: String,
    pub remote_id: String,
    pub details: Value,
    pub claim_after: i64,
    pub interval: u64,
}

impl JobSpec {
    pub fn new(jobtype: impl Into<String>, remote_id: impl Into<String>) -> Self {
        Self {
            jobtype: jobtype.into(),
            remote_id: remote_id.into(),
            details: Value::Object(Default::default()),
            claim_after: 0,
            interval: 0,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_claim_after(mut self, claim_after: i64) -> Self {
        self.claim_after = claim_after;
        self
    }

    pub fn with_interval(mut self, interval: u64) -> Self {
        self.interval = interval;
        self
    }
}

/// Result of [`JobQueue::add_job`].
#[derive(Debug, Clone, PartialEq)]
pub enum AddJobOutcome {
    Created(Job),
    /// A job for the same (jobtype, remote_id) was already queued; it is
    /// returned unchanged.
    AlreadyExists(Job),
}

impl AddJobOutcome {
    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }

    pub fn job(&self) -> &Job {
        match self {
            Self::Created(job) | Self::AlreadyExists(job) => job,
        }
    }

    pub fn into_job(self) -> Job {
        match self {
            Self::Created(job) | Self::AlreadyExists(job) => job,
        }
    }

    /// For callers that treat a duplicate as an error.
    pub fn into_created(self) -> Result<Job> {
        match self {
            Self::Created(job) => Ok(job),
            Self::AlreadyExists(job) => Err(Error::AlreadyExists {
                jobtype: job.jobtype,
                remote_id: job.remote_id,
            }),
        }
    }
}

/// What [`JobQueue::retry_or_give_up`] did with a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Released { delay: Duration },
    GaveUp,
}

/// The job queue service.
pub struct JobQueue {
    repository: Arc<dyn JobRepository>,
    notify: Arc<Notify>,
    retry_policy: RetryPolicy,
}

impl JobQueue {
    pub fn new(repository: Arc<dyn JobRepository>) -> Self {
        Self {
            repository,
            notify: Arc::new(Notify::new()),
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Notified whenever a new job is queued.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Queue a job unless one for the same (jobtype, remote_id) exists.
    pub async fn add_job(&self, spec: JobSpec) -> Result<AddJobOutcome> {
        if spec.jobtype.is_empty() {
            return Err(Error::validation("jobtype must not be empty"));
        }

        let details = serde_json::to_string(&spec.details)?;
        let new_job = NewJobDbModel {
            jobtype: spec.jobtype.clone(),
            remote_id: spec.remote_id.clone(),
            details,
            timestamp: now_secs(),
            claim_after: spec.claim_after,
            interval: spec.interval as i64,
        };

        match self.repository.insert_job(&new_job).await? {
            Some(model) => {
                let job = Job::from(model);
                debug!(
                    job_id = job.id,
                    jobtype = %job.jobtype,
                    remote_id = %job.remote_id,
                    "Job queued"
                );
                self.notify.notify_one();
                Ok(AddJobOutcome::Created(job))
            }
            None => {
                let existing = self
                    .repository
                    .find_by_target(&spec.jobtype, &spec.remote_id)
                    .await?
                    .ok_or_else(|| {
                        // Finished between the conflicting insert and this lookup
                        Error::Database(format!(
                            "{} job for '{}' vanished during insert",
                            spec.jobtype, spec.remote_id
                        ))
                    })?;
                debug!(
                    jobtype = %spec.jobtype,
                    remote_id = %spec.remote_id,
                    "Job already queued"
                );
                Ok(AddJobOutcome::AlreadyExists(Job::from(existing)))
            }
        }
    }

    /// Oldest unclaimed job of `jobtype` that is eligible at `now`.
    pub async fn get_job(&self, jobtype: &str, now: i64) -> Result<Option<Job>> {
        Ok(self
            .repository
            .next_eligible(jobtype, now)
            .await?
            .map(Job::from))
    }

    /// The job for `(jobtype, remote_id)`, claimed or not.
    pub async fn find_job(&self, jobtype: &str, remote_id: &str) -> Result<Option<Job>> {
        Ok(self
            .repository
            .find_by_target(jobtype, remote_id)
            .await?
            .map(Job::from))
    }

    /// Atomically claim `job`. Fails with [`Error::ClaimConflict`] when another
    /// worker got there first.
    pub async fn claim(&self, job: &Job) -> Result<Job> {
        let now = now_secs();
        if !self.repository.claim(job.id, now).await? {
            return Err(Error::ClaimConflict { job_id: job.id });
        }
        debug!(job_id = job.id, jobtype = %job.jobtype, "Job claimed");
        Ok(Job {
            claimed_at: now,
            ..job.clone()
        })
    }

    /// Unclaim `job`, count an attempt and make it eligible after `delay_secs`.
    pub async fn release(&self, job: &Job, delay_secs: u64) -> Result<()> {
        self.release_until(job, now_secs() + delay_secs as i64)
            .await
    }

    /// Unclaim `job`, count an attempt and make it eligible at `claim_after`.
    pub async fn release_until(&self, job: &Job, claim_after: i64) -> Result<()> {
        if !self.repository.release(job.id, claim_after).await? {
            debug!(job_id = job.id, "Released job no longer exists");
            return Ok(());
        }
        debug!(job_id = job.id, jobtype = %job.jobtype, claim_after, "Job released");
        if claim_after <= now_secs() {
            self.notify.notify_one();
        }
        Ok(())
    }

    /// Remove a completed job. Recurring jobs are rescheduled instead.
    pub async fn finish(&self, job: &Job) -> Result<()> {
        if job.is_recurring() {
            let next_run = now_secs() + job.interval as i64;
            self.repository.reschedule(job.id, next_run).await?;
            debug!(job_id = job.id, jobtype = %job.jobtype, next_run, "Recurring job rescheduled");
        } else if self.repository.delete_job(job.id).await? {
            debug!(job_id = job.id, jobtype = %job.jobtype, "Job finished");
        } else {
            debug!(job_id = job.id, "Finished job no longer exists");
        }
        Ok(())
    }

    /// Reset every claim. Attempts are left untouched.
    pub async fn release_all(&self) -> Result<u64> {
        let released = self.repository.release_all().await?;
        if released > 0 {
            info!(released, "Released claimed jobs from a previous run");
            self.notify.notify_one();
        }
        Ok(released)
    }

    pub async fn get_job_count(&self, jobtype: Option<&str>) -> Result<u64> {
        Ok(self.repository.count_jobs(jobtype).await?.max(0) as u64)
    }

    pub async fn get_all_jobs(&self, jobtype: Option<&str>) -> Result<Vec<Job>> {
        Ok(self
            .repository
            .list_jobs(jobtype)
            .await?
            .into_iter()
            .map(Job::from)
            .collect())
    }

    /// Jobs claimed before `claimed_before` and still claimed.
    pub async fn find_stale_claims(&self, claimed_before: i64) -> Result<Vec<Job>> {
        Ok(self
            .repository
            .list_claimed_before(claimed_before)
            .await?
            .into_iter()
            .map(Job::from)
            .collect())
    }

    /// Handle a transient failure of a claimed job.
    ///
    /// Below the attempts cap the job is released with a randomized delay;
    /// at the cap it is finished and the failure logged as permanent.
    pub async fn retry_or_give_up(&self, job: &Job, error: &Error) -> Result<RetryDecision> {
        if let Some(delay_secs) = self.retry_policy.release_delay_secs(job.attempts) {
            warn!(
                job_id = job.id,
                jobtype = %job.jobtype,
                remote_id = %job.remote_id,
                attempt = job.attempts + 1,
                delay_secs,
                error = %error,
                "Transient failure, job released for retry"
            );
            self.release(job, delay_secs).await?;
            Ok(RetryDecision::Released {
                delay: Duration::from_secs(delay_secs),
            })
        } else {
            warn!(
                job_id = job.id,
                jobtype = %job.jobtype,
                remote_id = %job.remote_id,
                attempts = job.attempts,
                error = %error,
                "Giving up on job after repeated failures"
            );
            self.finish(job).await?;
            Ok(RetryDecision::GaveUp)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::setup_test_db;
    use crate::database::repositories::SqlxJobRepository;
    use serde_json::json;

    async fn queue() -> (tempfile::TempDir, JobQueue) {
        let (dir, pool) = setup_test_db().await;
        let queue = JobQueue::new(Arc::new(SqlxJobRepository::new(pool)));
        (dir, queue)
    }

    #[tokio::test]
    async fn test_add_job_is_idempotent() {
        let (_dir, queue) = queue().await;

        let first = queue
            .add_job(JobSpec::new("scrape-thing", "42").with_details(json!({"board": "x"})))
            .await
            .unwrap();
        assert!(first.is_created());

        let second = queue.add_job(JobSpec::new("scrape-thing", "42")).await.unwrap();
        assert!(!second.is_created());
        assert_eq!(second.job().id, first.job().id);
        assert_eq!(second.job().detail("board"), Some(&json!("x")));

        assert!(matches!(
            second.into_created(),
            Err(Error::AlreadyExists { .. })
        ));
        assert_eq!(queue.get_job_count(Some("scrape-thing")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_get_job_returns_oldest_eligible() {
        let (_dir, queue) = queue().await;
        let now = now_secs();

        queue
            .add_job(JobSpec::new("t", "later").with_claim_after(now + 1000))
            .await
            .unwrap();
        let first = queue.add_job(JobSpec::new("t", "a")).await.unwrap().into_job();
        queue.add_job(JobSpec::new("t", "b")).await.unwrap();
        queue.add_job(JobSpec::new("other", "a")).await.unwrap();

        let job = queue.get_job("t", now).await.unwrap().unwrap();
        assert_eq!(job.id, first.id);

        queue.claim(&job).await.unwrap();
        let next = queue.get_job("t", now).await.unwrap().unwrap();
        assert_eq!(next.remote_id, "b");

        assert!(queue.get_job("missing", now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_second_claim_conflicts() {
        let (_dir, queue) = queue().await;
        let job = queue.add_job(JobSpec::new("t", "1")).await.unwrap().into_job();

        let claimed = queue.claim(&job).await.unwrap();
        assert!(claimed.is_claimed());
        assert!(matches!(
            queue.claim(&job).await,
            Err(Error::ClaimConflict { job_id }) if job_id == job.id
        ));
    }

    #[tokio::test]
    async fn test_finish_deletes_and_recurring_reschedules() {
        let (_dir, queue) = queue().await;
        let one_shot = queue.add_job(JobSpec::new("t", "1")).await.unwrap().into_job();
        let recurring = queue
            .add_job(JobSpec::new("t", "2").with_interval(60))
            .await
            .unwrap()
            .into_job();

        let one_shot = queue.claim(&one_shot).await.unwrap();
        queue.finish(&one_shot).await.unwrap();

        let recurring = queue.claim(&recurring).await.unwrap();
        queue.finish(&recurring).await.unwrap();

        let jobs = queue.get_all_jobs(Some("t")).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].remote_id, "2");
        assert!(!jobs[0].is_claimed());
        assert!(jobs[0].claim_after >= now_secs() + 59);
    }

    #[tokio::test]
    async fn test_retry_or_give_up_respects_cap() {
        let (_dir, queue) = queue().await;
        let queue = queue.with_retry_policy(RetryPolicy {
            max_retries: 1,
            initial_delay_secs: 5,
            use_jitter: false,
            ..Default::default()
        });
        let job = queue.add_job(JobSpec::new("t", "1")).await.unwrap().into_job();
        let err = Error::transient("timeout");

        let claimed = queue.claim(&job).await.unwrap();
        let decision = queue.retry_or_give_up(&claimed, &err).await.unwrap();
        assert_eq!(
            decision,
            RetryDecision::Released {
                delay: Duration::from_secs(5)
            }
        );

        let job = queue.get_all_jobs(None).await.unwrap().remove(0);
        assert_eq!(job.attempts, 1);
        let claimed = queue.claim(&job).await.unwrap();
        let decision = queue.retry_or_give_up(&claimed, &err).await.unwrap();
        assert_eq!(decision, RetryDecision::GaveUp);
        assert_eq!(queue.get_job_count(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_find_stale_claims() {
        let (_dir, queue) = queue().await;
        let job = queue.add_job(JobSpec::new("t", "1")).await.unwrap().into_job();
        queue.claim(&job).await.unwrap();

        assert!(queue.find_stale_claims(now_secs() - 100).await.unwrap().is_empty());
        assert_eq!(queue.find_stale_claims(now_secs() + 1).await.unwrap().len(), 1);
    }
}
