//! Worker abstraction.
//!
//! A worker is bound to one jobtype. The manager constructs it through the
//! registry, hands it a [`WorkerContext`] carrying the claimed job (if any) and
//! a cancellation token, and drives it with [`run_worker`]. Whatever the worker
//! leaves unsettled about its job is settled by the runner, so no instance
//! exits while still holding a claim.

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::dataset::DatasetService;
use super::job_queue::{Job, JobQueue, RetryDecision};
use super::manager::{ManagerHandle, PoolState};
use super::registry::WorkerRegistry;
use crate::{Error, Result};

/// A unit of execution bound to one jobtype.
#[async_trait]
pub trait Worker: Send {
    /// Perform one bounded unit of work. Perpetual workers loop in here until
    /// interrupted.
    async fn work(&mut self, ctx: &WorkerContext) -> Result<()>;

    /// Release held resources. Runs after `work` on every non-panicking path.
    async fn clean_up(&mut self, _ctx: &WorkerContext) {}
}

/// Lifecycle of a worker instance.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Running,
    Finished,
    Interrupted,
}

impl WorkerState {
    pub fn is_alive(&self) -> bool {
        matches!(self, Self::Idle | Self::Running)
    }
}

/// How a worker instance ended.
#[derive(Debug, Clone, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum WorkerOutcome {
    Completed,
    Interrupted,
    Failed(String),
    /// The worker panicked; its job stays claimed.
    Panicked(String),
}

/// Reported by a worker task when it ends.
#[derive(Debug, Clone)]
pub struct WorkerExit {
    pub worker_id: String,
    pub jobtype: String,
    pub job_id: Option<i64>,
    pub outcome: WorkerOutcome,
}

/// Services every worker can reach.
#[derive(Clone)]
pub struct WorkerServices {
    pub queue: Arc<JobQueue>,
    pub datasets: Arc<DatasetService>,
    pub registry: Arc<WorkerRegistry>,
    pub pool: Arc<PoolState>,
    pub manager: ManagerHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lease {
    None,
    Held,
    Settled,
}

/// Per-instance context passed to [`Worker::work`].
pub struct WorkerContext {
    worker_id: String,
    jobtype: String,
    job: Option<Job>,
    lease: Mutex<Lease>,
    cancel: CancellationToken,
    services: WorkerServices,
}

impl WorkerContext {
    pub fn new(
        jobtype: impl Into<String>,
        job: Option<Job>,
        cancel: CancellationToken,
        services: WorkerServices,
    ) -> Self {
        let lease = if job.is_some() { Lease::Held } else { Lease::None };
        Self {
            worker_id: uuid::Uuid::new_v4().simple().to_string(),
            jobtype: jobtype.into(),
            job,
            lease: Mutex::new(lease),
            cancel,
            services,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn jobtype(&self) -> &str {
        &self.jobtype
    }

    /// The claimed job this instance was started for.
    pub fn job(&self) -> Option<&Job> {
        self.job.as_ref()
    }

    /// The claimed job, or an error for jobless instances.
    pub fn require_job(&self) -> Result<&Job> {
        self.job.as_ref().ok_or_else(|| {
            Error::Other(format!("{} worker started without a job", self.jobtype))
        })
    }

    pub fn services(&self) -> &WorkerServices {
        &self.services
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.services.queue
    }

    pub fn datasets(&self) -> &Arc<DatasetService> {
        &self.services.datasets
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_interrupted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Safe point: fails with [`Error::Interrupted`] once interruption was requested.
    pub fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Sleep unless interrupted first.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Interrupted),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Whether the job is still claimed by this instance and not yet settled.
    pub fn holds_job(&self) -> bool {
        *self.lease.lock() == Lease::Held
    }

    /// Take the lease if it is still held, so each job is settled once.
    fn take_lease(&self) -> Option<&Job> {
        let mut lease = self.lease.lock();
        if *lease == Lease::Held {
            *lease = Lease::Settled;
            self.job.as_ref()
        } else {
            None
        }
    }

    /// Finish the claimed job. A no-op once the job has been settled.
    pub async fn finish_job(&self) -> Result<()> {
        match self.take_lease() {
            Some(job) => self.services.queue.finish(job).await,
            None => Ok(()),
        }
    }

    /// Release the claimed job for another attempt after `delay_secs`.
    pub async fn release_job(&self, delay_secs: u64) -> Result<()> {
        match self.take_lease() {
            Some(job) => self.services.queue.release(job, delay_secs).await,
            None => Ok(()),
        }
    }

    /// Apply the transient-failure policy to the claimed job.
    pub async fn retry_or_give_up(&self, error: &Error) -> Result<Option<RetryDecision>> {
        match self.take_lease() {
            Some(job) => self
                .services
                .queue
                .retry_or_give_up(job, error)
                .await
                .map(Some),
            None => Ok(None),
        }
    }
}

/// Observed by the manager for each running instance.
#[derive(Clone)]
pub struct WorkerHandle {
    pub worker_id: String,
    pub jobtype: String,
    pub job_id: Option<i64>,
    state: Arc<Mutex<WorkerState>>,
    cancel: CancellationToken,
}

impl WorkerHandle {
    pub fn new(ctx: &WorkerContext) -> Self {
        Self {
            worker_id: ctx.worker_id.clone(),
            jobtype: ctx.jobtype.clone(),
            job_id: ctx.job.as_ref().map(|job| job.id),
            state: Arc::new(Mutex::new(WorkerState::Idle)),
            cancel: ctx.cancel.clone(),
        }
    }

    /// Ask the worker to stop at its next safe point.
    pub fn interrupt(&self) {
        self.cancel.cancel();
    }

    pub fn is_alive(&self) -> bool {
        self.state.lock().is_alive()
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.lock() = state;
    }
}

/// Marks the handle finished if the task is dropped mid-run (aborted).
struct ExitGuard(WorkerHandle);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let mut state = self.0.state.lock();
        if state.is_alive() {
            *state = WorkerState::Finished;
        }
    }
}

/// Drive one worker instance to completion and settle its job.
pub async fn run_worker(
    mut worker: Box<dyn Worker>,
    ctx: WorkerContext,
    handle: WorkerHandle,
) -> WorkerExit {
    handle.set_state(WorkerState::Running);
    let _guard = ExitGuard(handle.clone());
    debug!(worker_id = %ctx.worker_id, jobtype = %ctx.jobtype, job_id = ?handle.job_id, "Worker started");

    let result = AssertUnwindSafe(async {
        let result = worker.work(&ctx).await;
        worker.clean_up(&ctx).await;
        result
    })
    .catch_unwind()
    .await;

    let outcome = match result {
        Ok(result) => settle(&ctx, result).await,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(
                worker_id = %ctx.worker_id,
                jobtype = %ctx.jobtype,
                job_id = ?handle.job_id,
                panic = %message,
                "Worker panicked; its job stays claimed until reclaimed"
            );
            WorkerOutcome::Panicked(message)
        }
    };

    handle.set_state(if outcome == WorkerOutcome::Interrupted {
        WorkerState::Interrupted
    } else {
        WorkerState::Finished
    });

    debug!(worker_id = %ctx.worker_id, jobtype = %ctx.jobtype, outcome = %outcome, "Worker exited");

    WorkerExit {
        worker_id: ctx.worker_id.clone(),
        jobtype: ctx.jobtype.clone(),
        job_id: handle.job_id,
        outcome,
    }
}

async fn settle(ctx: &WorkerContext, result: Result<()>) -> WorkerOutcome {
    match result {
        Ok(()) => {
            if let Err(e) = ctx.finish_job().await {
                error!(worker_id = %ctx.worker_id, error = %e, "Failed to finish job");
            }
            WorkerOutcome::Completed
        }
        Err(Error::Interrupted) => {
            if let Err(e) = ctx.release_job(0).await {
                error!(worker_id = %ctx.worker_id, error = %e, "Failed to release interrupted job");
            }
            WorkerOutcome::Interrupted
        }
        Err(e) if e.is_transient() => {
            if let Err(settle_err) = ctx.retry_or_give_up(&e).await {
                error!(worker_id = %ctx.worker_id, error = %settle_err, "Failed to release job for retry");
            }
            WorkerOutcome::Failed(e.to_string())
        }
        Err(e) => {
            warn!(
                worker_id = %ctx.worker_id,
                jobtype = %ctx.jobtype,
                job_id = ?ctx.job.as_ref().map(|job| job.id),
                error = %e,
                "Worker failed permanently"
            );
            if let Err(settle_err) = ctx.finish_job().await {
                error!(worker_id = %ctx.worker_id, error = %settle_err, "Failed to finish failed job");
            }
            WorkerOutcome::Failed(e.to_string())
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::job_queue::JobSpec;
    use crate::test_utils::test_services;

    struct ScriptedWorker {
        result: Option<Result<()>>,
        cleaned: Arc<Mutex<bool>>,
    }

    #[async_trait]
    impl Worker for ScriptedWorker {
        async fn work(&mut self, _ctx: &WorkerContext) -> Result<()> {
            self.result.take().unwrap_or(Ok(()))
        }

        async fn clean_up(&mut self, _ctx: &WorkerContext) {
            *self.cleaned.lock() = true;
        }
    }

    struct PanickingWorker;

    #[async_trait]
    impl Worker for PanickingWorker {
        async fn work(&mut self, _ctx: &WorkerContext) -> Result<()> {
            panic!("boom");
        }
    }

    async fn run_with(result: Result<()>) -> (WorkerExit, bool, Vec<Job>, tempfile::TempDir) {
        let (dir, services) = test_services().await;
        let job = services
            .queue
            .add_job(JobSpec::new("t", "1"))
            .await
            .unwrap()
            .into_job();
        let job = services.queue.claim(&job).await.unwrap();

        let cleaned = Arc::new(Mutex::new(false));
        let worker = ScriptedWorker {
            result: Some(result),
            cleaned: cleaned.clone(),
        };
        let ctx = WorkerContext::new("t", Some(job), CancellationToken::new(), services.clone());
        let handle = WorkerHandle::new(&ctx);
        let exit = run_worker(Box::new(worker), ctx, handle.clone()).await;
        assert!(!handle.is_alive());

        let jobs = services.queue.get_all_jobs(None).await.unwrap();
        let cleaned = *cleaned.lock();
        (exit, cleaned, jobs, dir)
    }

    #[tokio::test]
    async fn test_success_finishes_job() {
        let (exit, cleaned, jobs, _dir) = run_with(Ok(())).await;
        assert_eq!(exit.outcome, WorkerOutcome::Completed);
        assert!(cleaned);
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn test_interrupt_releases_job() {
        let (exit, cleaned, jobs, _dir) = run_with(Err(Error::Interrupted)).await;
        assert_eq!(exit.outcome, WorkerOutcome::Interrupted);
        assert!(cleaned);
        assert_eq!(jobs.len(), 1);
        assert!(!jobs[0].is_claimed());
        assert_eq!(jobs[0].attempts, 1);
    }

    #[tokio::test]
    async fn test_transient_error_releases_with_delay() {
        let (exit, _cleaned, jobs, _dir) = run_with(Err(Error::transient("timeout"))).await;
        assert!(matches!(exit.outcome, WorkerOutcome::Failed(_)));
        assert_eq!(jobs.len(), 1);
        assert!(!jobs[0].is_claimed());
        assert!(jobs[0].claim_after > crate::database::time::now_secs());
    }

    #[tokio::test]
    async fn test_permanent_error_finishes_job() {
        let (exit, _cleaned, jobs, _dir) = run_with(Err(Error::processor("bad"))).await;
        assert_eq!(exit.outcome, WorkerOutcome::Failed("bad".to_string()));
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn test_panic_leaves_job_claimed() {
        let (_dir, services) = test_services().await;
        let job = services
            .queue
            .add_job(JobSpec::new("t", "1"))
            .await
            .unwrap()
            .into_job();
        let job = services.queue.claim(&job).await.unwrap();

        let ctx = WorkerContext::new("t", Some(job), CancellationToken::new(), services.clone());
        let handle = WorkerHandle::new(&ctx);
        let exit = run_worker(Box::new(PanickingWorker), ctx, handle).await;

        assert_eq!(exit.outcome, WorkerOutcome::Panicked("boom".to_string()));
        let jobs = services.queue.get_all_jobs(None).await.unwrap();
        assert!(jobs[0].is_claimed());
    }

    #[tokio::test]
    async fn test_sleep_is_interruptible() {
        let (_dir, services) = test_services().await;
        let cancel = CancellationToken::new();
        let ctx = WorkerContext::new("t", None, cancel.clone(), services);
        cancel.cancel();
        assert!(matches!(
            ctx.sleep(Duration::from_secs(60)).await,
            Err(Error::Interrupted)
        ));
        assert!(ctx.checkpoint().is_err());
        // Jobless contexts settle nothing
        ctx.finish_job().await.unwrap();
        assert!(!ctx.holds_job());
    }
}
