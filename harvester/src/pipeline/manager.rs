//! Worker manager.
//!
//! Keeps every registered worker type at its configured number of live
//! instances, reaps instances as they finish and drives orderly shutdown.
//! The manager decides how many instances of a type run; which job each of
//! them gets is decided by the queue's claim alone.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dataset::DatasetService;
use super::job_queue::{Job, JobQueue};
use super::registry::{WorkerDescriptor, WorkerRegistry};
use super::restart_tracker::RestartTracker;
use super::worker::{
    WorkerContext, WorkerExit, WorkerHandle, WorkerOutcome, WorkerServices, run_worker,
};
use crate::database::time::now_secs;
use crate::{Error, Result};

/// Configuration for the worker manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Reconciliation tick in milliseconds.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// How long shutdown waits for interrupted workers before aborting them.
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_drain_timeout_secs() -> u64 {
    30
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

/// Live view of the pool, shared with workers and introspection.
#[derive(Debug, Default)]
pub struct PoolState {
    live: DashMap<String, usize>,
    /// job id -> worker id
    claims: DashMap<i64, String>,
}

impl PoolState {
    pub fn live_count(&self, jobtype: &str) -> usize {
        self.live.get(jobtype).map(|n| *n).unwrap_or(0)
    }

    pub fn total_live(&self) -> usize {
        self.live.iter().map(|entry| *entry.value()).sum()
    }

    /// Whether a live worker in this process holds `job_id`.
    pub fn holds_claim(&self, job_id: i64) -> bool {
        self.claims.contains_key(&job_id)
    }

    pub fn snapshot(&self) -> BTreeMap<String, usize> {
        self.live
            .iter()
            .filter(|entry| *entry.value() > 0)
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    fn rebuild<'a>(&self, handles: impl Iterator<Item = &'a WorkerHandle>) {
        let mut live: HashMap<String, usize> = HashMap::new();
        let mut claims: HashMap<i64, String> = HashMap::new();
        for handle in handles.filter(|h| h.is_alive()) {
            *live.entry(handle.jobtype.clone()).or_default() += 1;
            if let Some(job_id) = handle.job_id {
                claims.insert(job_id, handle.worker_id.clone());
            }
        }
        self.live.retain(|jobtype, _| live.contains_key(jobtype));
        for (jobtype, count) in live {
            self.live.insert(jobtype, count);
        }
        self.claims.retain(|job_id, _| claims.contains_key(job_id));
        for (job_id, worker_id) in claims {
            self.claims.insert(job_id, worker_id);
        }
    }

    fn clear(&self) {
        self.live.clear();
        self.claims.clear();
    }
}

/// Cloneable control handle for a running manager.
#[derive(Clone)]
pub struct ManagerHandle {
    cancel: CancellationToken,
    drain_override: Arc<Mutex<Option<Duration>>>,
    pool: Arc<PoolState>,
}

impl ManagerHandle {
    /// Request an orderly shutdown with the configured drain deadline.
    pub fn shutdown(&self) {
        info!("Worker manager shutdown requested");
        self.cancel.cancel();
    }

    /// Request shutdown with a specific drain deadline (zero aborts at once).
    pub fn shutdown_with_drain(&self, drain: Duration) {
        *self.drain_override.lock() = Some(drain);
        self.shutdown();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn pool(&self) -> &Arc<PoolState> {
        &self.pool
    }
}

/// Summary of a shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Workers alive when shutdown started.
    pub total_workers: usize,
    pub graceful_stops: usize,
    pub forced_terminations: usize,
}

impl ShutdownReport {
    pub fn all_graceful(&self) -> bool {
        self.forced_terminations == 0
    }
}

/// The worker manager.
pub struct WorkerManager {
    config: ManagerConfig,
    registry: Arc<WorkerRegistry>,
    services: WorkerServices,
    handles: HashMap<String, WorkerHandle>,
    tasks: JoinSet<WorkerExit>,
    restart_tracker: RestartTracker,
    cancel: CancellationToken,
    drain_override: Arc<Mutex<Option<Duration>>>,
    last_pool_size: Option<usize>,
}

impl WorkerManager {
    pub fn new(
        config: ManagerConfig,
        queue: Arc<JobQueue>,
        datasets: Arc<DatasetService>,
        registry: WorkerRegistry,
    ) -> Self {
        let registry = Arc::new(registry);
        let cancel = CancellationToken::new();
        let drain_override = Arc::new(Mutex::new(None));
        let pool = Arc::new(PoolState::default());
        let handle = ManagerHandle {
            cancel: cancel.clone(),
            drain_override: drain_override.clone(),
            pool: pool.clone(),
        };
        let services = WorkerServices {
            queue,
            datasets,
            registry: registry.clone(),
            pool,
            manager: handle,
        };

        Self {
            config,
            registry,
            services,
            handles: HashMap::new(),
            tasks: JoinSet::new(),
            restart_tracker: RestartTracker::new(),
            cancel,
            drain_override,
            last_pool_size: None,
        }
    }

    pub fn handle(&self) -> ManagerHandle {
        self.services.manager.clone()
    }

    pub fn services(&self) -> &WorkerServices {
        &self.services
    }

    /// Recover claims and queue the jobs that types ensure for themselves.
    pub async fn startup(&self) -> Result<()> {
        self.services.queue.release_all().await?;

        for descriptor in self.registry.descriptors() {
            if let Some(spec) = descriptor.ensure_job_spec() {
                let outcome = self.services.queue.add_job(spec).await?;
                debug!(
                    jobtype = %descriptor.jobtype,
                    created = outcome.is_created(),
                    "Ensured job"
                );
            }
        }

        info!(
            worker_types = self.registry.len(),
            "Worker manager started"
        );
        Ok(())
    }

    /// Run until shutdown is requested, then drain.
    pub async fn run(mut self) -> Result<ShutdownReport> {
        self.startup().await?;

        let notifier = self.services.queue.notifier();
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.tick_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                Some(result) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    self.reap(result);
                }
                _ = notifier.notified() => {}
                _ = ticker.tick() => {}
            }

            if self.cancel.is_cancelled() {
                break;
            }
            self.delegate().await;
        }

        Ok(self.shutdown().await)
    }

    /// One reconciliation pass over all registered types.
    pub async fn delegate(&mut self) {
        self.prune();

        let descriptors: Vec<WorkerDescriptor> =
            self.registry.descriptors().into_iter().cloned().collect();

        for descriptor in descriptors {
            if self.cancel.is_cancelled() {
                break;
            }
            if !self.restart_tracker.may_start(&descriptor.jobtype) {
                continue;
            }
            if let Err(e) = self.fill_type(&descriptor).await {
                warn!(jobtype = %descriptor.jobtype, error = %e, "Failed to start workers");
            }
        }

        self.prune();
    }

    async fn fill_type(&mut self, descriptor: &WorkerDescriptor) -> Result<()> {
        let mut live = self.live_count(&descriptor.jobtype);

        if descriptor.perpetual {
            while live < descriptor.max_workers {
                self.spawn(descriptor, None);
                live += 1;
            }
            return Ok(());
        }

        while live < descriptor.max_workers {
            let Some(job) = self
                .services
                .queue
                .get_job(&descriptor.jobtype, now_secs())
                .await?
            else {
                break;
            };

            match self.services.queue.claim(&job).await {
                Ok(claimed) => {
                    self.spawn(descriptor, Some(claimed));
                    live += 1;
                }
                // Another process took it; the next get_job skips it
                Err(Error::ClaimConflict { job_id }) => {
                    debug!(job_id, jobtype = %descriptor.jobtype, "Lost claim race");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn spawn(&mut self, descriptor: &WorkerDescriptor, job: Option<Job>) {
        let Some(registered) = self.registry.get(&descriptor.jobtype) else {
            return;
        };
        let worker = registered.create();
        let ctx = WorkerContext::new(
            &descriptor.jobtype,
            job,
            self.cancel.child_token(),
            self.services.clone(),
        );
        let handle = WorkerHandle::new(&ctx);

        debug!(
            worker_id = %handle.worker_id,
            jobtype = %handle.jobtype,
            job_id = ?handle.job_id,
            "Starting worker"
        );

        self.handles.insert(handle.worker_id.clone(), handle.clone());
        self.tasks.spawn(run_worker(worker, ctx, handle));
        self.services.pool.rebuild(self.handles.values());
    }

    fn reap(&mut self, result: std::result::Result<WorkerExit, JoinError>) {
        match result {
            Ok(exit) => {
                match &exit.outcome {
                    WorkerOutcome::Panicked(_) => {
                        self.restart_tracker.record_crash(&exit.jobtype);
                    }
                    WorkerOutcome::Completed => {
                        self.restart_tracker.record_success(&exit.jobtype);
                    }
                    WorkerOutcome::Interrupted | WorkerOutcome::Failed(_) => {}
                }
                self.handles.remove(&exit.worker_id);
            }
            Err(e) => {
                error!(error = %e, "Worker task ended abnormally");
            }
        }
        self.prune();
    }

    /// Drop handles of instances that are no longer alive.
    fn prune(&mut self) {
        self.handles.retain(|_, handle| handle.is_alive());
        self.services.pool.rebuild(self.handles.values());

        let size = self.handles.len();
        if self.last_pool_size != Some(size) {
            debug!(pool_size = size, per_type = ?self.services.pool.snapshot(), "Worker pool size");
            self.last_pool_size = Some(size);
        }
    }

    fn live_count(&self, jobtype: &str) -> usize {
        self.handles
            .values()
            .filter(|h| h.jobtype == jobtype && h.is_alive())
            .count()
    }

    /// Interrupt every live worker and wait for them up to the drain deadline.
    pub async fn shutdown(&mut self) -> ShutdownReport {
        self.cancel.cancel();

        let drain = self
            .drain_override
            .lock()
            .take()
            .unwrap_or(Duration::from_secs(self.config.drain_timeout_secs));

        let total_workers = self.handles.values().filter(|h| h.is_alive()).count();
        info!(total_workers, ?drain, "Interrupting workers");
        for handle in self.handles.values() {
            handle.interrupt();
        }

        let mut graceful_stops = 0;
        let mut forced_terminations = 0;
        let deadline = tokio::time::Instant::now() + drain;

        while !self.tasks.is_empty() {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    let remaining = self.tasks.len();
                    warn!(remaining, "Drain deadline reached, aborting workers");
                    self.tasks.abort_all();
                    while self.tasks.join_next().await.is_some() {}
                    forced_terminations += remaining;
                    break;
                }
                result = self.tasks.join_next() => {
                    match result {
                        Some(Ok(exit)) => {
                            debug!(worker_id = %exit.worker_id, outcome = %exit.outcome, "Worker stopped");
                            graceful_stops += 1;
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "Worker task join error during shutdown");
                            forced_terminations += 1;
                        }
                        None => break,
                    }
                }
            }
        }

        self.handles.clear();
        self.services.pool.clear();

        let report = ShutdownReport {
            total_workers,
            graceful_stops,
            forced_terminations,
        };
        info!(
            total = report.total_workers,
            graceful = report.graceful_stops,
            forced = report.forced_terminations,
            "Worker manager stopped"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_config_defaults() {
        let config: ManagerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.tick_interval_ms, 1000);
        assert_eq!(config.drain_timeout_secs, 30);
    }

    #[test]
    fn test_shutdown_report() {
        let report = ShutdownReport {
            total_workers: 2,
            graceful_stops: 2,
            forced_terminations: 0,
        };
        assert!(report.all_graceful());
        assert!(!ShutdownReport {
            forced_terminations: 1,
            ..report
        }
        .all_graceful());
    }
}
