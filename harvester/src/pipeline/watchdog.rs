//! Watchdog worker.
//!
//! The queue enforces no per-job timeout. This recurring worker reclaims jobs
//! whose claim outlived any plausible run and removes staging directories
//! nobody owns anymore.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use super::dataset::remove_path;
use super::registry::{WorkerDescriptor, WorkerRegistry};
use super::worker::{Worker, WorkerContext};
use crate::Result;
use crate::database::time::now_secs;

/// Jobtype of the watchdog.
pub const WATCHDOG_JOBTYPE: &str = "watchdog";

/// Configuration for the watchdog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Seconds between sweeps.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Claims older than this are considered abandoned.
    #[serde(default = "default_stale_claim_secs")]
    pub stale_claim_secs: u64,

    /// Minimum age of a staging directory before it may be removed.
    #[serde(default = "default_orphan_grace_secs")]
    pub orphan_grace_secs: u64,
}

fn default_interval_secs() -> u64 {
    300
}

fn default_stale_claim_secs() -> u64 {
    3600 // 1 hour
}

fn default_orphan_grace_secs() -> u64 {
    3600
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            stale_claim_secs: default_stale_claim_secs(),
            orphan_grace_secs: default_orphan_grace_secs(),
        }
    }
}

impl WatchdogConfig {
    pub fn descriptor(&self) -> WorkerDescriptor {
        WorkerDescriptor::new(WATCHDOG_JOBTYPE).recurring(WATCHDOG_JOBTYPE, self.interval_secs)
    }

    pub fn register(&self, registry: &mut WorkerRegistry) -> Result<()> {
        let config = self.clone();
        registry.register(self.descriptor(), move || {
            Box::new(WatchdogWorker::new(config.clone())) as Box<dyn Worker>
        })
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub released_claims: usize,
    pub removed_staging: usize,
}

pub struct WatchdogWorker {
    config: WatchdogConfig,
}

impl WatchdogWorker {
    pub fn new(config: WatchdogConfig) -> Self {
        Self { config }
    }

    /// Release stale claims that no live worker of this process holds.
    pub async fn release_stale_claims(&self, ctx: &WorkerContext) -> Result<usize> {
        let cutoff = now_secs() - self.config.stale_claim_secs as i64;
        let pool = &ctx.services().pool;
        let mut released = 0;

        for job in ctx.queue().find_stale_claims(cutoff).await? {
            ctx.checkpoint()?;
            if pool.holds_claim(job.id) {
                continue;
            }
            warn!(
                job_id = job.id,
                jobtype = %job.jobtype,
                remote_id = %job.remote_id,
                claimed_at = job.claimed_at,
                "Releasing stale claim"
            );
            ctx.queue().release(&job, 0).await?;
            released += 1;
        }
        Ok(released)
    }

    /// Remove staging directories of deleted or finished datasets.
    pub async fn remove_orphaned_staging(&self, ctx: &WorkerContext) -> Result<usize> {
        let root = ctx.datasets().staging_root();
        let mut entries = match tokio::fs::read_dir(&root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let grace = Duration::from_secs(self.config.orphan_grace_secs);
        let mut removed = 0;

        while let Some(entry) = entries.next_entry().await? {
            ctx.checkpoint()?;
            let Ok(key) = entry.file_name().into_string() else {
                continue;
            };
            let metadata = entry.metadata().await?;
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| SystemTime::now().duration_since(modified).ok())
                .unwrap_or_default();
            if age < grace {
                continue;
            }

            let orphaned = match ctx.datasets().get(&key).await? {
                None => true,
                Some(dataset) => dataset.is_finished,
            };
            if orphaned {
                debug!(dataset_key = %key, ?age, "Removing orphaned staging directory");
                remove_path(&entry.path()).await;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub async fn sweep(&self, ctx: &WorkerContext) -> Result<SweepReport> {
        let report = SweepReport {
            released_claims: self.release_stale_claims(ctx).await?,
            removed_staging: self.remove_orphaned_staging(ctx).await?,
        };
        if report != SweepReport::default() {
            info!(
                released_claims = report.released_claims,
                removed_staging = report.removed_staging,
                "Watchdog sweep complete"
            );
        }
        Ok(report)
    }
}

#[async_trait]
impl Worker for WatchdogWorker {
    async fn work(&mut self, ctx: &WorkerContext) -> Result<()> {
        self.sweep(ctx).await.map(|_| ())
    }
}
