//! Point-in-time view of workers, jobs and datasets.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::Result;
use crate::database::time::now_secs;
use crate::pipeline::{
    DatasetService, Job, JobQueue, PoolState, WorkerRegistry, WorkerServices,
};

/// Default window for "recent" datasets and queries.
pub const DEFAULT_RECENT_WINDOW_SECS: u64 = 86_400;

/// Summary served by the control API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Live worker instances.
    pub workers: usize,
    /// Queued jobs, claimed or not.
    pub jobs: u64,
    /// Datasets created within the window.
    pub datasets: u64,
    /// Root datasets created within the window.
    pub queries: u64,
    pub recent_window_secs: u64,
    pub live_by_type: BTreeMap<String, usize>,
}

/// Per-type view of the worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerTypeStatus {
    pub jobtype: String,
    pub live: usize,
    pub max_workers: usize,
    pub perpetual: bool,
    pub queued: u64,
}

#[derive(Clone)]
pub struct Introspection {
    queue: Arc<JobQueue>,
    datasets: Arc<DatasetService>,
    registry: Arc<WorkerRegistry>,
    pool: Arc<PoolState>,
    recent_window_secs: u64,
}

impl Introspection {
    pub fn new(services: &WorkerServices) -> Self {
        Self {
            queue: services.queue.clone(),
            datasets: services.datasets.clone(),
            registry: services.registry.clone(),
            pool: services.pool.clone(),
            recent_window_secs: DEFAULT_RECENT_WINDOW_SECS,
        }
    }

    pub fn with_recent_window(mut self, secs: u64) -> Self {
        self.recent_window_secs = secs;
        self
    }

    pub async fn report(&self) -> Result<StatusReport> {
        let since = now_secs() - self.recent_window_secs as i64;
        Ok(StatusReport {
            workers: self.pool.total_live(),
            jobs: self.queue.get_job_count(None).await?,
            datasets: self.datasets.count_created_since(since, false).await?,
            queries: self.datasets.count_created_since(since, true).await?,
            recent_window_secs: self.recent_window_secs,
            live_by_type: self.pool.snapshot(),
        })
    }

    pub async fn workers(&self) -> Result<Vec<WorkerTypeStatus>> {
        let mut out = Vec::with_capacity(self.registry.len());
        for descriptor in self.registry.descriptors() {
            out.push(WorkerTypeStatus {
                jobtype: descriptor.jobtype.clone(),
                live: self.pool.live_count(&descriptor.jobtype),
                max_workers: descriptor.max_workers,
                perpetual: descriptor.perpetual,
                queued: self.queue.get_job_count(Some(&descriptor.jobtype)).await?,
            });
        }
        Ok(out)
    }

    pub async fn jobs(&self, jobtype: Option<&str>) -> Result<Vec<Job>> {
        self.queue.get_all_jobs(jobtype).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{JobSpec, NewDataset};
    use crate::test_utils::test_services;

    #[tokio::test]
    async fn test_report_counts() {
        let (_dir, services) = test_services().await;
        let root = services
            .datasets
            .create_and_queue(NewDataset::new("import-ndjson"))
            .await
            .unwrap();
        services
            .datasets
            .create(NewDataset::new("count-values").with_parent(&root.key))
            .await
            .unwrap();
        services
            .queue
            .add_job(JobSpec::new("scrape-thing", "42"))
            .await
            .unwrap();

        let report = Introspection::new(&services).report().await.unwrap();
        assert_eq!(report.workers, 0);
        assert_eq!(report.jobs, 2);
        assert_eq!(report.datasets, 2);
        assert_eq!(report.queries, 1);

        let jobs = Introspection::new(&services)
            .jobs(Some("scrape-thing"))
            .await
            .unwrap();
        assert_eq!(jobs.len(), 1);
    }
}
