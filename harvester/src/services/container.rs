//! Service container for dependency injection.
//!
//! The ServiceContainer opens the database, wires the queue and dataset
//! services to their repositories, and builds the worker registry the
//! daemon runs with.

use std::sync::Arc;

use sqlx::SqlitePool;
use tracing::info;

use crate::Result;
use crate::config::HarvesterConfig;
use crate::database::repositories::{SqlxDatasetRepository, SqlxJobRepository};
use crate::database::{init_pool_with_size, run_migrations};
use crate::logging::LoggingConfig;
use crate::pipeline::processors::builtin_processors;
use crate::pipeline::{DatasetService, JobQueue, SampleAndCountPreset, WorkerManager, WorkerRegistry};

/// Service container holding the shared services.
pub struct ServiceContainer {
    /// Database connection pool.
    pub pool: SqlitePool,
    pub config: HarvesterConfig,
    pub queue: Arc<JobQueue>,
    pub datasets: Arc<DatasetService>,
}

impl ServiceContainer {
    /// Open the database, apply migrations and build the services.
    pub async fn connect(config: HarvesterConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;

        let pool = init_pool_with_size(&config.database_url, config.db_pool_size).await?;
        run_migrations(&pool).await?;

        Ok(Self::from_pool(pool, config))
    }

    /// Build the services on an already migrated pool.
    pub fn from_pool(pool: SqlitePool, config: HarvesterConfig) -> Self {
        let job_repo = Arc::new(SqlxJobRepository::new(pool.clone()));
        let dataset_repo = Arc::new(SqlxDatasetRepository::new(pool.clone()));

        let queue = Arc::new(JobQueue::new(job_repo).with_retry_policy(config.retry.clone()));
        let datasets = Arc::new(DatasetService::new(
            dataset_repo,
            queue.clone(),
            config.data_dir.clone(),
        ));

        info!(data_dir = %config.data_dir.display(), "Service container initialized");

        Self {
            pool,
            config,
            queue,
            datasets,
        }
    }

    /// Registry with the built-in processors, presets, the watchdog and the
    /// control API.
    pub fn registry(&self, logging: Option<Arc<LoggingConfig>>) -> Result<WorkerRegistry> {
        let mut registry = WorkerRegistry::new();
        for processor in builtin_processors() {
            registry.register_processor(processor)?;
        }
        registry.register_preset(SampleAndCountPreset)?;
        self.config.watchdog.register(&mut registry)?;
        self.config.api.register(&mut registry, logging)?;
        Ok(registry)
    }

    /// A manager over `registry` sharing this container's services.
    pub fn manager(&self, registry: WorkerRegistry) -> WorkerManager {
        WorkerManager::new(
            self.config.manager.clone(),
            self.queue.clone(),
            self.datasets.clone(),
            registry,
        )
    }

    /// Close the pool once the manager has drained.
    pub async fn shutdown(&self) {
        self.pool.close().await;
        info!("Service container shut down");
    }
}
