//! harvester library crate.
//!
//! Job queue, worker manager and dataset pipeline of the collection
//! platform. The binary in `main.rs` wires these into a daemon.

pub mod config;
pub mod control;
pub mod database;
pub mod domain;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod services;
pub mod utils;

pub use error::{Error, Result};

#[cfg(test)]
pub(crate) mod test_utils {
    use tempfile::TempDir;

    use crate::config::HarvesterConfig;
    use crate::database::{DbPool, init_pool, run_migrations};
    use crate::pipeline::WorkerServices;
    use crate::pipeline::processors::builtin_processors;
    use crate::pipeline::{SampleAndCountPreset, WorkerRegistry};
    use crate::services::ServiceContainer;

    /// A migrated database in a fresh temp dir.
    pub async fn setup_test_db() -> (TempDir, DbPool) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("test.db").display());
        let pool = init_pool(&url).await.unwrap();
        run_migrations(&pool).await.unwrap();
        (dir, pool)
    }

    /// Worker services with the built-in processors registered.
    pub async fn test_services() -> (TempDir, WorkerServices) {
        let (dir, pool) = setup_test_db().await;
        let config = HarvesterConfig {
            data_dir: dir.path().join("data"),
            ..HarvesterConfig::default()
        };
        let container = ServiceContainer::from_pool(pool, config);

        let mut registry = WorkerRegistry::new();
        for processor in builtin_processors() {
            registry.register_processor(processor).unwrap();
        }
        registry.register_preset(SampleAndCountPreset).unwrap();

        let manager = container.manager(registry);
        (dir, manager.services().clone())
    }
}
