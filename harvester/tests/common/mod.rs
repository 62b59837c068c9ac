#![allow(dead_code)]

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use serde_json::Value;
use tempfile::TempDir;

use harvester::config::HarvesterConfig;
use harvester::pipeline::ManagerConfig;
use harvester::services::ServiceContainer;

pub struct TestEnv {
    pub dir: TempDir,
    pub container: ServiceContainer,
}

/// A file-backed, migrated database under a fresh temp dir.
pub async fn setup() -> TestEnv {
    let dir = TempDir::new().unwrap();
    let db_url = format!(
        "sqlite:{}?mode=rwc",
        dir.path().join("harvester.db").to_string_lossy().replace('\\', "/")
    );
    let config = HarvesterConfig {
        database_url: db_url,
        data_dir: dir.path().join("data"),
        log_dir: dir.path().join("logs"),
        manager: fast_manager_config(),
        ..HarvesterConfig::default()
    };
    let container = ServiceContainer::connect(config).await.unwrap();
    TestEnv { dir, container }
}

pub fn fast_manager_config() -> ManagerConfig {
    ManagerConfig {
        tick_interval_ms: 50,
        drain_timeout_secs: 5,
    }
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

pub async fn write_ndjson(path: &Path, rows: &[Value]) {
    let mut body = String::new();
    for row in rows {
        body.push_str(&row.to_string());
        body.push('\n');
    }
    tokio::fs::write(path, body).await.unwrap();
}

pub async fn read_ndjson(path: &Path) -> Vec<Value> {
    tokio::fs::read_to_string(path)
        .await
        .unwrap()
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}
