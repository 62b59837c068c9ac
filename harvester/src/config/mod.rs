//! Process configuration.
//!
//! Values come from the environment (after loading `.env` with `dotenvy`);
//! anything unset falls back to the sub-config defaults.
//!
//! Supported env vars:
//! - `DATABASE_URL` (e.g. "sqlite:harvester.db?mode=rwc")
//! - `HARVESTER_DATA_DIR`, `HARVESTER_LOG_DIR`
//! - `HARVESTER_DB_POOL_SIZE`
//! - `HARVESTER_API_BIND` (e.g. "127.0.0.1:12556")
//! - `HARVESTER_TICK_MS`, `HARVESTER_DRAIN_SECS`
//! - `HARVESTER_STALE_CLAIM_SECS`, `HARVESTER_WATCHDOG_INTERVAL_SECS`

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use crate::control::ApiConfig;
use crate::database::default_pool_size;
use crate::domain::RetryPolicy;
use crate::pipeline::{ManagerConfig, WatchdogConfig};
use crate::{Error, Result};

fn default_database_url() -> String {
    "sqlite:harvester.db?mode=rwc".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvesterConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Root of `results/` and `staging/`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    #[serde(default = "default_pool_size")]
    pub db_pool_size: u32,

    #[serde(default)]
    pub manager: ManagerConfig,

    #[serde(default)]
    pub watchdog: WatchdogConfig,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub api: ApiConfig,
}

impl Default for HarvesterConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            data_dir: default_data_dir(),
            log_dir: default_log_dir(),
            db_pool_size: default_pool_size(),
            manager: ManagerConfig::default(),
            watchdog: WatchdogConfig::default(),
            retry: RetryPolicy::default(),
            api: ApiConfig::default(),
        }
    }
}

/// Parse `name` if set and non-empty.
fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::config(format!("{name}={raw:?} is invalid: {e}"))),
        _ => Ok(None),
    }
}

impl HarvesterConfig {
    /// Load `.env`, then read the process environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = parse_var::<String, _>(&lookup, "DATABASE_URL")? {
            config.database_url = url;
        }
        if let Some(dir) = parse_var::<PathBuf, _>(&lookup, "HARVESTER_DATA_DIR")? {
            config.data_dir = dir;
        }
        if let Some(dir) = parse_var::<PathBuf, _>(&lookup, "HARVESTER_LOG_DIR")? {
            config.log_dir = dir;
        }
        if let Some(size) = parse_var(&lookup, "HARVESTER_DB_POOL_SIZE")? {
            config.db_pool_size = size;
        }
        if let Some(bind) = parse_var::<String, _>(&lookup, "HARVESTER_API_BIND")? {
            config.api.bind = bind;
        }
        if let Some(ms) = parse_var(&lookup, "HARVESTER_TICK_MS")? {
            config.manager.tick_interval_ms = ms;
        }
        if let Some(secs) = parse_var(&lookup, "HARVESTER_DRAIN_SECS")? {
            config.manager.drain_timeout_secs = secs;
        }
        if let Some(secs) = parse_var(&lookup, "HARVESTER_STALE_CLAIM_SECS")? {
            config.watchdog.stale_claim_secs = secs;
        }
        if let Some(secs) = parse_var(&lookup, "HARVESTER_WATCHDOG_INTERVAL_SECS")? {
            config.watchdog.interval_secs = secs;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            return Err(Error::config("database URL must not be empty"));
        }
        if self.db_pool_size == 0 {
            return Err(Error::config("database pool size must be positive"));
        }
        if self.manager.tick_interval_ms == 0 {
            return Err(Error::config("manager tick interval must be positive"));
        }
        if self.watchdog.interval_secs == 0 {
            return Err(Error::config("watchdog interval must be positive"));
        }
        if self.watchdog.stale_claim_secs == 0 {
            return Err(Error::config("stale claim threshold must be positive"));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(Error::config("retry backoff multiplier must be at least 1"));
        }
        SocketAddr::from_str(&self.api.bind).map_err(|e| {
            Error::config(format!("API bind address {:?} is invalid: {e}", self.api.bind))
        })?;
        Ok(())
    }

    /// File holding the pid of a running daemon.
    pub fn pid_file(&self) -> PathBuf {
        self.data_dir.join("harvester.pid")
    }
}
