//! Process-wide tracing setup for the daemon.
//!
//! Events go to stderr and to `<log_dir>/harvester.log.<date>`. The filter
//! sits behind a reload layer so the control API can change verbosity of a
//! running daemon.

use chrono::{Local, NaiveDate, TimeDelta};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt, reload};

use crate::{Error, Result};

/// Used when `RUST_LOG` is unset or unparsable.
pub const DEFAULT_LOG_FILTER: &str = "harvester=info,sqlx=warn";

const LOG_FILE_PREFIX: &str = "harvester.log";

/// Rolled files older than this many days are removed.
const KEEP_LOG_DAYS: i64 = 7;

const PRUNE_EVERY: Duration = Duration::from_secs(6 * 60 * 60);

struct LocalTime;

impl FormatTime for LocalTime {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
    }
}

pub type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// Live control over the installed subscriber.
pub struct LoggingConfig {
    filter: FilterHandle,
    log_dir: PathBuf,
}

impl LoggingConfig {
    pub fn get_filter(&self) -> String {
        self.filter
            .with_current(ToString::to_string)
            .unwrap_or_default()
    }

    /// Swap in a new `EnvFilter` directive such as `harvester::pipeline=trace`.
    pub fn set_filter(&self, directive: &str) -> Result<()> {
        let filter = EnvFilter::try_new(directive)
            .map_err(|e| Error::validation(format!("bad log filter {directive:?}: {e}")))?;
        self.filter
            .reload(filter)
            .map_err(|e| Error::Other(format!("log filter reload failed: {e}")))?;
        tracing::info!(%directive, "Log filter changed");
        Ok(())
    }

    /// Prune rolled log files now and then periodically until cancelled.
    pub fn start_retention_cleanup(self: &Arc<Self>, cancel: CancellationToken) {
        let dir = self.log_dir.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PRUNE_EVERY);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let today = Local::now().date_naive();
                        match prune_rolled_logs(&dir, today).await {
                            Ok(0) => {}
                            Ok(removed) => tracing::info!(removed, "Pruned old log files"),
                            Err(e) => tracing::warn!(error = %e, dir = %dir.display(), "Log pruning failed"),
                        }
                    }
                }
            }
        });
    }
}

/// Date suffix of a rolled file name, if it is one of ours.
fn rolled_date(file_name: &str) -> Option<NaiveDate> {
    let suffix = file_name.strip_prefix(LOG_FILE_PREFIX)?.strip_prefix('.')?;
    NaiveDate::parse_from_str(suffix, "%Y-%m-%d").ok()
}

async fn prune_rolled_logs(dir: &Path, today: NaiveDate) -> std::io::Result<usize> {
    let oldest_kept = today - TimeDelta::days(KEEP_LOG_DAYS);
    let mut removed = 0;
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let Some(date) = entry.file_name().to_str().and_then(rolled_date) else {
            continue;
        };
        if date >= oldest_kept || !entry.file_type().await?.is_file() {
            continue;
        }
        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => removed += 1,
            Err(e) => tracing::warn!(path = %entry.path().display(), error = %e, "Could not remove log file"),
        }
    }
    Ok(removed)
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer when dropped and must live as
/// long as the process.
pub fn init_logging(log_dir: &Path) -> Result<(Arc<LoggingConfig>, WorkerGuard)> {
    std::fs::create_dir_all(log_dir)?;

    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX));

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let (filter, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_timer(LocalTime).with_writer(std::io::stderr))
        .with(
            fmt::layer()
                .with_timer(LocalTime)
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .try_init()
        .map_err(|e| Error::Other(format!("a global subscriber is already set: {e}")))?;

    Ok((
        Arc::new(LoggingConfig {
            filter: handle,
            log_dir: log_dir.to_path_buf(),
        }),
        guard,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_dated_rolled_files_match() {
        assert_eq!(
            rolled_date("harvester.log.2026-03-01"),
            NaiveDate::from_ymd_opt(2026, 3, 1)
        );
        assert_eq!(rolled_date("harvester.log"), None);
        assert_eq!(rolled_date("harvester.logs.2026-03-01"), None);
        assert_eq!(rolled_date("other.log.2026-03-01"), None);
    }

    #[tokio::test]
    async fn prunes_files_past_retention() {
        let dir = tempfile::tempdir().unwrap();
        let today = NaiveDate::from_ymd_opt(2026, 3, 20).unwrap();
        let stale = dir.path().join("harvester.log.2026-03-01");
        let kept = dir.path().join("harvester.log.2026-03-15");
        let unrelated = dir.path().join("notes.txt");
        for path in [&stale, &kept, &unrelated] {
            tokio::fs::write(path, b"x").await.unwrap();
        }

        assert_eq!(prune_rolled_logs(dir.path(), today).await.unwrap(), 1);
        assert!(!stale.exists());
        assert!(kept.exists());
        assert!(unrelated.exists());
    }
}
