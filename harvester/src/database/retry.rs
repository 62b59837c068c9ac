//! Retrying queue writes that lose the SQLite write lock.
//!
//! The busy timeout covers most contention between claimers. A statement can
//! still fail with `SQLITE_BUSY` when a WAL checkpoint or a long cascade
//! delete holds the lock past it, so single-statement writes go through
//! [`retry_on_sqlite_busy`].

use std::future::Future;
use std::time::Duration;

use crate::{Error, Result};

const MAX_BUSY_RETRIES: u32 = 12;
const FIRST_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

fn mentions_lock(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("database is locked") || message.contains("database is busy")
}

pub(crate) fn is_sqlite_busy_error(err: &Error) -> bool {
    match err {
        Error::DatabaseSqlx(sqlx::Error::Database(db)) => {
            // SQLITE_BUSY and SQLITE_LOCKED
            db.code().is_some_and(|code| matches!(code.as_ref(), "5" | "6"))
                || mentions_lock(db.message())
        }
        Error::DatabaseSqlx(other) => mentions_lock(&other.to_string()),
        _ => false,
    }
}

/// Backoff before retry number `retry` (0-based): doubling, capped, with up to
/// a quarter added as jitter.
fn busy_backoff(retry: u32) -> Duration {
    let base = FIRST_BACKOFF
        .saturating_mul(1u32 << retry.min(16))
        .min(MAX_BACKOFF);
    let jitter = base.mul_f64(0.25 * rand::random::<f64>());
    (base + jitter).min(MAX_BACKOFF)
}

/// Run `op` again while it fails because the database is locked.
pub async fn retry_on_sqlite_busy<T, F, Fut>(op_name: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retry = 0;
    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if retry >= MAX_BUSY_RETRIES || !is_sqlite_busy_error(&err) {
            return Err(err);
        }
        let delay = busy_backoff(retry);
        retry += 1;
        tracing::debug!(op = op_name, retry, ?delay, "Queue database locked, retrying");
        tokio::time::sleep(delay).await;
    }
}
