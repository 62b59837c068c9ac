//! SQLite persistence for the job queue and dataset store.
//!
//! Every process that touches the queue shares one database file. WAL
//! journaling lets introspection read while a worker holds the write lock
//! for a claim, and the busy timeout makes competing claimers wait for that
//! lock instead of erroring out.

pub mod models;
pub mod repositories;
pub mod retry;
pub mod time;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::pool::PoolConnection;
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use std::time::Duration;

pub type DbPool = Pool<Sqlite>;

/// Upper bound for the CPU-derived pool size.
const MAX_DEFAULT_CONNECTIONS: u32 = 10;

/// How long a connection waits on a locked database before giving up.
const LOCK_WAIT: Duration = Duration::from_secs(30);

/// How long a caller waits for a free pooled connection.
const ACQUIRE_WAIT: Duration = Duration::from_secs(30);

/// Pages written to the WAL before SQLite checkpoints it back.
const CHECKPOINT_PAGES: u32 = 1000;

/// Two connections per core, capped.
pub fn default_pool_size() -> u32 {
    let cores = std::thread::available_parallelism().map_or(2, |n| n.get() as u32);
    cores.saturating_mul(2).min(MAX_DEFAULT_CONNECTIONS)
}

/// Open the queue database with `max_connections` pooled connections.
///
/// The file is created when the URL allows it. Journal mode is checked once
/// after connecting since a database created by another tool may still be
/// in rollback mode.
pub async fn init_pool_with_size(
    database_url: &str,
    max_connections: u32,
) -> Result<DbPool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(LOCK_WAIT)
        .pragma("wal_autocheckpoint", CHECKPOINT_PAGES.to_string())
        .pragma("temp_store", "MEMORY");

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(ACQUIRE_WAIT)
        .connect_with(options)
        .await?;

    let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
        .fetch_one(&pool)
        .await?;
    // In-memory databases report "memory" and cannot switch.
    if !mode.eq_ignore_ascii_case("wal") && !mode.eq_ignore_ascii_case("memory") {
        tracing::warn!(%mode, "Queue database is not in WAL mode, switching");
        sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
    }

    tracing::info!(max_connections, url = %database_url, "Queue database opened");
    Ok(pool)
}

pub async fn init_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    init_pool_with_size(database_url, default_pool_size()).await
}

/// Apply the embedded `jobs`/`datasets` migrations.
pub async fn run_migrations(pool: &DbPool) -> crate::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::debug!("Queue schema is up to date");
    Ok(())
}

/// Take the write lock immediately and hand back the open transaction.
///
/// Deferred transactions start as readers and can hit `SQLITE_BUSY` when they
/// upgrade while a claim is in flight. Cascading deletes use this instead.
pub async fn begin_immediate(pool: &DbPool) -> Result<ImmediateTransaction, sqlx::Error> {
    let mut conn = pool.acquire().await?;
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
    Ok(ImmediateTransaction {
        conn,
        open: true,
    })
}

/// A connection inside a `BEGIN IMMEDIATE` block.
///
/// Dropping it without [`commit`](Self::commit) closes the connection, which
/// makes SQLite roll the work back.
pub struct ImmediateTransaction {
    conn: PoolConnection<Sqlite>,
    open: bool,
}

impl ImmediateTransaction {
    pub async fn commit(mut self) -> Result<(), sqlx::Error> {
        sqlx::query("COMMIT").execute(&mut *self.conn).await?;
        self.open = false;
        Ok(())
    }
}

impl std::ops::Deref for ImmediateTransaction {
    type Target = SqliteConnection;

    fn deref(&self) -> &SqliteConnection {
        &self.conn
    }
}

impl std::ops::DerefMut for ImmediateTransaction {
    fn deref_mut(&mut self) -> &mut SqliteConnection {
        &mut self.conn
    }
}

impl Drop for ImmediateTransaction {
    fn drop(&mut self) {
        if self.open {
            self.conn.close_on_drop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn file_url(dir: &TempDir, name: &str) -> String {
        format!(
            "sqlite:{}?mode=rwc",
            dir.path().join(name).to_string_lossy().replace('\\', "/")
        )
    }

    #[test]
    fn default_pool_size_is_bounded() {
        let size = default_pool_size();
        assert!((1..=MAX_DEFAULT_CONNECTIONS).contains(&size));
    }

    #[tokio::test]
    async fn migrated_database_is_wal_with_both_tables() {
        let dir = TempDir::new().unwrap();
        let pool = init_pool(&file_url(&dir, "queue.db")).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(mode, "wal");

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name IN ('jobs', 'datasets') ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(tables, vec!["datasets".to_string(), "jobs".to_string()]);
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let dir = TempDir::new().unwrap();
        let pool = init_pool(&file_url(&dir, "tx.db")).await.unwrap();
        run_migrations(&pool).await.unwrap();

        {
            let mut tx = begin_immediate(&pool).await.unwrap();
            sqlx::query(
                "INSERT INTO jobs (jobtype, remote_id, details, timestamp) VALUES ('t', 'r', '{}', 0)",
            )
            .execute(&mut *tx)
            .await
            .unwrap();
        }

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);

        let mut tx = begin_immediate(&pool).await.unwrap();
        sqlx::query(
            "INSERT INTO jobs (jobtype, remote_id, details, timestamp) VALUES ('t', 'r', '{}', 0)",
        )
        .execute(&mut *tx)
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
