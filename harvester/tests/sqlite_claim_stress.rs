use dashmap::DashSet;
use rand::random;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinSet;

use harvester::Error;
use harvester::database::repositories::SqlxJobRepository;
use harvester::database::time::now_secs;
use harvester::database::{DbPool, run_migrations};
use harvester::pipeline::{JobQueue, JobSpec};

async fn init_stress_pool(database_url: &str) -> DbPool {
    let connect_options = SqliteConnectOptions::from_str(database_url)
        .unwrap()
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        // Make SQLITE_BUSY surface quickly so retry logic is exercised.
        .busy_timeout(Duration::from_millis(1))
        .foreign_keys(true)
        .create_if_missing(true);

    SqlitePoolOptions::new()
        .max_connections(32)
        .acquire_timeout(Duration::from_secs(30))
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                sqlx::query("PRAGMA busy_timeout = 1")
                    .execute(&mut *conn)
                    .await?;
                sqlx::query("PRAGMA wal_autocheckpoint = 100")
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            })
        })
        .connect_with(connect_options)
        .await
        .unwrap()
}

async fn stress_queue(dir: &TempDir) -> (DbPool, Arc<JobQueue>) {
    let db_path = dir.path().join("stress.db");
    let db_url = format!(
        "sqlite:{}?mode=rwc",
        db_path.to_string_lossy().replace('\\', "/")
    );

    let pool = init_stress_pool(&db_url).await;
    run_migrations(&pool).await.unwrap();

    let repo = Arc::new(SqlxJobRepository::new(pool.clone()));
    (pool, Arc::new(JobQueue::new(repo)))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_claims_of_one_job_have_exactly_one_winner() {
    const CLAIMERS: usize = 16;

    let dir = TempDir::new().unwrap();
    let (_pool, queue) = stress_queue(&dir).await;
    let job = queue
        .add_job(JobSpec::new("scrape-thing", "42"))
        .await
        .unwrap()
        .into_job();

    let mut claimers = JoinSet::new();
    for _ in 0..CLAIMERS {
        let queue = queue.clone();
        let job = job.clone();
        claimers.spawn(async move { queue.claim(&job).await });
    }

    let mut won = 0;
    let mut conflicts = 0;
    while let Some(result) = claimers.join_next().await {
        match result.unwrap() {
            Ok(claimed) => {
                assert_eq!(claimed.id, job.id);
                won += 1;
            }
            Err(Error::ClaimConflict { job_id }) => {
                assert_eq!(job_id, job.id);
                conflicts += 1;
            }
            Err(e) => panic!("unexpected claim error: {e}"),
        }
    }

    assert_eq!(won, 1);
    assert_eq!(conflicts, CLAIMERS - 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore = "stress test; run explicitly to validate SQLite claim correctness under contention"]
async fn sqlite_claim_stress_no_double_claims_or_lost_finishes() {
    const JOBS: usize = 300;
    const WORKERS: usize = 24;

    let dir = TempDir::new().unwrap();
    let (pool, queue) = stress_queue(&dir).await;

    for i in 0..JOBS {
        queue
            .add_job(JobSpec::new("count-values", format!("dataset-{i}")))
            .await
            .unwrap()
            .into_created()
            .unwrap();
    }

    // Background writer that periodically holds the write lock briefly to force SQLITE_BUSY.
    let locker_pool = pool.clone();
    let locker = tokio::spawn(async move {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while tokio::time::Instant::now() < deadline {
            if let Ok(mut tx) = locker_pool.begin().await {
                let _ = sqlx::query(
                    "UPDATE jobs SET details = details WHERE id IN (SELECT id FROM jobs LIMIT 1)",
                )
                .execute(&mut *tx)
                .await;
                tokio::time::sleep(Duration::from_millis(5)).await;
                let _ = tx.commit().await;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    });

    let claimed_ids = Arc::new(DashSet::<i64>::new());

    let mut workers = JoinSet::new();
    for _ in 0..WORKERS {
        let queue = queue.clone();
        let claimed_ids = claimed_ids.clone();
        workers.spawn(async move {
            loop {
                match queue.get_job("count-values", now_secs()).await.unwrap() {
                    Some(job) => {
                        let claimed = match queue.claim(&job).await {
                            Ok(claimed) => claimed,
                            Err(Error::ClaimConflict { .. }) => continue,
                            Err(e) => panic!("claim failed: {e}"),
                        };
                        let inserted = claimed_ids.insert(claimed.id);
                        assert!(inserted, "double-claimed job {}", claimed.id);

                        // Add a tiny jitter to increase interleavings.
                        if random::<u8>().is_multiple_of(3) {
                            tokio::task::yield_now().await;
                        } else {
                            tokio::time::sleep(Duration::from_millis(random::<u64>() % 3)).await;
                        }

                        queue.finish(&claimed).await.unwrap();
                    }
                    None => {
                        // Other workers may still hold claims; only stop once the table is empty.
                        if queue.get_job_count(Some("count-values")).await.unwrap() == 0 {
                            break;
                        }
                        tokio::task::yield_now().await;
                    }
                }
            }
        });
    }

    let joined = tokio::time::timeout(Duration::from_secs(30), async {
        while workers.join_next().await.is_some() {}
    })
    .await;
    assert!(joined.is_ok(), "workers timed out (possible deadlock)");

    let _ = locker.await;

    assert_eq!(claimed_ids.len(), JOBS, "not all jobs were claimed");
    assert_eq!(queue.get_job_count(None).await.unwrap(), 0, "jobs remain queued");
}
