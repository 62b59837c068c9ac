//! Integration tests for the job queue and dataset store.
//!
//! These run against a real file-backed SQLite database with the
//! migrations applied.

mod common;

use serde_json::json;

use harvester::Error;
use harvester::database::models::DatasetLifecycle;
use harvester::database::time::now_secs;
use harvester::pipeline::{JobSpec, NewDataset};

mod database_tests {
    use super::*;

    #[tokio::test]
    async fn test_database_migrations() {
        let env = common::setup().await;

        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .fetch_all(&env.container.pool)
                .await
                .expect("Failed to query tables");
        let table_names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();

        assert!(table_names.contains(&"jobs"), "jobs table missing");
        assert!(table_names.contains(&"datasets"), "datasets table missing");
    }

    #[tokio::test]
    async fn test_wal_mode_enabled() {
        let env = common::setup().await;

        let result: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&env.container.pool)
            .await
            .expect("Failed to query journal mode");
        assert_eq!(result.0.to_lowercase(), "wal");
    }
}

mod job_queue_tests {
    use super::*;

    #[tokio::test]
    async fn test_double_add_leaves_one_row() {
        let env = common::setup().await;
        let queue = &env.container.queue;

        let first = queue
            .add_job(JobSpec::new("scrape-thing", "42").with_details(json!({"board": "g"})))
            .await
            .unwrap();
        let second = queue
            .add_job(JobSpec::new("scrape-thing", "42").with_details(json!({"board": "v"})))
            .await
            .unwrap();

        assert!(first.is_created());
        assert!(!second.is_created());
        assert_eq!(second.job().id, first.job().id);
        assert_eq!(second.job().details, json!({"board": "g"}));
        assert_eq!(queue.get_job_count(Some("scrape-thing")).await.unwrap(), 1);

        let err = queue
            .add_job(JobSpec::new("scrape-thing", "42"))
            .await
            .unwrap()
            .into_created()
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_same_remote_id_different_type_are_distinct() {
        let env = common::setup().await;
        let queue = &env.container.queue;

        queue.add_job(JobSpec::new("scrape-thing", "42")).await.unwrap();
        queue.add_job(JobSpec::new("scrape-other", "42")).await.unwrap();
        assert_eq!(queue.get_job_count(None).await.unwrap(), 2);
    }

    /// Transient failure: the job is released with a delay and comes back
    /// with one attempt counted.
    #[tokio::test]
    async fn test_scrape_thing_release_delay() {
        let env = common::setup().await;
        let queue = &env.container.queue;

        queue
            .add_job(JobSpec::new("scrape-thing", "42").with_claim_after(0))
            .await
            .unwrap();

        let job = queue
            .get_job("scrape-thing", now_secs())
            .await
            .unwrap()
            .expect("job is eligible");
        let claimed = queue.claim(&job).await.unwrap();
        assert!(claimed.is_claimed());
        assert!(queue.get_job("scrape-thing", now_secs()).await.unwrap().is_none());

        let released_at = now_secs();
        queue.release(&claimed, 10).await.unwrap();

        for offset in [0, 5, 9] {
            assert!(
                queue
                    .get_job("scrape-thing", released_at + offset)
                    .await
                    .unwrap()
                    .is_none(),
                "eligible {offset}s after a 10s release"
            );
        }

        let again = queue
            .get_job("scrape-thing", released_at + 11)
            .await
            .unwrap()
            .expect("eligible after the delay");
        assert_eq!(again.id, job.id);
        assert_eq!(again.attempts, 1);
        assert!(!again.is_claimed());
    }

    #[tokio::test]
    async fn test_release_all_keeps_attempts() {
        let env = common::setup().await;
        let queue = &env.container.queue;

        let a = queue
            .add_job(JobSpec::new("scrape-thing", "a"))
            .await
            .unwrap()
            .into_job();
        let b = queue
            .add_job(JobSpec::new("scrape-thing", "b"))
            .await
            .unwrap()
            .into_job();

        // `a` has failed once before
        let a = queue.claim(&a).await.unwrap();
        queue.release(&a, 0).await.unwrap();
        let a = queue
            .find_job("scrape-thing", "a")
            .await
            .unwrap()
            .unwrap();
        queue.claim(&a).await.unwrap();
        queue.claim(&b).await.unwrap();

        assert_eq!(queue.release_all().await.unwrap(), 2);

        let jobs = queue.get_all_jobs(Some("scrape-thing")).await.unwrap();
        assert_eq!(jobs.len(), 2);
        for job in &jobs {
            assert!(!job.is_claimed());
            let expected = if job.remote_id == "a" { 1 } else { 0 };
            assert_eq!(job.attempts, expected, "attempts of {}", job.remote_id);
        }
        assert!(queue.get_job("scrape-thing", now_secs()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_recurring_job_is_rescheduled_on_finish() {
        let env = common::setup().await;
        let queue = &env.container.queue;

        let job = queue
            .add_job(JobSpec::new("watchdog", "watchdog").with_interval(60))
            .await
            .unwrap()
            .into_job();
        let claimed = queue.claim(&job).await.unwrap();
        queue.finish(&claimed).await.unwrap();

        let rescheduled = queue
            .find_job("watchdog", "watchdog")
            .await
            .unwrap()
            .expect("recurring job survives finish");
        assert!(!rescheduled.is_claimed());
        assert!(rescheduled.claim_after >= now_secs() + 59);
        assert!(queue.get_job("watchdog", now_secs()).await.unwrap().is_none());
    }
}

mod dataset_tests {
    use super::*;

    #[tokio::test]
    async fn test_cascade_delete_two_levels() {
        let env = common::setup().await;
        let datasets = &env.container.datasets;
        let queue = &env.container.queue;

        let root = datasets
            .create_and_queue(NewDataset::new("import-ndjson"))
            .await
            .unwrap();
        let child = datasets
            .create_and_queue(NewDataset::new("sample-rows").with_parent(&root.key))
            .await
            .unwrap();
        let grandchild = datasets
            .create_and_queue(NewDataset::new("count-values").with_parent(&child.key))
            .await
            .unwrap();
        let unrelated = datasets
            .create_and_queue(NewDataset::new("import-ndjson"))
            .await
            .unwrap();

        let result = datasets.result_path(&grandchild.key, "ndjson");
        tokio::fs::create_dir_all(result.parent().unwrap()).await.unwrap();
        tokio::fs::write(&result, b"{}\n").await.unwrap();
        datasets
            .finish(&grandchild.key, 1, Some(&result))
            .await
            .unwrap();

        let deleted = datasets.delete(&root.key).await.unwrap();
        assert!(deleted.is_deleted);

        for key in [&root.key, &child.key, &grandchild.key] {
            assert!(datasets.get(key).await.unwrap().is_none(), "{key} survived");
            assert_eq!(
                datasets.lifecycle(key).await.unwrap(),
                DatasetLifecycle::Deleted
            );
        }
        assert!(!result.exists(), "result file survived");

        let remaining = queue.get_all_jobs(None).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].remote_id, unrelated.key);
        assert!(datasets.get(&unrelated.key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_missing_dataset() {
        let env = common::setup().await;
        let err = env.container.datasets.delete("nope").await.unwrap_err();
        assert!(matches!(
            err,
            Error::DatasetNotFound { .. } | Error::NotFound { .. }
        ));
    }
}
