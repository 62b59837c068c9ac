//! Dataset repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::begin_immediate;
use crate::database::models::{DatasetDbModel, DatasetLinkDbModel};
use crate::database::retry::retry_on_sqlite_busy;
use crate::domain::Genealogy;
use crate::Result;

/// Bound parameters per `IN (...)` statement.
const DELETE_CHUNK_SIZE: usize = 500;

/// Rows removed by a subtree delete.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubtreeDeletion {
    pub datasets: u64,
    pub jobs: u64,
    /// The subtree as it was when the write lock was taken.
    pub removed: Vec<DatasetLinkDbModel>,
}

const SUBTREE_LINKS: &str = r#"
    WITH RECURSIVE subtree(key) AS (
        SELECT key FROM datasets WHERE key = ?
        UNION
        SELECT d.key FROM datasets d JOIN subtree s ON d.parent_key = s.key
    )
    SELECT d.key, d.parent_key, d.is_finished, d.result_file, d.parameters
    FROM datasets d JOIN subtree s ON d.key = s.key
"#;

/// Dataset repository trait.
#[async_trait]
pub trait DatasetRepository: Send + Sync {
    /// Insert a dataset. Returns false, inserting nothing, when its parent
    /// does not exist.
    async fn insert(&self, dataset: &DatasetDbModel) -> Result<bool>;
    async fn get(&self, key: &str) -> Result<Option<DatasetDbModel>>;
    /// Update a non-final status. Returns false when the status is already final.
    async fn update_status(&self, key: &str, status: &str, progress: Option<f64>) -> Result<bool>;
    /// Mark finished once. Returns false when it already was.
    async fn finish(
        &self,
        key: &str,
        num_rows: i64,
        result_file: Option<&str>,
        status: &str,
    ) -> Result<bool>;
    async fn finish_with_error(&self, key: &str, message: &str) -> Result<bool>;
    async fn list_children(&self, key: &str) -> Result<Vec<DatasetDbModel>>;
    /// The dataset and all of its descendants.
    async fn list_subtree(&self, key: &str) -> Result<Vec<DatasetLinkDbModel>>;
    /// Delete `root`, its descendants and every job whose remote_id is one of
    /// them. The subtree is read under the same write lock as the deletes.
    async fn delete_subtree(&self, root: &str) -> Result<SubtreeDeletion>;
    async fn count_created_since(&self, since: i64, roots_only: bool) -> Result<i64>;
}

/// SQLx implementation of DatasetRepository.
pub struct SqlxDatasetRepository {
    pool: SqlitePool,
}

impl SqlxDatasetRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

#[async_trait]
impl DatasetRepository for SqlxDatasetRepository {
    async fn insert(&self, dataset: &DatasetDbModel) -> Result<bool> {
        // Parent check and insert are one statement, so a concurrent subtree
        // delete either sees the child or keeps it from being created.
        let result = sqlx::query(
            r#"
            INSERT INTO datasets (
                key, type, parameters, status, status_is_final, is_finished, progress,
                num_rows, result_file, owners, parent_key, timestamp, error, is_deleted
            )
            SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?
            WHERE ? IS NULL OR EXISTS (SELECT 1 FROM datasets WHERE key = ?)
            "#,
        )
        .bind(&dataset.key)
        .bind(&dataset.dataset_type)
        .bind(&dataset.parameters)
        .bind(&dataset.status)
        .bind(dataset.status_is_final)
        .bind(dataset.is_finished)
        .bind(dataset.progress)
        .bind(dataset.num_rows)
        .bind(&dataset.result_file)
        .bind(&dataset.owners)
        .bind(&dataset.parent_key)
        .bind(dataset.timestamp)
        .bind(&dataset.error)
        .bind(dataset.is_deleted)
        .bind(&dataset.parent_key)
        .bind(&dataset.parent_key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, key: &str) -> Result<Option<DatasetDbModel>> {
        let dataset = sqlx::query_as::<_, DatasetDbModel>("SELECT * FROM datasets WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(dataset)
    }

    async fn update_status(&self, key: &str, status: &str, progress: Option<f64>) -> Result<bool> {
        retry_on_sqlite_busy("update_dataset_status", || async {
            let result = sqlx::query(
                r#"
                UPDATE datasets
                SET status = ?, progress = COALESCE(?, progress)
                WHERE key = ? AND status_is_final = 0
                "#,
            )
            .bind(status)
            .bind(progress)
            .bind(key)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn finish(
        &self,
        key: &str,
        num_rows: i64,
        result_file: Option<&str>,
        status: &str,
    ) -> Result<bool> {
        retry_on_sqlite_busy("finish_dataset", || async {
            let result = sqlx::query(
                r#"
                UPDATE datasets
                SET is_finished = 1, status_is_final = 1, status = ?, progress = 1.0,
                    num_rows = ?, result_file = COALESCE(?, result_file)
                WHERE key = ? AND is_finished = 0
                "#,
            )
            .bind(status)
            .bind(num_rows)
            .bind(result_file)
            .bind(key)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn finish_with_error(&self, key: &str, message: &str) -> Result<bool> {
        retry_on_sqlite_busy("fail_dataset", || async {
            let result = sqlx::query(
                r#"
                UPDATE datasets
                SET is_finished = 1, status_is_final = 1, status = ?, error = ?, num_rows = 0
                WHERE key = ? AND is_finished = 0
                "#,
            )
            .bind(message)
            .bind(message)
            .bind(key)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn list_children(&self, key: &str) -> Result<Vec<DatasetDbModel>> {
        let children = sqlx::query_as::<_, DatasetDbModel>(
            "SELECT * FROM datasets WHERE parent_key = ? ORDER BY timestamp ASC, key ASC",
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await?;
        Ok(children)
    }

    async fn list_subtree(&self, key: &str) -> Result<Vec<DatasetLinkDbModel>> {
        let rows = sqlx::query_as::<_, DatasetLinkDbModel>(SUBTREE_LINKS)
            .bind(key)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn delete_subtree(&self, root: &str) -> Result<SubtreeDeletion> {
        let mut tx = begin_immediate(&self.pool).await?;

        let removed = sqlx::query_as::<_, DatasetLinkDbModel>(SUBTREE_LINKS)
            .bind(root)
            .fetch_all(&mut *tx)
            .await?;
        let keys = Genealogy::build(root, removed.clone())?.deletion_order();

        let mut deletion = SubtreeDeletion::default();
        for chunk in keys.chunks(DELETE_CHUNK_SIZE) {
            let sql = format!(
                "DELETE FROM jobs WHERE remote_id IN ({})",
                placeholders(chunk.len())
            );
            let mut query = sqlx::query(&sql);
            for key in chunk {
                query = query.bind(key);
            }
            deletion.jobs += query.execute(&mut *tx).await?.rows_affected();
        }

        for chunk in keys.chunks(DELETE_CHUNK_SIZE) {
            let sql = format!(
                "DELETE FROM datasets WHERE key IN ({})",
                placeholders(chunk.len())
            );
            let mut query = sqlx::query(&sql);
            for key in chunk {
                query = query.bind(key);
            }
            deletion.datasets += query.execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        deletion.removed = removed;
        Ok(deletion)
    }

    async fn count_created_since(&self, since: i64, roots_only: bool) -> Result<i64> {
        let sql = if roots_only {
            "SELECT COUNT(*) FROM datasets WHERE timestamp >= ? AND parent_key IS NULL"
        } else {
            "SELECT COUNT(*) FROM datasets WHERE timestamp >= ?"
        };
        let count: i64 = sqlx::query_scalar(sql)
            .bind(since)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
