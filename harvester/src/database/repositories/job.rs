//! Job repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::JobDbModel;
use crate::database::retry::retry_on_sqlite_busy;
use crate::{Error, Result};

/// Values for a job row that does not exist yet.
#[derive(Debug, Clone)]
pub struct NewJobDbModel {
    pub jobtype: String,
    pub remote_id: String,
    pub details: String,
    pub timestamp: i64,
    pub claim_after: i64,
    pub interval: i64,
}

/// Job repository trait.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn get_job(&self, id: i64) -> Result<JobDbModel>;
    /// Insert unless a job with the same (jobtype, remote_id) exists.
    /// Returns `None` on conflict.
    async fn insert_job(&self, job: &NewJobDbModel) -> Result<Option<JobDbModel>>;
    async fn find_by_target(&self, jobtype: &str, remote_id: &str)
    -> Result<Option<JobDbModel>>;
    async fn next_eligible(&self, jobtype: &str, now: i64) -> Result<Option<JobDbModel>>;
    /// Conditional claim. Returns whether this call won the claim.
    async fn claim(&self, id: i64, now: i64) -> Result<bool>;
    async fn release(&self, id: i64, claim_after: i64) -> Result<bool>;
    /// Unclaim a recurring job and reset its attempt counter.
    async fn reschedule(&self, id: i64, claim_after: i64) -> Result<bool>;
    async fn delete_job(&self, id: i64) -> Result<bool>;
    async fn release_all(&self) -> Result<u64>;
    async fn count_jobs(&self, jobtype: Option<&str>) -> Result<i64>;
    async fn list_jobs(&self, jobtype: Option<&str>) -> Result<Vec<JobDbModel>>;
    async fn list_claimed_before(&self, claimed_before: i64) -> Result<Vec<JobDbModel>>;
}

/// SQLx implementation of JobRepository.
pub struct SqlxJobRepository {
    pool: SqlitePool,
}

impl SqlxJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepository for SqlxJobRepository {
    async fn get_job(&self, id: i64) -> Result<JobDbModel> {
        sqlx::query_as::<_, JobDbModel>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Job", id.to_string()))
    }

    async fn insert_job(&self, job: &NewJobDbModel) -> Result<Option<JobDbModel>> {
        retry_on_sqlite_busy("insert_job", || async {
            let inserted = sqlx::query_as::<_, JobDbModel>(
                r#"
                INSERT INTO jobs (jobtype, remote_id, details, timestamp, claimed, claim_after, attempts, interval)
                VALUES (?, ?, ?, ?, 0, ?, 0, ?)
                ON CONFLICT(jobtype, remote_id) DO NOTHING
                RETURNING *
                "#,
            )
            .bind(&job.jobtype)
            .bind(&job.remote_id)
            .bind(&job.details)
            .bind(job.timestamp)
            .bind(job.claim_after)
            .bind(job.interval)
            .fetch_optional(&self.pool)
            .await?;
            Ok(inserted)
        })
        .await
    }

    async fn find_by_target(
        &self,
        jobtype: &str,
        remote_id: &str,
    ) -> Result<Option<JobDbModel>> {
        let job = sqlx::query_as::<_, JobDbModel>(
            "SELECT * FROM jobs WHERE jobtype = ? AND remote_id = ?",
        )
        .bind(jobtype)
        .bind(remote_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    async fn next_eligible(&self, jobtype: &str, now: i64) -> Result<Option<JobDbModel>> {
        let job = sqlx::query_as::<_, JobDbModel>(
            r#"
            SELECT * FROM jobs
            WHERE jobtype = ? AND claimed = 0 AND claim_after <= ?
            ORDER BY timestamp ASC, id ASC
            LIMIT 1
            "#,
        )
        .bind(jobtype)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    async fn claim(&self, id: i64, now: i64) -> Result<bool> {
        retry_on_sqlite_busy("claim_job", || async {
            let result = sqlx::query("UPDATE jobs SET claimed = ? WHERE id = ? AND claimed = 0")
                .bind(now)
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn release(&self, id: i64, claim_after: i64) -> Result<bool> {
        retry_on_sqlite_busy("release_job", || async {
            let result = sqlx::query(
                "UPDATE jobs SET claimed = 0, claim_after = ?, attempts = attempts + 1 WHERE id = ?",
            )
            .bind(claim_after)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn reschedule(&self, id: i64, claim_after: i64) -> Result<bool> {
        retry_on_sqlite_busy("reschedule_job", || async {
            let result = sqlx::query(
                "UPDATE jobs SET claimed = 0, claim_after = ?, attempts = 0 WHERE id = ?",
            )
            .bind(claim_after)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn delete_job(&self, id: i64) -> Result<bool> {
        retry_on_sqlite_busy("delete_job", || async {
            let result = sqlx::query("DELETE FROM jobs WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn release_all(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE jobs SET claimed = 0 WHERE claimed != 0")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn count_jobs(&self, jobtype: Option<&str>) -> Result<i64> {
        let count: i64 = match jobtype {
            Some(jobtype) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE jobtype = ?")
                    .bind(jobtype)
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count)
    }

    async fn list_jobs(&self, jobtype: Option<&str>) -> Result<Vec<JobDbModel>> {
        let jobs = match jobtype {
            Some(jobtype) => {
                sqlx::query_as::<_, JobDbModel>(
                    "SELECT * FROM jobs WHERE jobtype = ? ORDER BY timestamp ASC, id ASC",
                )
                .bind(jobtype)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, JobDbModel>("SELECT * FROM jobs ORDER BY timestamp ASC, id ASC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(jobs)
    }

    async fn list_claimed_before(&self, claimed_before: i64) -> Result<Vec<JobDbModel>> {
        let jobs = sqlx::query_as::<_, JobDbModel>(
            "SELECT * FROM jobs WHERE claimed != 0 AND claimed < ? ORDER BY claimed ASC",
        )
        .bind(claimed_before)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }
}
