//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Another worker claimed the job first.
    #[error("Job {job_id} was already claimed")]
    ClaimConflict { job_id: i64 },

    /// A job for this (jobtype, remote_id) pair is already queued.
    #[error("A {jobtype} job for '{remote_id}' already exists")]
    AlreadyExists { jobtype: String, remote_id: String },

    /// Cooperative cancellation was requested.
    #[error("Interrupted")]
    Interrupted,

    #[error("Dataset {key} does not exist")]
    DatasetNotFound { key: String },

    /// A failure that is expected to go away on retry (timeouts, rate limits).
    #[error("Transient error: {0}")]
    Transient(String),

    /// A processor-level domain failure, surfaced to users as dataset status.
    #[error("{0}")]
    Processor(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn processor(msg: impl Into<String>) -> Self {
        Self::Processor(msg.into())
    }

    pub fn dataset_not_found(key: impl Into<String>) -> Self {
        Self::DatasetNotFound { key: key.into() }
    }

    /// Whether retrying the same job later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::Interrupted
            ),
            Self::DatabaseSqlx(_) => crate::database::retry::is_sqlite_busy_error(self),
            _ => false,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted)
    }
}
