//! Dataset database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::now_secs;

/// A row of the `datasets` table.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct DatasetDbModel {
    pub key: String,
    /// Processor type that produces this dataset
    #[sqlx(rename = "type")]
    pub dataset_type: String,
    /// JSON object with processor parameters
    pub parameters: String,
    pub status: String,
    /// A final status is never overwritten by progress updates
    pub status_is_final: bool,
    pub is_finished: bool,
    /// 0.0 ..= 1.0
    pub progress: f64,
    /// -1 until known
    pub num_rows: i64,
    pub result_file: Option<String>,
    /// JSON array of owner names
    pub owners: String,
    pub parent_key: Option<String>,
    pub timestamp: i64,
    pub error: Option<String>,
    pub is_deleted: bool,
}

impl DatasetDbModel {
    pub fn new(
        dataset_type: impl Into<String>,
        parameters: impl Into<String>,
        owners: impl Into<String>,
        parent_key: Option<String>,
    ) -> Self {
        Self {
            key: uuid::Uuid::new_v4().simple().to_string(),
            dataset_type: dataset_type.into(),
            parameters: parameters.into(),
            status: String::new(),
            status_is_final: false,
            is_finished: false,
            progress: 0.0,
            num_rows: -1,
            result_file: None,
            owners: owners.into(),
            parent_key,
            timestamp: now_secs(),
            error: None,
            is_deleted: false,
        }
    }
}

/// Minimal projection used to build the genealogy arena.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct DatasetLinkDbModel {
    pub key: String,
    pub parent_key: Option<String>,
    pub is_finished: bool,
    pub result_file: Option<String>,
    pub parameters: String,
}

/// Derived lifecycle of a dataset.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DatasetLifecycle {
    /// Created, no worker has picked it up.
    Pending,
    /// A job referencing it is claimed, no status streamed yet.
    Claimed,
    /// Status updates are being streamed.
    Processing,
    /// Terminal success.
    Finished,
    /// Terminal failure.
    Failed,
    /// Row removed.
    Deleted,
}

impl DatasetLifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Claimed => "CLAIMED",
            Self::Processing => "PROCESSING",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
            Self::Deleted => "DELETED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_new_dataset_defaults() {
        let ds = DatasetDbModel::new("count-posts", "{}", "[]", None);
        assert_eq!(ds.key.len(), 32);
        assert_eq!(ds.num_rows, -1);
        assert!(!ds.is_finished);
        assert!(!ds.status_is_final);
        assert!(ds.parent_key.is_none());
    }

    #[test]
    fn test_lifecycle_strings() {
        assert_eq!(DatasetLifecycle::Processing.to_string(), "PROCESSING");
        assert_eq!(
            DatasetLifecycle::from_str("FAILED").unwrap(),
            DatasetLifecycle::Failed
        );
        assert_eq!(DatasetLifecycle::Claimed.as_str(), "CLAIMED");
        assert!(DatasetLifecycle::Finished.is_terminal());
        assert!(!DatasetLifecycle::Claimed.is_terminal());
    }
}
