//! Dataset service.
//!
//! Owns the dataset state machine on top of the dataset repository: creation,
//! status streaming, terminal transitions, result files, the genealogy and
//! cascade deletion.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::job_queue::{AddJobOutcome, JobQueue, JobSpec};
use crate::database::models::{DatasetDbModel, DatasetLifecycle};
use crate::database::repositories::DatasetRepository;
use crate::domain::Genealogy;
use crate::utils::json::{self, JsonContext};
use crate::{Error, Result};

/// Status written when a dataset completes successfully.
pub const STATUS_FINISHED: &str = "Finished";

/// A dataset as seen by processors and callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub key: String,
    pub dataset_type: String,
    pub parameters: Map<String, Value>,
    pub status: String,
    pub status_is_final: bool,
    pub is_finished: bool,
    pub progress: f64,
    pub num_rows: i64,
    pub result_file: Option<String>,
    pub owners: Vec<String>,
    pub parent_key: Option<String>,
    /// Unix seconds.
    pub timestamp: i64,
    pub error: Option<String>,
    /// Only ever true on the value returned by [`DatasetService::delete`].
    pub is_deleted: bool,
}

impl Dataset {
    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name)
    }

    /// Key of the dataset this one copies its result into.
    pub fn attach_to(&self) -> Option<&str> {
        self.parameters.get("attach_to").and_then(Value::as_str)
    }

    /// The dataset waiting on this one's pipeline: its own `attach_to`, or
    /// the `attach_to` of a step anywhere in the `next` steps it carries.
    pub fn pipeline_origin(&self) -> Option<&str> {
        self.attach_to()
            .or_else(|| self.parameters.get("next").and_then(attach_target_in))
    }

    pub fn is_root(&self) -> bool {
        self.parent_key.is_none()
    }

    pub fn result_path(&self) -> Option<PathBuf> {
        self.result_file.as_ref().map(PathBuf::from)
    }
}

fn attach_target_in(steps: &Value) -> Option<&str> {
    steps.as_array()?.iter().find_map(|step| {
        step.get("parameters")
            .and_then(|parameters| parameters.get("attach_to"))
            .and_then(Value::as_str)
            .or_else(|| step.get("next").and_then(attach_target_in))
    })
}

impl From<DatasetDbModel> for Dataset {
    fn from(model: DatasetDbModel) -> Self {
        let parameters = json::parse_or_default(
            &model.parameters,
            JsonContext::DatasetField {
                dataset_key: &model.key,
                field: "parameters",
            },
            "Failed to parse dataset parameters",
        );
        let owners = json::parse_or_default(
            &model.owners,
            JsonContext::DatasetField {
                dataset_key: &model.key,
                field: "owners",
            },
            "Failed to parse dataset owners",
        );
        Self {
            key: model.key,
            dataset_type: model.dataset_type,
            parameters,
            status: model.status,
            status_is_final: model.status_is_final,
            is_finished: model.is_finished,
            progress: model.progress,
            num_rows: model.num_rows,
            result_file: model.result_file,
            owners,
            parent_key: model.parent_key,
            timestamp: model.timestamp,
            error: model.error,
            is_deleted: model.is_deleted,
        }
    }
}

/// Input for [`DatasetService::create`].
#[derive(Debug, Clone, Default)]
pub struct NewDataset {
    pub dataset_type: String,
    pub parameters: Map<String, Value>,
    pub owners: Vec<String>,
    pub parent_key: Option<String>,
}

impl NewDataset {
    pub fn new(dataset_type: impl Into<String>) -> Self {
        Self {
            dataset_type: dataset_type.into(),
            ..Default::default()
        }
    }

    pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }

    pub fn with_owners(mut self, owners: Vec<String>) -> Self {
        self.owners = owners;
        self
    }

    pub fn with_parent(mut self, parent_key: impl Into<String>) -> Self {
        self.parent_key = Some(parent_key.into());
        self
    }
}

/// The dataset service.
pub struct DatasetService {
    repository: Arc<dyn DatasetRepository>,
    queue: Arc<JobQueue>,
    data_dir: PathBuf,
}

impl DatasetService {
    pub fn new(
        repository: Arc<dyn DatasetRepository>,
        queue: Arc<JobQueue>,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            repository,
            queue,
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn results_dir(&self) -> PathBuf {
        self.data_dir.join("results")
    }

    pub fn staging_root(&self) -> PathBuf {
        self.data_dir.join("staging")
    }

    /// Final location of a dataset's result.
    pub fn result_path(&self, key: &str, extension: &str) -> PathBuf {
        self.results_dir().join(format!("{key}.{extension}"))
    }

    /// Staging directory owned by the processor of `key`.
    pub fn staging_path(&self, key: &str) -> PathBuf {
        self.staging_root().join(key)
    }

    pub async fn create(&self, new: NewDataset) -> Result<Dataset> {
        if new.dataset_type.trim().is_empty() {
            return Err(Error::validation("dataset type must not be empty"));
        }

        let parameters = serde_json::to_string(&new.parameters)?;
        let owners = serde_json::to_string(&new.owners)?;
        let model = DatasetDbModel::new(&new.dataset_type, parameters, owners, new.parent_key);
        if !self.repository.insert(&model).await? {
            let parent = model.parent_key.as_deref().unwrap_or_default();
            return Err(Error::dataset_not_found(parent));
        }

        debug!(
            dataset_key = %model.key,
            dataset_type = %model.dataset_type,
            parent_key = ?model.parent_key,
            "Dataset created"
        );
        Ok(Dataset::from(model))
    }

    /// Create the processing job for a dataset.
    pub async fn queue(&self, dataset: &Dataset) -> Result<AddJobOutcome> {
        self.queue
            .add_job(JobSpec::new(&dataset.dataset_type, &dataset.key))
            .await
    }

    pub async fn create_and_queue(&self, new: NewDataset) -> Result<Dataset> {
        let dataset = self.create(new).await?;
        self.queue(&dataset).await?;
        Ok(dataset)
    }

    pub async fn get(&self, key: &str) -> Result<Option<Dataset>> {
        Ok(self.repository.get(key).await?.map(Dataset::from))
    }

    pub async fn require(&self, key: &str) -> Result<Dataset> {
        self.get(key)
            .await?
            .ok_or_else(|| Error::dataset_not_found(key))
    }

    /// Stream a non-final status. Ignored once the status is final.
    pub async fn update_status(
        &self,
        key: &str,
        message: &str,
        progress: Option<f64>,
    ) -> Result<bool> {
        let progress = progress.map(|p| p.clamp(0.0, 1.0));
        let updated = self.repository.update_status(key, message, progress).await?;
        if !updated {
            debug!(dataset_key = %key, "Status update ignored, status is final");
        }
        Ok(updated)
    }

    /// Terminal success. Returns false when the dataset was already finished.
    pub async fn finish(&self, key: &str, num_rows: i64, result_file: Option<&Path>) -> Result<bool> {
        let result_file = result_file.map(|p| p.to_string_lossy().into_owned());
        let finished = self
            .repository
            .finish(key, num_rows, result_file.as_deref(), STATUS_FINISHED)
            .await?;
        if finished {
            info!(dataset_key = %key, num_rows, "Dataset finished");
        } else {
            debug!(dataset_key = %key, "Dataset was already finished");
        }
        Ok(finished)
    }

    /// Terminal failure, surfaced to users as the dataset status.
    pub async fn finish_with_error(&self, key: &str, message: &str) -> Result<bool> {
        let finished = self.repository.finish_with_error(key, message).await?;
        if finished {
            warn!(dataset_key = %key, error = %message, "Dataset failed");
        }
        Ok(finished)
    }

    /// Fail `dataset` and the pipeline origin waiting on it, if any.
    ///
    /// The origin is failed even when `dataset` already was, so a step that
    /// failed before its origin was notified can be settled again.
    pub async fn fail_in_pipeline(&self, dataset: &Dataset, message: &str) -> Result<bool> {
        let failed = self.finish_with_error(&dataset.key, message).await?;
        if let Some(origin) = dataset.pipeline_origin().filter(|o| *o != dataset.key) {
            let notice = format!("Pipeline step {} failed: {message}", dataset.dataset_type);
            if self.finish_with_error(origin, &notice).await? {
                debug!(dataset_key = %dataset.key, origin = %origin, "Pipeline failure passed to origin");
            }
        }
        Ok(failed)
    }

    /// Finish the origin a finished sink attaches to with the sink's result.
    ///
    /// Returns false when there is nothing to do: no `attach_to`, or an
    /// origin that is gone or already finished.
    pub async fn attach_to_origin(&self, dataset: &Dataset) -> Result<bool> {
        let Some(target) = dataset.attach_to().filter(|t| *t != dataset.key) else {
            return Ok(false);
        };
        match self.get(target).await? {
            Some(origin) if !origin.is_finished => {}
            _ => return Ok(false),
        }

        debug!(dataset_key = %dataset.key, target = %target, "Attaching result to pipeline origin");
        match dataset.result_path() {
            Some(path) => self.attach_result(target, &path, dataset.num_rows).await,
            None => self.finish(target, dataset.num_rows, None).await,
        }
    }

    /// Copy `source_result` into the result location of `target` and finish it.
    pub async fn attach_result(
        &self,
        target: &str,
        source_result: &Path,
        num_rows: i64,
    ) -> Result<bool> {
        self.require(target).await?;

        let extension = source_result
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("ndjson");
        let destination = self.result_path(target, extension);
        tokio::fs::create_dir_all(self.results_dir()).await?;
        tokio::fs::copy(source_result, &destination).await?;

        debug!(
            dataset_key = %target,
            source = %source_result.display(),
            "Attached pipeline result"
        );
        self.finish(target, num_rows, Some(&destination)).await
    }

    pub async fn children(&self, key: &str) -> Result<Vec<Dataset>> {
        Ok(self
            .repository
            .list_children(key)
            .await?
            .into_iter()
            .map(Dataset::from)
            .collect())
    }

    pub async fn genealogy(&self, key: &str) -> Result<Genealogy> {
        let links = self.repository.list_subtree(key).await?;
        Genealogy::build(key, links)
    }

    /// Nearest ancestor that has a result file.
    pub async fn source_dataset(&self, dataset: &Dataset) -> Result<Option<Dataset>> {
        let mut next = dataset.parent_key.clone();
        let mut seen = vec![dataset.key.clone()];
        while let Some(key) = next {
            if seen.contains(&key) {
                break;
            }
            let Some(ancestor) = self.get(&key).await? else {
                break;
            };
            if ancestor.result_file.is_some() {
                return Ok(Some(ancestor));
            }
            seen.push(key);
            next = ancestor.parent_key;
        }
        Ok(None)
    }

    /// Derive the lifecycle state from the row and its processing job.
    pub async fn lifecycle(&self, key: &str) -> Result<DatasetLifecycle> {
        let Some(dataset) = self.get(key).await? else {
            return Ok(DatasetLifecycle::Deleted);
        };
        if dataset.is_finished {
            return Ok(if dataset.error.is_some() {
                DatasetLifecycle::Failed
            } else {
                DatasetLifecycle::Finished
            });
        }

        let job = self.queue.find_job(&dataset.dataset_type, key).await?;
        let state = match job {
            Some(job) if job.is_claimed() => {
                if dataset.status.is_empty() {
                    DatasetLifecycle::Claimed
                } else {
                    DatasetLifecycle::Processing
                }
            }
            Some(_) => DatasetLifecycle::Pending,
            // Job done but the row is not: waiting on a pipeline below it
            None if !dataset.status.is_empty() => DatasetLifecycle::Processing,
            None => DatasetLifecycle::Pending,
        };
        Ok(state)
    }

    /// Finished, and not waiting on descendants unless it is a pipeline sink.
    pub async fn is_done(&self, key: &str) -> Result<bool> {
        let dataset = self.require(key).await?;
        if !dataset.is_finished {
            return Ok(false);
        }
        let genealogy = self.genealogy(key).await?;
        Ok(genealogy.is_sink() || !genealogy.has_unfinished_descendants())
    }

    /// Delete a dataset with all of its descendants, their jobs and files.
    pub async fn delete(&self, key: &str) -> Result<Dataset> {
        let mut dataset = self.require(key).await?;
        let deletion = self.repository.delete_subtree(key).await?;

        for link in &deletion.removed {
            if let Some(result_file) = &link.result_file {
                remove_path(Path::new(result_file)).await;
            }
            remove_path(&self.staging_path(&link.key)).await;
        }

        info!(
            dataset_key = %key,
            datasets = deletion.datasets,
            jobs = deletion.jobs,
            "Dataset deleted"
        );
        dataset.is_deleted = true;
        Ok(dataset)
    }

    /// Datasets created at or after `since`; roots only when `roots_only`.
    pub async fn count_created_since(&self, since: i64, roots_only: bool) -> Result<u64> {
        Ok(self
            .repository
            .count_created_since(since, roots_only)
            .await?
            .max(0) as u64)
    }
}

/// Remove a file or directory, ignoring paths that are already gone.
pub(crate) async fn remove_path(path: &Path) {
    let result = match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "Failed to remove dataset file");
    }
}
