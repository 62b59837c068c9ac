//! Per-run context handed to a processor.

use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::traits::{ProcessorOption, apply_option_defaults, check_option_kinds};
use crate::pipeline::dataset::{Dataset, DatasetService, remove_path};
use crate::pipeline::worker::WorkerServices;
use crate::{Error, Result};

/// Terminal call made by a processor.
#[derive(Debug, Clone, PartialEq)]
pub enum Terminal {
    Finished { num_rows: i64 },
    Failed { message: String },
}

impl Terminal {
    fn label(&self) -> &'static str {
        match self {
            Self::Finished { .. } => "finished",
            Self::Failed { .. } => "failed",
        }
    }
}

/// State and calls available to [`super::Processor::process`].
pub struct ProcessorContext {
    dataset: Dataset,
    parameters: Map<String, Value>,
    source: Option<Dataset>,
    staging_dir: PathBuf,
    extension: String,
    services: WorkerServices,
    cancel: CancellationToken,
    terminal: Option<Terminal>,
    deferred: bool,
}

impl ProcessorContext {
    /// Resolve the parameters and prepare a clean staging directory.
    ///
    /// Fails with [`Error::Validation`] when a parameter has the wrong kind
    /// for an option the processor declares.
    pub async fn new(
        services: WorkerServices,
        cancel: CancellationToken,
        dataset: Dataset,
        source: Option<Dataset>,
        extension: &str,
        options: &[ProcessorOption],
    ) -> Result<Self> {
        let mut parameters = dataset.parameters.clone();
        apply_option_defaults(options, &mut parameters);
        check_option_kinds(options, &parameters)?;

        let staging_dir = services.datasets.staging_path(&dataset.key);
        // Leftovers of an interrupted run are never reused
        remove_path(&staging_dir).await;
        tokio::fs::create_dir_all(&staging_dir).await?;

        Ok(Self {
            dataset,
            parameters,
            source,
            staging_dir,
            extension: extension.to_string(),
            services,
            cancel,
            terminal: None,
            deferred: false,
        })
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn key(&self) -> &str {
        &self.dataset.key
    }

    /// Dataset parameters with option defaults applied.
    pub fn parameters(&self) -> &Map<String, Value> {
        &self.parameters
    }

    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name)
    }

    pub fn parameter_str(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).and_then(Value::as_str)
    }

    pub fn parameter_i64(&self, name: &str) -> Option<i64> {
        self.parameters.get(name).and_then(Value::as_i64)
    }

    /// Nearest ancestor with a result file.
    pub fn source_dataset(&self) -> Option<&Dataset> {
        self.source.as_ref()
    }

    /// Result file of the source dataset.
    pub fn source_file(&self) -> Result<PathBuf> {
        self.source
            .as_ref()
            .and_then(Dataset::result_path)
            .ok_or_else(|| {
                Error::processor(format!(
                    "{} needs a source dataset with a result",
                    self.dataset.dataset_type
                ))
            })
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Where the result is written before `finish` commits it.
    pub fn staged_result_path(&self) -> PathBuf {
        self.staging_dir.join(format!("result.{}", self.extension))
    }

    pub fn datasets(&self) -> &Arc<DatasetService> {
        &self.services.datasets
    }

    pub fn services(&self) -> &WorkerServices {
        &self.services
    }

    pub fn is_interrupted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Interrupted)
        } else {
            Ok(())
        }
    }

    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Interrupted),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Stream a non-final status.
    pub async fn update_status(&self, message: &str, progress: Option<f64>) -> Result<()> {
        self.services
            .datasets
            .update_status(&self.dataset.key, message, progress)
            .await?;
        Ok(())
    }

    fn ensure_open(&self, to: &str) -> Result<()> {
        match &self.terminal {
            Some(terminal) => Err(Error::InvalidStateTransition {
                from: terminal.label().to_string(),
                to: to.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Terminal success: commit the staged result.
    ///
    /// Handing the result on (`attach_to`, `next`) happens after `process`
    /// returns, so it can be retried without running the processor again.
    pub async fn finish(&mut self, num_rows: i64) -> Result<()> {
        self.ensure_open("finished")?;
        let datasets = self.services.datasets.clone();
        let key = self.dataset.key.clone();

        let staged = self.staged_result_path();
        let result = if tokio::fs::try_exists(&staged).await? {
            let destination = datasets.result_path(&key, &self.extension);
            tokio::fs::create_dir_all(datasets.results_dir()).await?;
            tokio::fs::rename(&staged, &destination).await?;
            Some(destination)
        } else {
            None
        };

        datasets.finish(&key, num_rows, result.as_deref()).await?;
        self.terminal = Some(Terminal::Finished { num_rows });
        self.dataset.is_finished = true;
        self.dataset.num_rows = num_rows;
        self.dataset.result_file = result
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned());
        self.discard_staging().await;
        Ok(())
    }

    /// Terminal failure, shown to users as the dataset status.
    ///
    /// A pipeline origin waiting on this dataset fails with it.
    pub async fn finish_with_error(&mut self, message: &str) -> Result<()> {
        self.ensure_open("failed")?;
        self.services
            .datasets
            .fail_in_pipeline(&self.dataset, message)
            .await?;
        self.terminal = Some(Terminal::Failed {
            message: message.to_string(),
        });
        self.dataset.is_finished = true;
        self.discard_staging().await;
        Ok(())
    }

    /// Leave the dataset open after `process` returns; something else finishes it.
    pub fn defer_completion(&mut self) {
        self.deferred = true;
    }

    pub fn is_deferred(&self) -> bool {
        self.deferred
    }

    pub fn terminal(&self) -> Option<&Terminal> {
        self.terminal.as_ref()
    }

    pub(crate) async fn discard_staging(&self) {
        remove_path(&self.staging_dir).await;
    }
}
