//! Worker adapter that runs a [`Processor`] against the dataset named by its job.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::context::{ProcessorContext, Terminal};
use super::traits::Processor;
use crate::pipeline::dataset::{Dataset, remove_path};
use crate::pipeline::job_queue::RetryDecision;
use crate::pipeline::preset::materialize_next;
use crate::pipeline::worker::{Worker, WorkerContext};
use crate::{Error, Result};

/// Status left on a dataset whose processor was interrupted.
pub const STATUS_INTERRUPTED: &str = "Interrupted, will resume";

pub struct ProcessorWorker {
    processor: Arc<dyn Processor>,
}

impl ProcessorWorker {
    pub fn new(processor: Arc<dyn Processor>) -> Self {
        Self { processor }
    }

    async fn prepare(&self, ctx: &WorkerContext, dataset: Dataset) -> Result<ProcessorContext> {
        let source = ctx.datasets().source_dataset(&dataset).await?;
        let options = self.processor.options();
        ProcessorContext::new(
            ctx.services().clone(),
            ctx.cancellation_token().clone(),
            dataset,
            source,
            self.processor.result_extension(),
            &options,
        )
        .await
    }

    /// Settle an error raised before the processor got to run.
    async fn settle_setup_error(
        &self,
        ctx: &WorkerContext,
        dataset: &Dataset,
        error: Error,
    ) -> Result<()> {
        let datasets = ctx.datasets();
        remove_path(&datasets.staging_path(&dataset.key)).await;
        match error {
            Error::Interrupted => Err(Error::Interrupted),
            e if e.is_transient() => {
                if let Some(RetryDecision::GaveUp) = ctx.retry_or_give_up(&e).await? {
                    datasets.fail_in_pipeline(dataset, &e.to_string()).await?;
                }
                Err(e)
            }
            e => {
                let message = format!(
                    "Could not start {}: {e}",
                    self.processor.processor_type()
                );
                datasets.fail_in_pipeline(dataset, &message).await?;
                Err(e)
            }
        }
    }

    /// Hand a finished dataset's result on: finish the origin it attaches to
    /// and queue the `next` steps it carries. Safe to repeat.
    async fn continue_pipeline(&self, ctx: &WorkerContext, dataset: &Dataset) -> Result<()> {
        let datasets = ctx.datasets();
        let handoff = async {
            datasets.attach_to_origin(dataset).await?;
            materialize_next(datasets, dataset).await
        }
        .await;

        match handoff {
            Ok(children) => {
                if !children.is_empty() {
                    debug!(dataset_key = %dataset.key, children = children.len(), "Queued next pipeline steps");
                }
                Ok(())
            }
            // The job comes back and the rerun picks up where this stopped
            Err(e) if e.is_transient() => {
                if let Some(RetryDecision::GaveUp) = ctx.retry_or_give_up(&e).await? {
                    datasets.fail_in_pipeline(dataset, &e.to_string()).await?;
                }
                Err(e)
            }
            Err(Error::DatasetNotFound { key: missing }) => {
                warn!(
                    dataset_key = %dataset.key,
                    missing = %missing,
                    "Pipeline branch references a deleted dataset, abandoning it"
                );
                Ok(())
            }
            Err(e) => {
                let message = format!("Could not continue pipeline: {e}");
                datasets.fail_in_pipeline(dataset, &message).await?;
                Err(e)
            }
        }
    }

    async fn settle(
        &self,
        ctx: &WorkerContext,
        pctx: &mut ProcessorContext,
        result: Result<()>,
    ) -> Result<()> {
        let key = pctx.key().to_string();
        let datasets = ctx.datasets().clone();

        match result {
            Ok(()) => match pctx.terminal() {
                Some(Terminal::Finished { .. }) => self.continue_pipeline(ctx, pctx.dataset()).await,
                Some(Terminal::Failed { .. }) => Ok(()),
                None if pctx.is_deferred() => {
                    pctx.discard_staging().await;
                    Ok(())
                }
                None => {
                    let message = format!(
                        "Processor {} finished without a result",
                        self.processor.processor_type()
                    );
                    pctx.finish_with_error(&message).await?;
                    Ok(())
                }
            },
            // A terminal call already happened; the dataset is consistent
            Err(e) if pctx.terminal().is_some() => {
                warn!(dataset_key = %key, error = %e, "Processor failed after its dataset was finished");
                match pctx.terminal() {
                    Some(Terminal::Finished { .. }) => self.continue_pipeline(ctx, pctx.dataset()).await,
                    _ => Ok(()),
                }
            }
            Err(Error::Interrupted) => {
                pctx.discard_staging().await;
                datasets
                    .update_status(&key, STATUS_INTERRUPTED, None)
                    .await?;
                info!(dataset_key = %key, "Processor interrupted, dataset will resume");
                Err(Error::Interrupted)
            }
            Err(e) if e.is_transient() => {
                pctx.discard_staging().await;
                if let Some(RetryDecision::GaveUp) = ctx.retry_or_give_up(&e).await? {
                    pctx.finish_with_error(&e.to_string()).await?;
                }
                Err(e)
            }
            Err(Error::DatasetNotFound { key: missing }) => {
                pctx.discard_staging().await;
                warn!(
                    dataset_key = %key,
                    missing = %missing,
                    "Pipeline branch references a deleted dataset, abandoning it"
                );
                Ok(())
            }
            Err(e) => {
                pctx.discard_staging().await;
                pctx.finish_with_error(&e.to_string()).await?;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Worker for ProcessorWorker {
    async fn work(&mut self, ctx: &WorkerContext) -> Result<()> {
        let job = ctx.require_job()?;
        let datasets = ctx.datasets().clone();

        let Some(dataset) = datasets.get(&job.remote_id).await? else {
            warn!(
                job_id = job.id,
                dataset_key = %job.remote_id,
                "Dataset for job no longer exists"
            );
            return Ok(());
        };
        if dataset.is_finished {
            // An earlier run may have stopped between finishing the row and
            // handing its result on
            return match dataset.error.as_deref() {
                None => {
                    debug!(dataset_key = %dataset.key, "Dataset already finished, resuming hand-off");
                    self.continue_pipeline(ctx, &dataset).await
                }
                Some(error) => {
                    debug!(dataset_key = %dataset.key, "Dataset already failed, dropping job");
                    datasets.fail_in_pipeline(&dataset, error).await?;
                    Ok(())
                }
            };
        }

        let mut pctx = match self.prepare(ctx, dataset.clone()).await {
            Ok(pctx) => pctx,
            Err(e) => return self.settle_setup_error(ctx, &dataset, e).await,
        };

        debug!(
            dataset_key = %pctx.key(),
            processor = %self.processor.processor_type(),
            "Processing dataset"
        );
        let result = self.processor.process(&mut pctx).await;
        self.settle(ctx, &mut pctx, result).await
    }
}
