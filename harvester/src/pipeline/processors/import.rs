//! Import processor.
//!
//! Turns a local NDJSON file into a root dataset, so pipelines can run on
//! data collected outside the platform.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use tracing::{debug, warn};

use super::context::ProcessorContext;
use super::ndjson::{CHECKPOINT_EVERY, NdjsonReader, NdjsonWriter};
use super::traits::{OptionKind, Processor, ProcessorOption};
use crate::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct ImportConfig {
    /// File to import.
    pub path: PathBuf,
}

pub struct ImportProcessor;

impl ImportProcessor {
    pub const TYPE: &'static str = "import-ndjson";
}

#[async_trait]
impl Processor for ImportProcessor {
    fn processor_type(&self) -> &str {
        Self::TYPE
    }

    fn options(&self) -> Vec<ProcessorOption> {
        vec![
            ProcessorOption::new("path", OptionKind::String, Value::Null)
                .with_help("Path of the NDJSON file to import"),
        ]
    }

    async fn process(&self, ctx: &mut ProcessorContext) -> Result<()> {
        let config: ImportConfig =
            serde_json::from_value(Value::Object(ctx.parameters().clone()))
                .map_err(|e| Error::processor(format!("Invalid import parameters: {e}")))?;

        if !tokio::fs::try_exists(&config.path).await? {
            return ctx
                .finish_with_error(&format!("File {} does not exist", config.path.display()))
                .await;
        }

        ctx.update_status("Importing rows", None).await?;
        let mut reader = NdjsonReader::open(&config.path).await?;
        let mut writer = NdjsonWriter::create(&ctx.staged_result_path()).await?;

        while let Some(row) = reader.next_row().await? {
            writer.write_row(&row).await?;
            if writer.rows() % CHECKPOINT_EVERY == 0 {
                ctx.checkpoint()?;
                ctx.update_status(&format!("Imported {} rows", writer.rows()), None)
                    .await?;
            }
        }
        let rows = writer.close().await?;

        if reader.skipped() > 0 {
            warn!(
                dataset_key = %ctx.key(),
                skipped = reader.skipped(),
                "Skipped malformed lines during import"
            );
        }
        debug!(dataset_key = %ctx.key(), rows, "Import complete");
        ctx.finish(rows).await
    }
}
