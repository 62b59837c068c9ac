//! Sample processor: keeps the first `limit` rows of the source dataset.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use super::context::ProcessorContext;
use super::ndjson::{CHECKPOINT_EVERY, NdjsonReader, NdjsonWriter};
use super::traits::{OptionKind, Processor, ProcessorOption};
use crate::{Error, Result};

fn default_limit() -> i64 {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct SampleConfig {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

pub struct SampleProcessor;

impl SampleProcessor {
    pub const TYPE: &'static str = "sample-rows";
}

#[async_trait]
impl Processor for SampleProcessor {
    fn processor_type(&self) -> &str {
        Self::TYPE
    }

    fn max_workers(&self) -> usize {
        2
    }

    fn options(&self) -> Vec<ProcessorOption> {
        vec![
            ProcessorOption::new("limit", OptionKind::Integer, json!(default_limit()))
                .with_help("Number of rows to keep"),
        ]
    }

    async fn process(&self, ctx: &mut ProcessorContext) -> Result<()> {
        let config: SampleConfig =
            serde_json::from_value(Value::Object(ctx.parameters().clone()))
                .map_err(|e| Error::processor(format!("Invalid sample parameters: {e}")))?;
        if config.limit <= 0 {
            return ctx.finish_with_error("Sample limit must be positive").await;
        }

        let source = ctx.source_file()?;
        let mut reader = NdjsonReader::open(&source).await?;
        let mut writer = NdjsonWriter::create(&ctx.staged_result_path()).await?;

        while writer.rows() < config.limit {
            let Some(row) = reader.next_row().await? else {
                break;
            };
            writer.write_row(&row).await?;
            if writer.rows() % CHECKPOINT_EVERY == 0 {
                ctx.checkpoint()?;
                let progress = writer.rows() as f64 / config.limit as f64;
                ctx.update_status("Sampling rows", Some(progress)).await?;
            }
        }

        let rows = writer.close().await?;
        ctx.finish(rows).await
    }
}
