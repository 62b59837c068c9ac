//! Count how often each value of a field occurs in the source dataset.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;

use super::context::ProcessorContext;
use super::ndjson::{CHECKPOINT_EVERY, NdjsonReader, NdjsonWriter};
use super::traits::{OptionKind, Processor, ProcessorOption};
use crate::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct CountValuesConfig {
    pub field: String,
}

pub struct CountValuesProcessor;

impl CountValuesProcessor {
    pub const TYPE: &'static str = "count-values";
}

/// Key a row is grouped under; missing fields count as null.
fn group_key(row: &Value, field: &str) -> String {
    match row.get(field) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "null".to_string(),
    }
}

#[async_trait]
impl Processor for CountValuesProcessor {
    fn processor_type(&self) -> &str {
        Self::TYPE
    }

    fn max_workers(&self) -> usize {
        2
    }

    fn options(&self) -> Vec<ProcessorOption> {
        vec![
            ProcessorOption::new("field", OptionKind::String, Value::Null)
                .with_help("Field whose values are counted"),
        ]
    }

    async fn process(&self, ctx: &mut ProcessorContext) -> Result<()> {
        let config: CountValuesConfig =
            serde_json::from_value(Value::Object(ctx.parameters().clone()))
                .map_err(|e| Error::processor(format!("Invalid count parameters: {e}")))?;

        let source = ctx.source_file()?;
        let mut reader = NdjsonReader::open(&source).await?;
        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        let mut seen: i64 = 0;

        while let Some(row) = reader.next_row().await? {
            *counts.entry(group_key(&row, &config.field)).or_default() += 1;
            seen += 1;
            if seen % CHECKPOINT_EVERY == 0 {
                ctx.checkpoint()?;
                ctx.update_status(&format!("Counted {seen} rows"), None).await?;
            }
        }

        if counts.is_empty() {
            return ctx.finish_with_error("Source dataset has no rows").await;
        }

        let mut writer = NdjsonWriter::create(&ctx.staged_result_path()).await?;
        for (value, count) in &counts {
            writer
                .write_row(&json!({ "value": value, "count": count }))
                .await?;
        }
        let rows = writer.close().await?;
        ctx.finish(rows).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_key() {
        assert_eq!(group_key(&json!({"board": "g"}), "board"), "g");
        assert_eq!(group_key(&json!({"board": 4}), "board"), "4");
        assert_eq!(group_key(&json!({}), "board"), "null");
    }
}
