//! Processor trait and related types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::context::ProcessorContext;
use crate::{Error, Result};

/// Kind of value a processor option takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OptionKind {
    String,
    Integer,
    Boolean,
}

/// A configuration option a processor declares to its callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorOption {
    pub name: String,
    pub kind: OptionKind,
    #[serde(default)]
    pub default: Value,
    #[serde(default)]
    pub help: String,
}

impl ProcessorOption {
    pub fn new(name: impl Into<String>, kind: OptionKind, default: Value) -> Self {
        Self {
            name: name.into(),
            kind,
            default,
            help: String::new(),
        }
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = help.into();
        self
    }

    /// Whether `value` has the declared kind.
    pub fn accepts(&self, value: &Value) -> bool {
        match self.kind {
            OptionKind::String => value.is_string(),
            OptionKind::Integer => value.is_i64() || value.is_u64(),
            OptionKind::Boolean => value.is_boolean(),
        }
    }
}

/// Fill in defaults for options missing from `parameters`.
pub fn apply_option_defaults(options: &[ProcessorOption], parameters: &mut Map<String, Value>) {
    for option in options {
        if !parameters.contains_key(&option.name) && !option.default.is_null() {
            parameters.insert(option.name.clone(), option.default.clone());
        }
    }
}

/// Reject parameters whose value does not match the declared option kind.
///
/// Null counts as unset; parameters no option declares are left alone.
pub fn check_option_kinds(options: &[ProcessorOption], parameters: &Map<String, Value>) -> Result<()> {
    for option in options {
        match parameters.get(&option.name) {
            Some(value) if !value.is_null() && !option.accepts(value) => {
                return Err(Error::validation(format!(
                    "parameter '{}' must be {}, got {value}",
                    option.name, option.kind
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Trait for dataset processors.
///
/// A processor consumes one dataset and must end it with exactly one of
/// [`ProcessorContext::finish`] or [`ProcessorContext::finish_with_error`].
#[async_trait]
pub trait Processor: Send + Sync {
    /// Jobtype and dataset type handled by this processor.
    fn processor_type(&self) -> &str;

    fn max_workers(&self) -> usize {
        1
    }

    fn options(&self) -> Vec<ProcessorOption> {
        Vec::new()
    }

    /// Extension of the result file.
    fn result_extension(&self) -> &str {
        "ndjson"
    }

    /// Process the dataset behind `ctx`.
    ///
    /// # Cancel Safety
    ///
    /// Long loops should call [`ProcessorContext::checkpoint`] per row or page.
    /// Returning [`crate::Error::Interrupted`] releases the job and discards
    /// the staging directory, so the dataset restarts cleanly.
    async fn process(&self, ctx: &mut ProcessorContext) -> Result<()>;
}
