//! JSON parsing/serialization helpers with consistent warning logs.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

/// Which stored JSON field is being handled, for log context.
#[derive(Debug, Clone, Copy)]
pub enum JsonContext<'a> {
    JobField { job_id: i64, field: &'static str },
    DatasetField { dataset_key: &'a str, field: &'static str },
}

fn warn_parse_error(
    raw_len: usize,
    error: serde_json::Error,
    ctx: JsonContext<'_>,
    msg: &'static str,
) {
    match ctx {
        JsonContext::JobField { job_id, field } => {
            warn!(job_id, field, raw_len, error = %error, "{msg}");
        }
        JsonContext::DatasetField { dataset_key, field } => {
            warn!(dataset_key = %dataset_key, field, raw_len, error = %error, "{msg}");
        }
    }
}

fn warn_serialize_error(error: serde_json::Error, ctx: JsonContext<'_>, msg: &'static str) {
    match ctx {
        JsonContext::JobField { job_id, field } => {
            warn!(job_id, field, error = %error, "{msg}");
        }
        JsonContext::DatasetField { dataset_key, field } => {
            warn!(dataset_key = %dataset_key, field, error = %error, "{msg}");
        }
    }
}

pub fn parse_or_default<T: DeserializeOwned + Default>(
    raw: &str,
    ctx: JsonContext<'_>,
    msg: &'static str,
) -> T {
    // Empty means "no value", not a parse failure
    if raw.is_empty() {
        return T::default();
    }
    match serde_json::from_str(raw) {
        Ok(parsed) => parsed,
        Err(error) => {
            warn_parse_error(raw.len(), error, ctx, msg);
            T::default()
        }
    }
}

pub fn to_string_or_fallback<T: Serialize + ?Sized>(
    value: &T,
    fallback: &'static str,
    ctx: JsonContext<'_>,
    msg: &'static str,
) -> String {
    match serde_json::to_string(value) {
        Ok(json) => json,
        Err(error) => {
            warn_serialize_error(error, ctx, msg);
            fallback.to_string()
        }
    }
}
