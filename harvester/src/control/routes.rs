//! Control API routes.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::error::{ApiError, ApiResult};
use super::introspection::{Introspection, StatusReport, WorkerTypeStatus};
use crate::logging::LoggingConfig;
use crate::pipeline::{Job, ManagerHandle};

/// Shared state of the control API.
#[derive(Clone)]
pub struct ControlState {
    pub introspection: Introspection,
    pub manager: ManagerHandle,
    /// Absent when logging was not installed through [`crate::logging`].
    pub logging: Option<Arc<LoggingConfig>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ShutdownParams {
    /// Override of the drain deadline; 0 aborts workers at once.
    pub drain_secs: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ShutdownResponse {
    pub accepted: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogFilter {
    pub filter: String,
}

pub fn router(state: ControlState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/workers", get(workers))
        .route("/jobs", get(all_jobs))
        .route("/jobs/{jobtype}", get(jobs_of_type))
        .route("/shutdown", post(shutdown))
        .route("/logging", get(get_log_filter).put(set_log_filter))
        .with_state(state)
}

async fn status(State(state): State<ControlState>) -> ApiResult<Json<StatusReport>> {
    Ok(Json(state.introspection.report().await?))
}

async fn workers(State(state): State<ControlState>) -> ApiResult<Json<Vec<WorkerTypeStatus>>> {
    Ok(Json(state.introspection.workers().await?))
}

async fn all_jobs(State(state): State<ControlState>) -> ApiResult<Json<Vec<Job>>> {
    Ok(Json(state.introspection.jobs(None).await?))
}

async fn jobs_of_type(
    State(state): State<ControlState>,
    Path(jobtype): Path<String>,
) -> ApiResult<Json<Vec<Job>>> {
    Ok(Json(state.introspection.jobs(Some(&jobtype)).await?))
}

async fn shutdown(
    State(state): State<ControlState>,
    Query(params): Query<ShutdownParams>,
) -> (StatusCode, Json<ShutdownResponse>) {
    match params.drain_secs {
        Some(secs) => state
            .manager
            .shutdown_with_drain(Duration::from_secs(secs)),
        None => state.manager.shutdown(),
    }
    (StatusCode::ACCEPTED, Json(ShutdownResponse { accepted: true }))
}

fn logging(state: &ControlState) -> ApiResult<&Arc<LoggingConfig>> {
    state
        .logging
        .as_ref()
        .ok_or_else(|| ApiError::not_found("logging is not configured"))
}

async fn get_log_filter(State(state): State<ControlState>) -> ApiResult<Json<LogFilter>> {
    Ok(Json(LogFilter {
        filter: logging(&state)?.get_filter(),
    }))
}

async fn set_log_filter(
    State(state): State<ControlState>,
    Json(body): Json<LogFilter>,
) -> ApiResult<Json<LogFilter>> {
    let logging = logging(&state)?;
    logging.set_filter(&body.filter)?;
    Ok(Json(LogFilter {
        filter: logging.get_filter(),
    }))
}
