//! The `api` worker: serves the control API for as long as the manager runs.

use async_trait::async_trait;
use axum::Router;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::introspection::Introspection;
use super::routes::{ControlState, router};
use crate::logging::LoggingConfig;
use crate::pipeline::{Worker, WorkerContext, WorkerDescriptor, WorkerRegistry};
use crate::{Error, Result};

/// Jobtype of the control API worker.
pub const API_JOBTYPE: &str = "api";

/// Wait before a failed bind is retried.
const BIND_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Control API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Address the API listens on.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Window for recent datasets in the status report.
    #[serde(default = "default_recent_window_secs")]
    pub recent_window_secs: u64,
}

fn default_bind() -> String {
    "127.0.0.1:12556".to_string()
}

fn default_recent_window_secs() -> u64 {
    super::introspection::DEFAULT_RECENT_WINDOW_SECS
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            recent_window_secs: default_recent_window_secs(),
        }
    }
}

impl ApiConfig {
    pub fn descriptor(&self) -> WorkerDescriptor {
        WorkerDescriptor::new(API_JOBTYPE).perpetual()
    }

    pub fn register(
        &self,
        registry: &mut WorkerRegistry,
        logging: Option<Arc<LoggingConfig>>,
    ) -> Result<()> {
        let config = self.clone();
        registry.register(self.descriptor(), move || {
            Box::new(ApiWorker::new(config.clone(), logging.clone())) as Box<dyn Worker>
        })
    }
}

/// Build the router with tracing.
pub fn build_router(state: ControlState) -> Router {
    router(state).layer(TraceLayer::new_for_http())
}

/// Serve `state` on `listener` until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    state: ControlState,
    cancel: CancellationToken,
) -> Result<()> {
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
            info!("Control API shutting down");
        })
        .await?;
    Ok(())
}

pub struct ApiWorker {
    config: ApiConfig,
    logging: Option<Arc<LoggingConfig>>,
}

impl ApiWorker {
    pub fn new(config: ApiConfig, logging: Option<Arc<LoggingConfig>>) -> Self {
        Self { config, logging }
    }
}

#[async_trait]
impl Worker for ApiWorker {
    async fn work(&mut self, ctx: &WorkerContext) -> Result<()> {
        let listener = match TcpListener::bind(&self.config.bind).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(bind = %self.config.bind, error = %e, "Control API failed to bind");
                ctx.sleep(BIND_RETRY_DELAY).await?;
                return Err(Error::Io(e));
            }
        };
        info!(bind = %self.config.bind, "Control API listening");

        let state = ControlState {
            introspection: Introspection::new(ctx.services())
                .with_recent_window(self.config.recent_window_secs),
            manager: ctx.services().manager.clone(),
            logging: self.logging.clone(),
        };
        serve(listener, state, ctx.cancellation_token().clone()).await?;
        ctx.checkpoint()
    }
}
