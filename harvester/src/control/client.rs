//! Client for the control API, used by the CLI.

use std::time::Duration;

use super::introspection::{StatusReport, WorkerTypeStatus};
use crate::pipeline::Job;
use crate::{Error, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ControlClient {
    base_url: String,
    http: reqwest::Client,
}

fn request_error(e: reqwest::Error) -> Error {
    if e.is_timeout() || e.is_connect() {
        Error::transient(format!("control API unreachable: {e}"))
    } else {
        Error::Other(format!("control API request failed: {e}"))
    }
}

impl ControlClient {
    /// Client for the API listening on `bind` (`host:port`).
    pub fn new(bind: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: format!("http://{bind}"),
            http,
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.http
            .get(format!("{}{path}", self.base_url))
            .send()
            .await
            .and_then(|res| res.error_for_status())
            .map_err(request_error)?
            .json()
            .await
            .map_err(request_error)
    }

    pub async fn status(&self) -> Result<StatusReport> {
        self.get("/status").await
    }

    pub async fn workers(&self) -> Result<Vec<WorkerTypeStatus>> {
        self.get("/workers").await
    }

    pub async fn jobs(&self, jobtype: Option<&str>) -> Result<Vec<Job>> {
        match jobtype {
            Some(jobtype) => self.get(&format!("/jobs/{jobtype}")).await,
            None => self.get("/jobs").await,
        }
    }

    /// Ask the daemon to shut down, optionally with a specific drain deadline.
    pub async fn shutdown(&self, drain: Option<Duration>) -> Result<()> {
        let mut request = self.http.post(format!("{}/shutdown", self.base_url));
        if let Some(drain) = drain {
            request = request.query(&[("drain_secs", drain.as_secs())]);
        }
        request
            .send()
            .await
            .and_then(|res| res.error_for_status())
            .map_err(request_error)?;
        Ok(())
    }

    /// Whether a daemon answers on the configured address.
    pub async fn is_running(&self) -> bool {
        self.status().await.is_ok()
    }
}
