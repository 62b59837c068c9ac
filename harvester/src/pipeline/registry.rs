//! Explicit worker-type registry.
//!
//! Every worker type is registered at startup with its descriptor and a
//! factory. The manager only ever runs types found here.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::job_queue::JobSpec;
use super::preset::{Preset, PresetProcessor};
use super::processors::{Processor, ProcessorOption, ProcessorWorker};
use super::worker::Worker;
use crate::{Error, Result};

/// Builds a fresh worker instance.
pub type WorkerFactory = Arc<dyn Fn() -> Box<dyn Worker> + Send + Sync>;

/// A job created at startup so the type runs without an external trigger.
#[derive(Debug, Clone, PartialEq)]
pub struct EnsureJob {
    pub remote_id: String,
    pub details: Value,
}

/// Declared capabilities of a worker type.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerDescriptor {
    pub jobtype: String,
    pub max_workers: usize,
    /// Seconds between runs of the ensured job.
    pub interval: Option<u64>,
    pub ensure_job: Option<EnsureJob>,
    /// Instances start without a job and loop until interrupted.
    pub perpetual: bool,
    pub options: Vec<ProcessorOption>,
}

impl WorkerDescriptor {
    pub fn new(jobtype: impl Into<String>) -> Self {
        Self {
            jobtype: jobtype.into(),
            max_workers: 1,
            interval: None,
            ensure_job: None,
            perpetual: false,
            options: Vec::new(),
        }
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    /// Keep one job of this type queued, re-run every `interval` seconds.
    pub fn recurring(mut self, remote_id: impl Into<String>, interval: u64) -> Self {
        self.interval = Some(interval);
        self.ensure_job = Some(EnsureJob {
            remote_id: remote_id.into(),
            details: Value::Object(Default::default()),
        });
        self
    }

    /// Queue one job of this type at startup.
    pub fn with_ensure_job(mut self, remote_id: impl Into<String>, details: Value) -> Self {
        self.ensure_job = Some(EnsureJob {
            remote_id: remote_id.into(),
            details,
        });
        self
    }

    pub fn perpetual(mut self) -> Self {
        self.perpetual = true;
        self
    }

    pub fn with_options(mut self, options: Vec<ProcessorOption>) -> Self {
        self.options = options;
        self
    }

    /// The job to add at startup, if the type declares one.
    pub fn ensure_job_spec(&self) -> Option<JobSpec> {
        self.ensure_job.as_ref().map(|ensure| {
            JobSpec::new(&self.jobtype, &ensure.remote_id)
                .with_details(ensure.details.clone())
                .with_interval(self.interval.unwrap_or(0))
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.jobtype.trim().is_empty() {
            return Err(Error::validation("worker jobtype must not be empty"));
        }
        if self.max_workers == 0 {
            return Err(Error::validation(format!(
                "worker type '{}' must allow at least one instance",
                self.jobtype
            )));
        }
        if self.interval == Some(0) {
            return Err(Error::validation(format!(
                "worker type '{}' has a zero recurrence interval",
                self.jobtype
            )));
        }
        Ok(())
    }
}

/// A registered type.
#[derive(Clone)]
pub struct RegisteredWorker {
    pub descriptor: WorkerDescriptor,
    factory: WorkerFactory,
}

impl RegisteredWorker {
    pub fn create(&self) -> Box<dyn Worker> {
        (self.factory)()
    }
}

/// Mapping from jobtype to constructor and descriptor.
#[derive(Default, Clone)]
pub struct WorkerRegistry {
    entries: HashMap<String, RegisteredWorker>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, descriptor: WorkerDescriptor, factory: F) -> Result<()>
    where
        F: Fn() -> Box<dyn Worker> + Send + Sync + 'static,
    {
        descriptor.validate()?;
        if self.entries.contains_key(&descriptor.jobtype) {
            return Err(Error::validation(format!(
                "worker type '{}' is already registered",
                descriptor.jobtype
            )));
        }
        debug!(
            jobtype = %descriptor.jobtype,
            max_workers = descriptor.max_workers,
            perpetual = descriptor.perpetual,
            "Registered worker type"
        );
        self.entries.insert(
            descriptor.jobtype.clone(),
            RegisteredWorker {
                descriptor,
                factory: Arc::new(factory),
            },
        );
        Ok(())
    }

    /// Register a processor; its jobs carry dataset keys as `remote_id`.
    pub fn register_processor(&mut self, processor: Arc<dyn Processor>) -> Result<()> {
        let descriptor = WorkerDescriptor::new(processor.processor_type())
            .with_max_workers(processor.max_workers())
            .with_options(processor.options());
        self.register(descriptor, move || {
            Box::new(ProcessorWorker::new(processor.clone())) as Box<dyn Worker>
        })
    }

    pub fn register_preset<P: Preset + 'static>(&mut self, preset: P) -> Result<()> {
        self.register_processor(Arc::new(PresetProcessor::new(preset)))
    }

    pub fn get(&self, jobtype: &str) -> Option<&RegisteredWorker> {
        self.entries.get(jobtype)
    }

    pub fn contains(&self, jobtype: &str) -> bool {
        self.entries.contains_key(jobtype)
    }

    /// Declared options of a type, for callers building parameters.
    pub fn options(&self, jobtype: &str) -> Option<&[ProcessorOption]> {
        self.entries
            .get(jobtype)
            .map(|entry| entry.descriptor.options.as_slice())
    }

    /// Descriptors sorted by jobtype.
    pub fn descriptors(&self) -> Vec<&WorkerDescriptor> {
        let mut descriptors: Vec<_> = self.entries.values().map(|e| &e.descriptor).collect();
        descriptors.sort_by(|a, b| a.jobtype.cmp(&b.jobtype));
        descriptors
    }

    pub fn jobtypes(&self) -> Vec<String> {
        self.descriptors()
            .into_iter()
            .map(|d| d.jobtype.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
