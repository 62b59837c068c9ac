//! Job queue, workers and the dataset pipeline.
//!
//! - A database-backed job queue with atomic claims
//! - Workers bound to one jobtype, driven by the worker manager
//! - Datasets processed by processors, and presets that expand into pipelines
//! - A watchdog that reclaims stale claims and orphaned staging directories

pub mod dataset;
pub mod job_queue;
pub mod manager;
pub mod preset;
pub mod processors;
pub mod registry;
pub mod restart_tracker;
pub mod watchdog;
pub mod worker;

pub use dataset::{Dataset, DatasetService, NewDataset};
pub use job_queue::{AddJobOutcome, Job, JobQueue, JobSpec, RetryDecision};
pub use manager::{ManagerConfig, ManagerHandle, PoolState, ShutdownReport, WorkerManager};
pub use preset::{
    Pipeline, PipelineBuilder, PipelineStep, Preset, PresetPipeline, PresetProcessor,
    SampleAndCountPreset,
};
pub use processors::{Processor, ProcessorContext, ProcessorOption, ProcessorWorker};
pub use registry::{WorkerDescriptor, WorkerRegistry};
pub use restart_tracker::{RestartTracker, RestartTrackerConfig};
pub use watchdog::{WATCHDOG_JOBTYPE, WatchdogConfig, WatchdogWorker};
pub use worker::{
    Worker, WorkerContext, WorkerExit, WorkerHandle, WorkerOutcome, WorkerServices, WorkerState,
    run_worker,
};
