//! Introspection and daemon control.

pub mod client;
pub mod error;
pub mod introspection;
pub mod routes;
pub mod server;

pub use client::ControlClient;
pub use introspection::{Introspection, StatusReport, WorkerTypeStatus};
pub use server::{API_JOBTYPE, ApiConfig, ApiWorker};
