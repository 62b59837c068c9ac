//! Repository layer for database access.
//!
//! All SQL lives behind these traits; services only see `Arc<dyn …Repository>`.

pub mod dataset;
pub mod job;

pub use dataset::*;
pub use job::*;
