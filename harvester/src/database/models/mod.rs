//! Database models for harvester.
//!
//! These models map directly to the database schema and handle
//! serialization/deserialization of JSON fields.

pub mod dataset;
pub mod job;

pub use dataset::*;
pub use job::*;
