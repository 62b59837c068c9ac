//! Domain layer for harvester.
//!
//! Value objects and pure data structures shared by the pipeline services.

pub mod genealogy;
pub mod value_objects;

pub use genealogy::{Genealogy, GenealogyNode};
pub use value_objects::*;
