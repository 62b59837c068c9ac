//! Dataset processors.

mod context;
mod count_values;
mod import;
mod ndjson;
mod runner;
mod sample;
mod traits;

use std::sync::Arc;

pub use context::{ProcessorContext, Terminal};
pub use count_values::{CountValuesConfig, CountValuesProcessor};
pub use import::{ImportConfig, ImportProcessor};
pub use runner::{ProcessorWorker, STATUS_INTERRUPTED};
pub use sample::{SampleConfig, SampleProcessor};
pub use traits::{OptionKind, Processor, ProcessorOption, apply_option_defaults, check_option_kinds};

/// The processors shipped with the crate.
pub fn builtin_processors() -> Vec<Arc<dyn Processor>> {
    vec![
        Arc::new(ImportProcessor),
        Arc::new(SampleProcessor),
        Arc::new(CountValuesProcessor),
    ]
}
