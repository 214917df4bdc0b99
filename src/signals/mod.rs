pub mod filters;
pub mod generator;

pub use filters::{run_filters, FilterInputs, FilterOutcome};
pub use generator::{generate, GenerationResult, Signal};
