mod generate;
mod pipeline;

pub use generate::{generate_dataset, GenerateError, GenerateOptions};
pub use pipeline::{aggregate, Aggregated, MalformedPolicy, PipelineError, PipelineOptions, PipelineReport, Runner};
