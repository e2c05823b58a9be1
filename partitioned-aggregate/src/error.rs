use thiserror::Error;

/// Arithmetic on an accumulator would have left the `u64` range.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("accumulator overflowed u64")]
pub struct Overflow;

/// Per-record failure. The record is skipped and the job carries on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AggregateError {
    #[error("record has an empty user_id")]
    InvalidKey,
    #[error("byte totals for user \"{key}\" overflowed u64")]
    NumericOverflow { key: String },
}

/// Structural failure that ends the job without output.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("engine has already been run, current state is {0:?}")]
    AlreadyStarted(crate::EngineState),
    #[error("worker {worker} panicked while folding records")]
    WorkerPanicked { worker: usize },
    #[error("could not spawn worker {worker}: {source}")]
    Spawn {
        worker: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("could not build merge thread pool: {0}")]
    MergePool(#[from] rayon::ThreadPoolBuildError),
    #[error("merging partial aggregates failed: {0}")]
    Merge(#[from] AggregateError),
}
