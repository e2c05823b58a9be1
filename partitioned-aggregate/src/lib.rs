mod accumulator;
mod engine;
mod error;
mod keyed_aggregator;

pub use accumulator::Accumulator;
pub use engine::{AggregationEngine, AggregationResult, EngineConfig, EngineHandle, EngineState};
pub use error::{AggregateError, EngineError, Overflow};
pub use keyed_aggregator::{Diagnostics, KeyedAggregator};
