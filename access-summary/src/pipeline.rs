use std::io::BufRead;

use access_log::{EmitError, JsonLinesReader, ReadError, ResultEmitter};
use clap::ValueEnum;
use log::{info, warn};
use partitioned_aggregate::{AggregationEngine, AggregationResult, Diagnostics, EngineConfig, EngineError};
use thiserror::Error;

#[derive(ValueEnum, Debug, Copy, Clone, PartialEq, Eq)]
#[clap(rename_all = "kebab_case")]
pub enum Runner {
    /// Single inline worker on the calling thread.
    Direct,
    /// One worker thread per partition.
    Parallel,
}

#[derive(ValueEnum, Debug, Copy, Clone, PartialEq, Eq)]
#[clap(rename_all = "kebab_case")]
pub enum MalformedPolicy {
    /// Log and count malformed lines, keep going.
    Skip,
    /// Fail the job on the first malformed line, before any output.
    Abort,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub runner: Runner,
    pub workers: Option<usize>,
    pub chunk_size: usize,
    pub on_malformed: MalformedPolicy,
    pub sorted: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            runner: Runner::Parallel,
            workers: None,
            chunk_size: EngineConfig::DEFAULT_CHUNK_SIZE,
            on_malformed: MalformedPolicy::Skip,
            sorted: false,
        }
    }
}

impl PipelineOptions {
    pub fn engine_config(&self) -> EngineConfig {
        let defaults = EngineConfig::default();
        let workers = match self.runner {
            Runner::Direct => 1,
            Runner::Parallel => self.workers.unwrap_or(defaults.workers),
        };
        EngineConfig {
            workers,
            chunk_size: self.chunk_size,
            ..defaults
        }
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Emit(#[from] EmitError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineReport {
    pub lines_read: usize,
    pub malformed: u64,
    pub records: u64,
    pub users: usize,
    pub diagnostics: Diagnostics,
    pub cancelled: bool,
}

impl PipelineReport {
    pub fn log(&self) {
        info!(
            "Read {} lines, aggregated {} records into {} users",
            self.lines_read, self.diagnostics.folded, self.users
        );
        if self.malformed > 0 {
            warn!("Skipped {} malformed lines", self.malformed);
        }
        if self.diagnostics.invalid_keys > 0 {
            warn!("Skipped {} records with an empty user_id", self.diagnostics.invalid_keys);
        }
        if self.diagnostics.overflowed > 0 {
            warn!("Skipped {} records whose bytes overflowed the user's total", self.diagnostics.overflowed);
        }
        if self.cancelled {
            warn!("Aggregation was cancelled, output is partial");
        }
    }
}

/// A finished aggregation that has not been written anywhere yet.
pub struct Aggregated {
    pub report: PipelineReport,
    result: AggregationResult,
    sorted: bool,
}

impl Aggregated {
    pub fn emit<E: ResultEmitter + ?Sized>(self, emitter: &mut E) -> Result<usize, PipelineError> {
        let emitted = if self.sorted {
            self.result.emit_sorted(emitter)?
        } else {
            self.result.emit(emitter)?
        };
        Ok(emitted)
    }
}

/// Reads JSON lines from `input` and aggregates them per user.
///
/// Nothing is emitted here, so a failing job never produces partial output.
pub fn aggregate<R: BufRead>(input: R, options: &PipelineOptions) -> Result<Aggregated, PipelineError> {
    let mut reader = JsonLinesReader::new(input);
    let mut malformed = 0u64;
    let mut failure: Option<ReadError> = None;

    let records = reader
        .by_ref()
        .map_while(|item| match item {
            Ok(record) => Some(Some(record)),
            Err(err) if err.is_fatal() || options.on_malformed == MalformedPolicy::Abort => {
                failure = Some(err);
                None
            }
            Err(err) => {
                warn!("Skipping {}", err);
                malformed += 1;
                Some(None)
            }
        })
        .flatten();

    let mut engine = AggregationEngine::new(options.engine_config());
    let config = engine.config();
    info!("Aggregating with {} worker(s), chunk size {}", config.workers, config.chunk_size);
    let result = engine.run(records)?;

    if let Some(err) = failure {
        return Err(err.into());
    }

    let report = PipelineReport {
        lines_read: reader.lines_read(),
        malformed,
        records: result.records_ingested(),
        users: result.len(),
        diagnostics: result.diagnostics(),
        cancelled: result.was_cancelled(),
    };
    Ok(Aggregated { report, result, sorted: options.sorted })
}
