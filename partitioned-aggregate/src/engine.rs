use std::hash::BuildHasher;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::Arc;
use std::thread;

use access_log::{CommonLog, EmitError, PerUserSummary, ResultEmitter};
use fnv::FnvBuildHasher;
use itertools::Itertools;
use log::debug;
use rayon::prelude::{IntoParallelIterator, ParallelIterator};

use crate::accumulator::Accumulator;
use crate::error::{AggregateError, EngineError};
use crate::keyed_aggregator::{Diagnostics, KeyedAggregator};

type Chunk = Vec<(u64, CommonLog)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Running,
    Merging,
    Done,
}

impl EngineState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => EngineState::Idle,
            1 => EngineState::Running,
            2 => EngineState::Merging,
            _ => EngineState::Done,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of partitions, each folded by its own worker thread.
    pub workers: usize,
    /// Records routed to a worker per channel message.
    pub chunk_size: usize,
    /// Chunks that may wait in a worker's channel before intake blocks.
    pub queue_depth: usize,
    /// Stack size for worker threads, platform default when unset.
    pub worker_stack_size: Option<usize>,
}

impl EngineConfig {
    pub const DEFAULT_CHUNK_SIZE: usize = 1 << 12;
    pub const DEFAULT_QUEUE_DEPTH: usize = 4;

    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers,
            ..Default::default()
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: thread::available_parallelism().map(NonZeroUsize::get).unwrap_or(1),
            chunk_size: Self::DEFAULT_CHUNK_SIZE,
            queue_depth: Self::DEFAULT_QUEUE_DEPTH,
            worker_stack_size: None,
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: AtomicU8,
    /// Bit per state the engine has been in.
    visited: AtomicU8,
    cancelled: AtomicBool,
    ingested: AtomicU64,
}

/// Cloneable view on a running engine. Observes its state and raises cooperative cancellation.
#[derive(Debug, Clone, Default)]
pub struct EngineHandle {
    inner: Arc<Shared>,
}

impl EngineHandle {
    /// Stops intake. The engine finishes with whatever has been folded so far.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// True once the engine has passed through `state`. Idle always counts.
    pub fn has_entered(&self, state: EngineState) -> bool {
        state == EngineState::Idle || self.inner.visited.load(Ordering::Acquire) & (1 << state as u8) != 0
    }

    /// Records pulled from the input so far, including ones later skipped.
    pub fn records_ingested(&self) -> u64 {
        self.inner.ingested.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: EngineState) {
        self.inner.visited.fetch_or(1 << state as u8, Ordering::AcqRel);
        self.inner.state.store(state as u8, Ordering::Release);
    }

    fn ingest(&self) {
        self.inner.ingested.fetch_add(1, Ordering::Relaxed);
    }
}

/// Final aggregate of a finished run.
#[derive(Debug)]
pub struct AggregationResult<S = FnvBuildHasher> {
    aggregator: KeyedAggregator<S>,
    records: u64,
    cancelled: bool,
}

impl<S: BuildHasher> AggregationResult<S> {
    pub fn len(&self) -> usize {
        self.aggregator.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aggregator.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Accumulator> {
        self.aggregator.get(key)
    }

    pub fn snapshot(&self) -> Vec<(String, Accumulator)> {
        self.aggregator.snapshot()
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.aggregator.diagnostics()
    }

    pub fn records_ingested(&self) -> u64 {
        self.records
    }

    /// True when the run stopped early on cancellation and only holds a partial result.
    pub fn was_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn into_summaries(self) -> Vec<PerUserSummary> {
        self.aggregator.into_summaries().collect_vec()
    }

    /// Hands every summary to `emitter` once, then finishes it. Returns the number emitted.
    pub fn emit<E: ResultEmitter + ?Sized>(self, emitter: &mut E) -> Result<usize, EmitError> {
        emit_all(self.aggregator.into_summaries(), emitter)
    }

    /// As [`emit`](Self::emit), ordered by `user_id`.
    pub fn emit_sorted<E: ResultEmitter + ?Sized>(self, emitter: &mut E) -> Result<usize, EmitError> {
        let summaries = self
            .aggregator
            .into_summaries()
            .sorted_unstable_by(|a, b| a.user_id.cmp(&b.user_id));
        emit_all(summaries, emitter)
    }
}

fn emit_all<E: ResultEmitter + ?Sized>(
    summaries: impl Iterator<Item = PerUserSummary>,
    emitter: &mut E,
) -> Result<usize, EmitError> {
    let mut emitted = 0;
    for summary in summaries {
        emitter.emit(&summary)?;
        emitted += 1;
    }
    emitter.finish()?;
    Ok(emitted)
}

/// Partition for a key hash.
///
/// Uses the upper half of the hash. Each worker's table probes from the low bits of the same
/// hash, so routing on them would leave every key in a partition sharing its start bits.
fn partition(hash: u64, partitions: usize) -> usize {
    (hash >> 32) as usize % partitions
}

/// Groups records by `user_id` across a set of worker partitions.
///
/// Records are routed to partitions by the upper bits of `hash(user_id)`. Each worker owns its
/// [`KeyedAggregator`], so folding takes no locks. Once every worker has been joined the partial
/// aggregators are reduced into one with a parallel merge tree. An engine runs once:
/// `Idle -> Running -> Merging -> Done`, or `Running -> Done` when cancelled.
pub struct AggregationEngine<S = FnvBuildHasher> {
    config: EngineConfig,
    handle: EngineHandle,
    bh: S,
}

impl AggregationEngine<FnvBuildHasher> {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_hasher(config, FnvBuildHasher::default())
    }

    pub fn with_workers(workers: usize) -> Self {
        Self::new(EngineConfig::with_workers(workers))
    }
}

impl<S: BuildHasher + Clone + Send + Sync> AggregationEngine<S> {
    pub fn with_hasher(config: EngineConfig, bh: S) -> Self {
        Self {
            config,
            handle: EngineHandle::default(),
            bh,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> EngineState {
        self.handle.state()
    }

    /// Consumes `records` and returns the merged per-key aggregate.
    ///
    /// Records with invalid keys or overflowing byte counts are skipped and counted in
    /// [`Diagnostics`]. Worker failures and overflow while merging partials are fatal.
    pub fn run<I>(&mut self, records: I) -> Result<AggregationResult<S>, EngineError>
    where
        I: IntoIterator<Item = CommonLog>,
    {
        let state = self.state();
        if state != EngineState::Idle {
            return Err(EngineError::AlreadyStarted(state));
        }
        let workers = self.config.workers.max(1);

        self.transition(EngineState::Running);
        let partials = if workers == 1 {
            Ok(vec![self.fold_inline(records)])
        } else {
            self.fold_partitioned(records, workers)
        };
        let partials = match partials {
            Ok(partials) => partials,
            Err(err) => {
                self.transition(EngineState::Done);
                return Err(err);
            }
        };

        let cancelled = self.handle.is_cancelled();
        if cancelled {
            debug!("Cancelled after {} records, keeping partial result", self.handle.records_ingested());
        } else {
            self.transition(EngineState::Merging);
        }
        let merged = self.merge_partials(partials, workers);
        self.transition(EngineState::Done);

        Ok(AggregationResult {
            aggregator: merged?,
            records: self.handle.records_ingested(),
            cancelled,
        })
    }

    fn transition(&self, next: EngineState) {
        debug!("Engine state {:?} -> {:?}", self.handle.state(), next);
        self.handle.set_state(next);
    }

    fn fold_inline<I>(&self, records: I) -> KeyedAggregator<S>
    where
        I: IntoIterator<Item = CommonLog>,
    {
        let mut agg = KeyedAggregator::with_hasher(self.bh.clone());
        let mut records = records.into_iter();

        while !self.handle.is_cancelled() {
            let Some(record) = records.next() else { break };
            self.handle.ingest();
            if let Err(err) = agg.apply(&record) {
                debug!("Skipping record: {}", err);
            }
        }
        agg
    }

    fn fold_partitioned<I>(&self, records: I, workers: usize) -> Result<Vec<KeyedAggregator<S>>, EngineError>
    where
        I: IntoIterator<Item = CommonLog>,
    {
        let handle = &self.handle;

        thread::scope(|s| {
            let mut senders = Vec::with_capacity(workers);
            let mut join_handles = Vec::with_capacity(workers);
            for worker in 0..workers {
                let (tx, rx) = mpsc::sync_channel::<Chunk>(self.config.queue_depth);
                let bh = self.bh.clone();
                let mut builder = thread::Builder::new().name(format!("partition-{worker}"));
                if let Some(size) = self.config.worker_stack_size {
                    builder = builder.stack_size(size);
                }
                let spawned = builder.spawn_scoped(s, move || {
                    let mut agg = KeyedAggregator::with_hasher(bh);
                    for chunk in rx {
                        if handle.is_cancelled() {
                            break;
                        }
                        for (hash, record) in chunk {
                            if let Err(err) = agg.apply_hashed(hash, &record) {
                                debug!("Worker {} skipping record: {}", worker, err);
                            }
                        }
                    }
                    agg
                });
                match spawned {
                    Ok(jh) => {
                        senders.push(tx);
                        join_handles.push(jh);
                    }
                    Err(source) => {
                        // Workers already running exit once their channels close.
                        drop(senders);
                        for jh in join_handles {
                            let _ = jh.join();
                        }
                        return Err(EngineError::Spawn { worker, source });
                    }
                }
            }

            self.route(records, &senders);
            // Closing the channels lets workers drain and exit.
            drop(senders);

            join_handles
                .into_iter()
                .enumerate()
                .map(|(worker, jh)| jh.join().map_err(|_| EngineError::WorkerPanicked { worker }))
                .collect::<Result<Vec<_>, _>>()
        })
    }

    /// Feeds every partition until input runs out, cancellation is raised, or a worker goes away.
    fn route<I>(&self, records: I, senders: &[SyncSender<Chunk>])
    where
        I: IntoIterator<Item = CommonLog>,
    {
        let partitions = senders.len();
        let chunk_size = self.config.chunk_size.max(1);
        let mut buffers: Vec<Chunk> = (0..partitions).map(|_| Vec::with_capacity(chunk_size)).collect_vec();
        let mut records = records.into_iter();

        while !self.handle.is_cancelled() {
            let Some(record) = records.next() else {
                for (worker, buffer) in buffers.into_iter().enumerate() {
                    if !buffer.is_empty() && !self.send(&senders[worker], worker, buffer) {
                        return;
                    }
                }
                return;
            };
            self.handle.ingest();

            let hash = self.bh.hash_one(record.user_id.as_str());
            let worker = partition(hash, partitions);
            buffers[worker].push((hash, record));
            if buffers[worker].len() >= chunk_size {
                let chunk = std::mem::replace(&mut buffers[worker], Vec::with_capacity(chunk_size));
                if !self.send(&senders[worker], worker, chunk) {
                    return;
                }
            }
        }

        // Buffered records that never reached a worker are dropped.
    }

    /// Returns false once the worker has stopped receiving.
    fn send(&self, sender: &SyncSender<Chunk>, worker: usize, chunk: Chunk) -> bool {
        match sender.send(chunk) {
            Ok(()) => true,
            Err(_) => {
                // Receivers only go away on cancellation or a worker panic, which the join reports.
                if !self.handle.is_cancelled() {
                    debug!("Worker {} stopped receiving, ending intake", worker);
                }
                false
            }
        }
    }

    fn merge_partials(&self, mut partials: Vec<KeyedAggregator<S>>, workers: usize) -> Result<KeyedAggregator<S>, EngineError> {
        if partials.len() <= 1 {
            return Ok(partials
                .pop()
                .unwrap_or_else(|| KeyedAggregator::with_hasher(self.bh.clone())));
        }

        let bh = &self.bh;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()?;
        let merged = pool.install(|| {
            partials
                .into_par_iter()
                .map(Ok::<_, AggregateError>)
                .try_reduce(
                    || KeyedAggregator::with_hasher(bh.clone()),
                    |mut a, b| {
                        a.merge_from(b)?;
                        Ok(a)
                    },
                )
        })?;
        Ok(merged)
    }
}
