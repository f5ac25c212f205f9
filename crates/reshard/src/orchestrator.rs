//! End-to-end conversion of one archive into another layout.
//!
//! Every parameter is classified and routed to its target stage before any tensor is
//! read, so catalog and placement errors surface before work starts. Conversion then runs
//! one unit per parameter on a worker pool. Finished units flow through a bounded channel
//! to a single writer, which appends them in plan order so the output is identical for
//! any worker count. Workers claim units in plan order and only start one while it is
//! within `queue_capacity` units of the next one the writer needs.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Instant;

use hashbrown::HashSet;
use serde::Serialize;

use crate::archive::{ArchiveReader, ArchiveWriter, OutputGuard};
use crate::catalog::ParameterCatalog;
use crate::config::{ParallelConfig, ReshardOptions};
use crate::engine::{ReshardEngine, Resharded};
use crate::error::{ReshardError, Result};
use crate::pipeline::{LayerAssignment, LayerName, to_global, to_local};
use crate::sharding::{Partition, PartitionAxis};

/// Cooperative cancellation flag shared between a caller and a running conversion.
///
/// Workers check it before starting each parameter; a parameter already being converted
/// finishes first.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// A token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Everything needed to run one conversion.
#[derive(Clone, Debug)]
pub struct ConversionRequest {
    /// Source archive.
    pub input: PathBuf,
    /// Path of the archive to create. Must not exist.
    pub output: PathBuf,
    /// Layout the caller expects the source archive to have.
    ///
    /// A `None` split rank accepts whatever split the archive declares.
    pub source: ParallelConfig,
    /// Layout to produce.
    pub target: ParallelConfig,
    /// Tuning knobs.
    pub options: ReshardOptions,
}

/// One converted parameter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ParameterReport {
    /// Global parameter name.
    pub name: String,
    /// Tensor-parallel partition axis.
    pub axis: PartitionAxis,
    /// Pipeline rank holding the parameter in the source.
    pub source_pipeline_rank: usize,
    /// Pipeline rank holding the parameter in the target.
    pub target_pipeline_rank: usize,
    /// Shape of one source shard.
    pub source_shape: Vec<usize>,
    /// Shape of one target shard.
    pub target_shape: Vec<usize>,
    /// Unsharded shape, after any padding.
    pub full_shape: Vec<usize>,
}

/// Vocabulary padding applied to one parameter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PaddingReport {
    /// Global parameter name.
    pub name: String,
    /// True vocabulary size.
    pub vocab_size: usize,
    /// Rows after padding.
    pub padded_rows: usize,
    /// Zero rows added.
    pub added_rows: usize,
}

/// Summary of a conversion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConversionReport {
    /// Layout of the source archive, as declared by its manifest.
    pub source: ParallelConfig,
    /// Layout produced.
    pub target: ParallelConfig,
    /// Path of the archive written.
    pub output: PathBuf,
    /// Every parameter, in output order.
    pub parameters: Vec<ParameterReport>,
    /// Every vocabulary padding applied.
    pub padding: Vec<PaddingReport>,
    /// Shards written; zero for a dry run.
    pub shards_written: usize,
    /// Blob bytes written; zero for a dry run.
    pub bytes_written: u64,
    /// Whether nothing was written.
    pub dry_run: bool,
}

/// A parameter's route from the source archive to the target one.
#[derive(Clone, Debug)]
struct WorkUnit {
    global_name: String,
    partition: Partition,
    source_name: String,
    source_pipeline_rank: usize,
    source_shape: Vec<usize>,
    target_name: String,
    target_pipeline_rank: usize,
}

/// Runs a [`ConversionRequest`].
#[derive(Debug)]
pub struct Resharder {
    request: ConversionRequest,
    cancellation: CancellationToken,
}

/// Converts `request.input` into a new archive at `request.output`.
pub fn reshard(request: &ConversionRequest) -> Result<ConversionReport> {
    Resharder::new(request.clone()).run()
}

impl Resharder {
    /// Prepares a conversion.
    pub fn new(request: ConversionRequest) -> Self {
        Self {
            request,
            cancellation: CancellationToken::new(),
        }
    }

    /// Uses `token` for cancellation.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Converts and commits the output archive.
    pub fn run(&self) -> Result<ConversionReport> {
        self.execute(false)
    }

    /// Reads and converts every parameter without writing anything.
    pub fn plan(&self) -> Result<ConversionReport> {
        self.execute(true)
    }

    fn execute(&self, dry_run: bool) -> Result<ConversionReport> {
        let request = &self.request;
        request.options.validate()?;
        request.target.validate()?;
        let started = Instant::now();
        log::info!(
            "Resharding {} ({}) into {} ({}){}",
            request.input.display(),
            request.source,
            request.output.display(),
            request.target,
            if dry_run { " [dry run]" } else { "" }
        );

        let _guard = if dry_run {
            None
        } else {
            Some(OutputGuard::acquire(&request.output)?)
        };
        let reader = ArchiveReader::open_with(&request.input, request.options.retry.clone())?
            .with_read_timeout(request.options.read_timeout());
        let manifest = reader.manifest();
        let declared = manifest.parallel_config;
        let source = &request.source;
        let split_agrees = source.pipeline_split_rank.is_none()
            || source.pipeline_split_rank == declared.pipeline_split_rank;
        if source.tensor_parallel_size != declared.tensor_parallel_size
            || source.pipeline_parallel_size != declared.pipeline_parallel_size
            || !split_agrees
        {
            return Err(ReshardError::ConfigMismatch {
                requested: *source,
                declared,
            });
        }

        let model = &manifest.model_config;
        let target_assignment = LayerAssignment::compute(model, &request.target)?;
        let catalog = ParameterCatalog::megatron(model)?;
        let units = route(&reader, &catalog, &target_assignment)?;
        log::info!(
            "Planned {} parameters over {} target shards",
            units.len(),
            request.target.world_size()
        );

        let sink = if dry_run {
            None
        } else {
            Some(ArchiveWriter::create(
                &request.output,
                request.target,
                model.clone(),
                &target_assignment,
            )?)
        };
        let (parameters, padding, sink) = self.convert_all(&reader, &units, sink)?;

        let (shards_written, bytes_written) = match sink {
            Some(writer) => {
                let written = writer.commit()?;
                (written.shards.len(), written.total_bytes())
            }
            None => (0, 0),
        };

        log::info!(
            "Resharded {} parameters in {:.2?}",
            parameters.len(),
            started.elapsed()
        );
        Ok(ConversionReport {
            source: declared,
            target: request.target,
            output: request.output.clone(),
            parameters,
            padding,
            shards_written,
            bytes_written,
            dry_run,
        })
    }

    /// Runs every unit on the worker pool and hands the results to the writer.
    fn convert_all(
        &self,
        reader: &ArchiveReader,
        units: &[WorkUnit],
        sink: Option<ArchiveWriter>,
    ) -> Result<Written> {
        let options = &self.request.options;
        let engine = ReshardEngine::new(options.make_vocab_size_divisible_by);
        let source_tp = reader.manifest().parallel_config.tensor_parallel_size;
        let target_tp = self.request.target.tensor_parallel_size;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.workers)
            .thread_name(|i| format!("reshard-worker-{i}"))
            .build()
            .map_err(|err| ReshardError::InvalidConfig(format!("cannot start workers: {err}")))?;
        let (tx, rx) = sync_channel::<(usize, Resharded)>(options.queue_capacity);
        let window = Window::new(options.queue_capacity);
        let cursor = AtomicUsize::new(0);
        let failure = Mutex::new(None);

        let work = |tx: SyncSender<(usize, Resharded)>| -> Result<()> {
            loop {
                let index = cursor.fetch_add(1, Ordering::Relaxed);
                let Some(unit) = units.get(index) else {
                    return Ok(());
                };
                if !window.admit(index) {
                    return Ok(());
                }
                if self.cancellation.is_cancelled() {
                    return Err(ReshardError::Cancelled);
                }
                let parts = (0..source_tp)
                    .map(|rank| reader.read_parameter(rank, unit.source_pipeline_rank, &unit.source_name))
                    .collect::<Result<Vec<_>>>()?;
                let resharded = engine.reshard(&unit.global_name, unit.partition, &parts, target_tp)?;
                // The writer only hangs up after failing; its error is reported instead.
                tx.send((index, resharded)).map_err(|_| ReshardError::Cancelled)?;
            }
        };

        thread::scope(|scope| {
            let writer = scope.spawn(|| {
                let written = write_ordered(rx, units, sink, &window);
                window.close();
                written
            });

            let senders: Vec<_> = (0..options.workers).map(|_| tx.clone()).collect();
            drop(tx);
            pool.scope(|s| {
                for tx in senders {
                    let (work, window, failure) = (&work, &window, &failure);
                    s.spawn(move |_| {
                        if let Err(err) = work(tx) {
                            window.close();
                            lock(failure).get_or_insert(err);
                        }
                    });
                }
            });

            let written = match writer.join() {
                Ok(written) => written,
                Err(panic) => std::panic::resume_unwind(panic),
            };
            let failure = failure.into_inner().unwrap_or_else(PoisonError::into_inner);
            match (failure, written) {
                (_, Err(err)) => Err(err),
                (Some(err), Ok(_)) => Err(err),
                (None, Ok(None)) => Err(ReshardError::Cancelled),
                (None, Ok(Some(done))) => Ok(done),
            }
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct WindowState {
    next: usize,
    closed: bool,
}

/// Limits how far workers may run ahead of the writer.
///
/// Unit `index` may start once `index < next + capacity`, where `next` is the first unit
/// not yet written. Converted tensors waiting in the channel or the reorder buffer
/// therefore never exceed `capacity` units.
#[derive(Debug)]
struct Window {
    state: Mutex<WindowState>,
    moved: Condvar,
    capacity: usize,
}

impl Window {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(WindowState {
                next: 0,
                closed: false,
            }),
            moved: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Blocks until `index` fits in the window. Returns `false` once the window is closed.
    fn admit(&self, index: usize) -> bool {
        let mut state = lock(&self.state);
        while !state.closed && index >= state.next.saturating_add(self.capacity) {
            state = self
                .moved
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        !state.closed
    }

    /// Records that every unit before `next` has been written.
    fn advance(&self, next: usize) {
        lock(&self.state).next = next;
        self.moved.notify_all();
    }

    fn close(&self) {
        lock(&self.state).closed = true;
        self.moved.notify_all();
    }
}

type Written = (Vec<ParameterReport>, Vec<PaddingReport>, Option<ArchiveWriter>);

/// Receives converted units in any order and appends them in plan order.
///
/// Returns `Ok(None)` when the producers stopped before sending every unit.
fn write_ordered(
    rx: Receiver<(usize, Resharded)>,
    units: &[WorkUnit],
    mut sink: Option<ArchiveWriter>,
    window: &Window,
) -> Result<Option<Written>> {
    let mut pending = BTreeMap::new();
    let mut next = 0;
    let mut parameters = Vec::with_capacity(units.len());
    let mut padding = Vec::new();

    for (index, resharded) in rx {
        pending.insert(index, resharded);
        while let Some(resharded) = pending.remove(&next) {
            let unit = &units[next];
            let Resharded {
                full_shape,
                shards,
                padding: padded,
            } = resharded;

            if let Some(writer) = sink.as_mut() {
                for (tensor_rank, tensor) in shards.iter().enumerate() {
                    writer.append(tensor_rank, unit.target_pipeline_rank, &unit.target_name, tensor)?;
                }
            }
            if let Some(padded) = padded {
                log::info!(
                    "Padded `{}` from {} to {} rows",
                    unit.global_name,
                    padded.vocab_size,
                    padded.padded_rows
                );
                padding.push(PaddingReport {
                    name: unit.global_name.clone(),
                    vocab_size: padded.vocab_size,
                    padded_rows: padded.padded_rows,
                    added_rows: padded.added_rows(),
                });
            }
            log::debug!(
                "Converted `{}` {:?} -> {:?} (stage {} -> {})",
                unit.global_name,
                unit.source_shape,
                shards[0].shape(),
                unit.source_pipeline_rank,
                unit.target_pipeline_rank
            );
            parameters.push(ParameterReport {
                name: unit.global_name.clone(),
                axis: unit.partition.axis(),
                source_pipeline_rank: unit.source_pipeline_rank,
                target_pipeline_rank: unit.target_pipeline_rank,
                source_shape: unit.source_shape.clone(),
                target_shape: shards[0].shape().to_vec(),
                full_shape,
            });
            next += 1;
        }
        window.advance(next);
    }

    Ok((next == units.len()).then_some((parameters, padding, sink)))
}

/// Classifies every stored parameter and decides where it goes.
///
/// Units are ordered by target stage, then by source order, which is also the order
/// they are written in.
fn route(
    reader: &ArchiveReader,
    catalog: &ParameterCatalog,
    target: &LayerAssignment,
) -> Result<Vec<WorkUnit>> {
    let manifest = reader.manifest();
    let mut seen = HashSet::new();
    let mut units = Vec::new();

    for source_rank in 0..manifest.parallel_config.pipeline_parallel_size {
        let Some(shard) = manifest.shard(0, source_rank) else {
            continue;
        };
        for entry in &shard.parameters {
            let global_name = to_global(&entry.name, &shard.layers).ok_or_else(|| {
                ReshardError::corrupt(
                    reader.root(),
                    format!("parameter `{}` lies outside stage {source_rank}", entry.name),
                )
            })?;
            if !seen.insert(global_name.clone()) {
                return Err(ReshardError::corrupt(
                    reader.root(),
                    format!("parameter `{global_name}` is stored by more than one stage"),
                ));
            }

            let descriptor = catalog.classify(&global_name)?;
            let layer = LayerName::parse(&global_name).map(|name| name.index);
            let placed = target.owner(descriptor.anchor, layer).and_then(|rank| {
                let stage = target.stage(rank)?;
                Some((rank, to_local(&global_name, stage)?))
            });
            let Some((target_pipeline_rank, target_name)) = placed else {
                return Err(ReshardError::InvalidConfig(format!(
                    "parameter `{global_name}` has no owner among {} target stages",
                    target.num_stages()
                )));
            };

            units.push(WorkUnit {
                global_name,
                partition: descriptor.partition,
                source_name: entry.name.clone(),
                source_pipeline_rank: source_rank,
                source_shape: entry.shape.clone(),
                target_name,
                target_pipeline_rank,
            });
        }
    }

    units.sort_by_key(|unit| unit.target_pipeline_rank);
    Ok(units)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn admitted_after(window: &Window, index: usize, release: impl FnOnce()) -> (bool, bool) {
        let done = AtomicBool::new(false);
        thread::scope(|scope| {
            let waiter = scope.spawn(|| {
                let admitted = window.admit(index);
                done.store(true, Ordering::SeqCst);
                admitted
            });
            thread::sleep(Duration::from_millis(50));
            let blocked = !done.load(Ordering::SeqCst);
            release();
            (blocked, waiter.join().unwrap())
        })
    }

    #[test]
    fn test_window_admits_units_within_capacity() {
        let window = Window::new(2);

        assert!(window.admit(0));
        assert!(window.admit(1));
    }

    #[test]
    fn test_window_holds_units_until_writer_advances() {
        let window = Window::new(2);

        let (blocked, admitted) = admitted_after(&window, 2, || window.advance(1));

        assert!(blocked);
        assert!(admitted);
    }

    #[test]
    fn test_closed_window_releases_waiters() {
        let window = Window::new(1);

        let (blocked, admitted) = admitted_after(&window, 5, || window.close());

        assert!(blocked);
        assert!(!admitted);
        assert!(!window.admit(0));
    }

    #[test]
    fn test_buffered_units_never_exceed_capacity() {
        let capacity = 3;
        let total = 40;
        let window = Window::new(capacity);
        let cursor = AtomicUsize::new(0);
        let in_flight = Mutex::new(BTreeMap::new());
        let high_water = AtomicUsize::new(0);
        let (tx, rx) = sync_channel::<usize>(capacity);

        thread::scope(|scope| {
            for _ in 0..4 {
                let tx = tx.clone();
                let (window, cursor, in_flight, high_water) = (&window, &cursor, &in_flight, &high_water);
                scope.spawn(move || {
                    loop {
                        let index = cursor.fetch_add(1, Ordering::Relaxed);
                        if index >= total || !window.admit(index) {
                            return;
                        }
                        let mut pending = lock(in_flight);
                        pending.insert(index, ());
                        high_water.fetch_max(pending.len(), Ordering::SeqCst);
                        drop(pending);
                        // Unit 0 is the slow one.
                        if index == 0 {
                            thread::sleep(Duration::from_millis(30));
                        }
                        tx.send(index).unwrap();
                    }
                });
            }
            drop(tx);

            let mut buffered = BTreeMap::new();
            let mut next = 0;
            for index in rx {
                buffered.insert(index, ());
                while buffered.remove(&next).is_some() {
                    lock(&in_flight).remove(&next);
                    next += 1;
                }
                window.advance(next);
            }
            assert_eq!(next, total);
        });

        assert!(high_water.load(Ordering::SeqCst) <= capacity);
    }
}
