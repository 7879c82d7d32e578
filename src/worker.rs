use crate::candidates::{CandidateGenerator, EnumerationState};
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::control::WorkerControl;
use crate::error::BackendError;
use crate::keyspace::{hex_biguint, KeyRange};
use crate::matcher::{AddressMatcher, KeyEncoding, TargetHit, TargetId};
use crossbeam_channel::Sender;
use num_bigint::BigUint;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Cpu,
    Accelerator,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Cpu => write!(f, "cpu"),
            BackendKind::Accelerator => write!(f, "accelerator"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cpu" => Ok(BackendKind::Cpu),
            "accelerator" | "gpu" => Ok(BackendKind::Accelerator),
            other => Err(format!("unknown backend '{}' (expected cpu or accelerator)", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerStatus {
    /// Not running: not started yet, or cancelled with work left
    Idle,
    Running,
    Paused,
    Exhausted,
    Matched,
    Failed,
}

impl WorkerStatus {
    /// Whether the worker's sub-range will see no further work this session.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            WorkerStatus::Exhausted | WorkerStatus::Matched | WorkerStatus::Failed
        )
    }
}

/// A worker's own view of its progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerState {
    pub id: usize,
    pub range: KeyRange,
    pub cursor: BigUint,
    pub keys_checked: u64,
    pub status: WorkerStatus,
    pub backend: BackendKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressReport {
    pub worker_id: usize,
    pub keys_checked_delta: u64,
    /// Cumulative, including keys restored from a checkpoint
    pub keys_checked: u64,
    pub cursor: BigUint,
    pub backend: BackendKind,
}

/// The run's output when a derived address hits a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchResult {
    pub worker_id: usize,
    #[serde(with = "hex_biguint")]
    pub scalar: BigUint,
    pub derived_address: String,
    pub target_id: TargetId,
    pub target_address: String,
    pub encoding: KeyEncoding,
    /// Offset of the scalar within the worker's sub-range enumeration
    #[serde(with = "hex_biguint")]
    pub found_at: BigUint,
    pub timestamp: String,
}

#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Progress(ProgressReport),
    Matched(MatchResult),
    /// Acknowledges a pause; the checkpoint for the last batch is on disk
    Paused { worker_id: usize },
    Resumed { worker_id: usize },
    BackendFallback { worker_id: usize, error: BackendError },
    /// Always the worker's last event
    Finished { worker_id: usize, status: WorkerStatus },
}

/// Result of scanning one batch. `checked` stops at the hit when there is one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOutcome {
    pub checked: usize,
    pub hit: Option<(usize, TargetHit)>,
}

/// Execution substrate a worker derives candidates on.
pub trait SearchBackend: Send {
    fn kind(&self) -> BackendKind;

    fn scan(&mut self, batch: &[BigUint], matcher: &AddressMatcher) -> Result<ScanOutcome, BackendError>;

    /// Called with the error that made the worker give up on this backend.
    fn report_failure(&mut self, _error: &BackendError) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CpuBackend;

impl CpuBackend {
    pub fn scan_batch(batch: &[BigUint], matcher: &AddressMatcher) -> ScanOutcome {
        for (index, scalar) in batch.iter().enumerate() {
            if let Some(hit) = matcher.check_scalar(scalar) {
                return ScanOutcome {
                    checked: index + 1,
                    hit: Some((index, hit)),
                };
            }
        }
        ScanOutcome {
            checked: batch.len(),
            hit: None,
        }
    }
}

impl SearchBackend for CpuBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cpu
    }

    fn scan(&mut self, batch: &[BigUint], matcher: &AddressMatcher) -> Result<ScanOutcome, BackendError> {
        Ok(Self::scan_batch(batch, matcher))
    }
}

/// Offloads whole batches to a data-parallel device, here a dedicated
/// rayon pool shared by every accelerator-backed worker.
pub struct AcceleratorBackend {
    device: Arc<ThreadPool>,
}

impl AcceleratorBackend {
    pub fn new(device: Arc<ThreadPool>) -> Self {
        AcceleratorBackend { device }
    }
}

impl SearchBackend for AcceleratorBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Accelerator
    }

    fn scan(&mut self, batch: &[BigUint], matcher: &AddressMatcher) -> Result<ScanOutcome, BackendError> {
        let hit = self.device.install(|| {
            batch
                .par_iter()
                .enumerate()
                .find_map_first(|(index, scalar)| matcher.check_scalar(scalar).map(|hit| (index, hit)))
        });

        Ok(ScanOutcome {
            checked: hit.as_ref().map_or(batch.len(), |(index, _)| index + 1),
            hit,
        })
    }
}

/// Hands out backends to workers.
pub trait BackendProvider: Send + Sync {
    fn open(&self, kind: BackendKind, worker_id: usize) -> Result<Box<dyn SearchBackend>, BackendError>;
}

/// CPU backends, and one lazily built accelerator device for the whole process.
pub struct DefaultBackends {
    device_threads: usize,
    device: OnceLock<Result<Arc<ThreadPool>, String>>,
}

impl DefaultBackends {
    pub fn new() -> Self {
        Self::with_device_threads(
            thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        )
    }

    pub fn with_device_threads(device_threads: usize) -> Self {
        DefaultBackends {
            device_threads: device_threads.max(1),
            device: OnceLock::new(),
        }
    }

    fn device(&self) -> Result<Arc<ThreadPool>, BackendError> {
        self.device
            .get_or_init(|| {
                ThreadPoolBuilder::new()
                    .num_threads(self.device_threads)
                    .thread_name(|i| format!("accelerator-{}", i))
                    .build()
                    .map(Arc::new)
                    .map_err(|e| e.to_string())
            })
            .clone()
            .map_err(BackendError::Unavailable)
    }
}

impl Default for DefaultBackends {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendProvider for DefaultBackends {
    fn open(&self, kind: BackendKind, _worker_id: usize) -> Result<Box<dyn SearchBackend>, BackendError> {
        match kind {
            BackendKind::Cpu => Ok(Box::new(CpuBackend)),
            BackendKind::Accelerator => Ok(Box::new(AcceleratorBackend::new(self.device()?))),
        }
    }
}

/// One worker's slice of the run.
#[derive(Debug, Clone)]
pub struct WorkerAssignment {
    pub worker_id: usize,
    pub range: KeyRange,
    pub enumeration: EnumerationState,
    /// Offset to resume from; zero for a fresh sub-range
    pub cursor: BigUint,
    pub keys_checked: u64,
    pub backend: BackendKind,
}

impl WorkerAssignment {
    pub fn fresh(worker_id: usize, range: KeyRange, enumeration: EnumerationState, backend: BackendKind) -> Self {
        WorkerAssignment {
            worker_id,
            range,
            enumeration,
            cursor: BigUint::default(),
            keys_checked: 0,
            backend,
        }
    }

    pub fn from_checkpoint(checkpoint: Checkpoint, backend: BackendKind) -> Self {
        WorkerAssignment {
            worker_id: checkpoint.worker_id,
            range: checkpoint.range,
            enumeration: checkpoint.enumeration,
            cursor: checkpoint.cursor,
            keys_checked: checkpoint.keys_checked,
            backend,
        }
    }
}

/// What every worker of a session shares.
pub struct WorkerContext {
    pub matcher: Arc<AddressMatcher>,
    pub backends: Arc<dyn BackendProvider>,
    pub store: Option<CheckpointStore>,
    pub control: Arc<WorkerControl>,
    pub events: Sender<WorkerEvent>,
    pub batch_size: usize,
    pub progress_interval: Duration,
    pub checkpoint_interval: Duration,
}

/// Sends `Finished { Failed }` if the worker thread unwinds before reporting.
struct FinishGuard {
    worker_id: usize,
    events: Sender<WorkerEvent>,
    done: bool,
}

impl FinishGuard {
    fn finish(mut self, status: WorkerStatus) {
        self.done = true;
        let _ = self.events.send(WorkerEvent::Finished {
            worker_id: self.worker_id,
            status,
        });
    }
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        if !self.done {
            warn!(worker = self.worker_id, "worker thread died without finishing");
            let _ = self.events.send(WorkerEvent::Finished {
                worker_id: self.worker_id,
                status: WorkerStatus::Failed,
            });
        }
    }
}

struct Worker {
    id: usize,
    generator: CandidateGenerator,
    cursor: BigUint,
    keys_checked: u64,
    reported_keys: u64,
    backend: Box<dyn SearchBackend>,
    ctx: Arc<WorkerContext>,
    last_report: Instant,
    last_checkpoint: Instant,
}

impl Worker {
    fn start(assignment: WorkerAssignment, ctx: Arc<WorkerContext>) -> Self {
        let id = assignment.worker_id;
        let backend = match ctx.backends.open(assignment.backend, id) {
            Ok(backend) => backend,
            Err(error) => {
                warn!(worker = id, %error, "backend unavailable, falling back to CPU");
                let _ = ctx.events.send(WorkerEvent::BackendFallback { worker_id: id, error });
                Box::new(CpuBackend)
            }
        };

        let generator = CandidateGenerator::resume(
            assignment.range,
            assignment.enumeration,
            assignment.cursor,
        );
        let now = Instant::now();

        Worker {
            id,
            cursor: generator.offset().clone(),
            generator,
            keys_checked: assignment.keys_checked,
            reported_keys: assignment.keys_checked,
            backend,
            ctx,
            last_report: now,
            last_checkpoint: now,
        }
    }

    fn run(&mut self) -> WorkerStatus {
        debug!(worker = self.id, range = %self.generator.range(), backend = %self.backend.kind(), "worker started");

        loop {
            if self.ctx.control.is_retired(self.id) {
                self.flush();
                warn!(worker = self.id, keys = self.keys_checked, "worker retired, remaining keys left for resume");
                return WorkerStatus::Failed;
            }
            if self.ctx.control.is_cancelled() {
                self.flush();
                return WorkerStatus::Idle;
            }

            if self.ctx.control.gate.is_paused() {
                self.flush();
                let _ = self.ctx.events.send(WorkerEvent::Paused { worker_id: self.id });
                self.ctx.control.gate.wait_while_paused(&self.ctx.control.cancel);
                if !self.ctx.control.is_cancelled() {
                    let _ = self.ctx.events.send(WorkerEvent::Resumed { worker_id: self.id });
                    self.last_report = Instant::now();
                }
                continue;
            }

            let base = self.generator.offset().clone();
            let batch = self.generator.next_batch(self.ctx.batch_size);
            if batch.is_empty() {
                self.flush();
                debug!(worker = self.id, keys = self.keys_checked, "sub-range exhausted");
                return WorkerStatus::Exhausted;
            }

            let outcome = self.scan(&batch);
            self.keys_checked += outcome.checked as u64;
            self.cursor = &base + outcome.checked;

            if let Some((index, hit)) = outcome.hit {
                let result = MatchResult {
                    worker_id: self.id,
                    scalar: batch[index].clone(),
                    derived_address: hit.derived_address,
                    target_id: hit.target_id,
                    target_address: self
                        .ctx
                        .matcher
                        .target(hit.target_id)
                        .map(|t| t.address.clone())
                        .unwrap_or_default(),
                    encoding: hit.encoding,
                    found_at: &base + index,
                    timestamp: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
                };
                info!(worker = self.id, scalar = %format!("{:#x}", result.scalar), "match found");
                // the checkpoint cursor stays on the hit so a rerun reaches it again
                self.cursor = result.found_at.clone();
                let _ = self.ctx.events.send(WorkerEvent::Matched(result));
                self.flush();
                return WorkerStatus::Matched;
            }

            if self.last_report.elapsed() >= self.ctx.progress_interval {
                self.report_progress();
            }
            if self.last_checkpoint.elapsed() >= self.ctx.checkpoint_interval {
                self.save_checkpoint();
            }
        }
    }

    fn scan(&mut self, batch: &[BigUint]) -> ScanOutcome {
        match self.backend.scan(batch, &self.ctx.matcher) {
            Ok(outcome) => outcome,
            Err(error) => {
                self.backend.report_failure(&error);
                warn!(worker = self.id, from = %self.backend.kind(), %error, "backend failed, falling back to CPU");
                let _ = self.ctx.events.send(WorkerEvent::BackendFallback {
                    worker_id: self.id,
                    error,
                });
                self.backend = Box::new(CpuBackend);
                CpuBackend::scan_batch(batch, &self.ctx.matcher)
            }
        }
    }

    fn report_progress(&mut self) {
        let report = ProgressReport {
            worker_id: self.id,
            keys_checked_delta: self.keys_checked - self.reported_keys,
            keys_checked: self.keys_checked,
            cursor: self.cursor.clone(),
            backend: self.backend.kind(),
        };
        let _ = self.ctx.events.send(WorkerEvent::Progress(report));
        self.reported_keys = self.keys_checked;
        self.last_report = Instant::now();
    }

    fn save_checkpoint(&mut self) {
        if let Some(store) = &self.ctx.store {
            let checkpoint = Checkpoint::from_state(&self.state(WorkerStatus::Running), self.generator.state().clone());
            if let Err(e) = store.save(&checkpoint) {
                warn!(worker = self.id, error = %e, "failed to save checkpoint");
            }
        }
        self.last_checkpoint = Instant::now();
    }

    fn flush(&mut self) {
        self.report_progress();
        self.save_checkpoint();
    }

    fn state(&self, status: WorkerStatus) -> WorkerState {
        WorkerState {
            id: self.id,
            range: self.generator.range().clone(),
            cursor: self.cursor.clone(),
            keys_checked: self.keys_checked,
            status,
            backend: self.backend.kind(),
        }
    }
}

/// The worker threads of one session.
pub struct WorkerPool {
    handles: Vec<JoinHandle<WorkerState>>,
}

impl WorkerPool {
    /// Spawn one thread per assignment. On failure the already-spawned
    /// workers are cancelled before the error is returned.
    pub fn spawn(assignments: Vec<WorkerAssignment>, ctx: Arc<WorkerContext>) -> std::io::Result<Self> {
        let mut handles = Vec::with_capacity(assignments.len());

        for assignment in assignments {
            let worker_ctx = ctx.clone();
            let id = assignment.worker_id;
            let spawned = thread::Builder::new()
                .name(format!("worker-{}", id))
                .spawn(move || {
                    let guard = FinishGuard {
                        worker_id: id,
                        events: worker_ctx.events.clone(),
                        done: false,
                    };
                    let mut worker = Worker::start(assignment, worker_ctx);
                    let status = worker.run();
                    guard.finish(status);
                    worker.state(status)
                });

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    ctx.control.cancel();
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(e);
                }
            }
        }

        Ok(WorkerPool { handles })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker; panicked workers are left out.
    pub fn join(self) -> Vec<WorkerState> {
        self.handles
            .into_iter()
            .filter_map(|handle| handle.join().ok())
            .collect()
    }
}
