//! Session lifecycle: validates a [`SearchConfig`], plans worker assignments
//! (resuming from checkpoints when a session directory already exists), runs
//! the workers and resolves how the session ends.
//!
//! One coordinator thread per session drains worker events, feeds the
//! [`ProgressAggregator`] and publishes [`SessionEvent`]s to subscribers.

use crate::candidates::{EnumerationMode, EnumerationState};
use crate::checkpoint::{Checkpoint, CheckpointStore, SessionManifest};
use crate::config::SearchConfig;
use crate::control::WorkerControl;
use crate::error::{CheckpointError, ConfigError};
use crate::keyspace::{partition, repartition, KeyRange};
use crate::matcher::{target_fingerprint, AddressMatcher, KeyDeriver, Secp256k1Deriver};
use crate::progress::{ProgressAggregator, ProgressSnapshot, WorkerSnapshot};
use crate::worker::{
    BackendKind, BackendProvider, DefaultBackends, MatchResult, WorkerAssignment, WorkerContext, WorkerEvent,
    WorkerPool, WorkerStatus,
};
use crossbeam_channel::{select, tick, unbounded, Receiver, Sender};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Running,
    Paused,
    Stopped,
    CompletedNoMatch,
    CompletedMatched,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Stopped
                | SessionStatus::CompletedNoMatch
                | SessionStatus::CompletedMatched
                | SessionStatus::Failed
        )
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    Matched(MatchResult),
    NoMatch,
    Stopped,
    /// Some workers failed; their unscanned remainder is still on disk
    Failed(String),
}

impl SessionOutcome {
    pub fn status(&self) -> SessionStatus {
        match self {
            SessionOutcome::Matched(_) => SessionStatus::CompletedMatched,
            SessionOutcome::NoMatch => SessionStatus::CompletedNoMatch,
            SessionOutcome::Stopped => SessionStatus::Stopped,
            SessionOutcome::Failed(_) => SessionStatus::Failed,
        }
    }

    fn event(&self) -> SessionEvent {
        match self {
            SessionOutcome::Matched(result) => SessionEvent::Matched(result.clone()),
            SessionOutcome::NoMatch => SessionEvent::CompletedNoMatch,
            SessionOutcome::Stopped => SessionEvent::Stopped,
            SessionOutcome::Failed(reason) => SessionEvent::Failed(reason.clone()),
        }
    }
}

/// What subscribers receive. Every subscriber sees exactly one terminal event.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Progress(ProgressSnapshot),
    Warning(String),
    Matched(MatchResult),
    CompletedNoMatch,
    Stopped,
    Failed(String),
}

impl SessionEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionEvent::Progress(_) | SessionEvent::Warning(_))
    }
}

/// Entry point of the library: owns the derivation primitive and the backend
/// provider shared by every session it starts.
#[derive(Clone)]
pub struct SearchController {
    deriver: Arc<dyn KeyDeriver>,
    backends: Arc<dyn BackendProvider>,
}

impl Default for SearchController {
    fn default() -> Self {
        SearchController {
            deriver: Arc::new(Secp256k1Deriver),
            backends: Arc::new(DefaultBackends::new()),
        }
    }
}

impl SearchController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deriver(mut self, deriver: Arc<dyn KeyDeriver>) -> Self {
        self.deriver = deriver;
        self
    }

    pub fn with_backends(mut self, backends: Arc<dyn BackendProvider>) -> Self {
        self.backends = backends;
        self
    }

    /// Validate `config`, plan the workers and start them.
    ///
    /// Every error is returned before any worker thread exists.
    pub fn start(&self, config: SearchConfig) -> Result<SessionHandle, ConfigError> {
        let range = config.validate()?;
        let matcher = Arc::new(AddressMatcher::from_addresses(
            &config.targets,
            config.encoding,
            self.deriver.clone(),
        )?);

        let session_id = config.resolved_session_id();
        let store = match &config.checkpoint_dir {
            Some(root) => Some(CheckpointStore::open(root, &session_id)?),
            None => None,
        };

        let fingerprint = target_fingerprint(matcher.targets());
        let plan = match &store {
            Some(store) => plan_resumable(&config, &range, &session_id, &fingerprint, store)?,
            None => plan_fresh(&config, &range, config.seed.unwrap_or_else(rand::random))?,
        };
        if let (Some(store), Some(manifest)) = (&store, &plan.manifest) {
            store.save_manifest(manifest)?;
        }

        let snapshots = plan
            .assignments
            .iter()
            .map(|a| WorkerSnapshot {
                worker_id: a.worker_id,
                range: a.range.clone(),
                cursor: a.cursor.clone(),
                keys_checked: a.keys_checked,
                status: WorkerStatus::Running,
                backend: a.backend,
            })
            .collect();
        let mut aggregator = ProgressAggregator::new(snapshots, &range.width(), plan.resumed_keys_checked);

        let control = Arc::new(WorkerControl::new());
        if let Some(result) = plan.recorded_match {
            info!(
                session = %session_id,
                scalar = %format!("{:#x}", result.scalar),
                address = %result.derived_address,
                "session already matched, not searching again"
            );
            for id in 0..aggregator.worker_count() {
                aggregator.set_status(id, WorkerStatus::Idle);
            }
            aggregator.set_status(result.worker_id, WorkerStatus::Matched);

            let mut state = SessionState::new(aggregator);
            state.finalize(SessionOutcome::Matched(result));
            state.done = true;
            return Ok(SessionHandle {
                session_id,
                store,
                pause_timeout: config.pause_timeout,
                control,
                shared: Arc::new(SessionShared {
                    state: Mutex::new(state),
                    changed: Condvar::new(),
                }),
            });
        }

        info!(
            session = %session_id,
            range = %range,
            workers = plan.assignments.len(),
            backend = %config.backend,
            mode = ?config.enumeration,
            resumed_keys = plan.resumed_keys_checked,
            "starting search"
        );

        let (events_tx, events_rx) = unbounded();
        let ctx = Arc::new(WorkerContext {
            matcher,
            backends: self.backends.clone(),
            store: store.clone(),
            control: control.clone(),
            events: events_tx,
            batch_size: config.batch_size,
            progress_interval: config.progress_interval,
            checkpoint_interval: config.checkpoint_interval,
        });

        let pool = WorkerPool::spawn(plan.assignments, ctx).map_err(ConfigError::Spawn)?;
        let shared = Arc::new(SessionShared {
            state: Mutex::new(SessionState::new(aggregator)),
            changed: Condvar::new(),
        });

        let coordinator = Coordinator {
            shared: shared.clone(),
            control: control.clone(),
            store: store.clone(),
            events: events_rx,
            report_interval: config.report_interval.max(Duration::from_millis(1)),
        };
        let spawned = thread::Builder::new()
            .name(format!("coordinator-{}", session_id))
            .spawn(move || coordinator.run(pool));
        if let Err(e) = spawned {
            control.cancel();
            return Err(ConfigError::Spawn(e));
        }

        Ok(SessionHandle {
            session_id,
            store,
            pause_timeout: config.pause_timeout,
            control,
            shared,
        })
    }
}

struct SessionPlan {
    assignments: Vec<WorkerAssignment>,
    resumed_keys_checked: u64,
    manifest: Option<SessionManifest>,
    /// Match saved by an earlier run of the same search
    recorded_match: Option<MatchResult>,
}

fn fresh_assignments(
    layout: &[KeyRange],
    mode: EnumerationMode,
    seed: u64,
    backend: BackendKind,
) -> Vec<WorkerAssignment> {
    layout
        .iter()
        .enumerate()
        .map(|(id, sub)| {
            let state = EnumerationState::for_worker(mode, sub, seed, id);
            WorkerAssignment::fresh(id, sub.clone(), state, backend)
        })
        .collect()
}

fn plan_fresh(config: &SearchConfig, range: &KeyRange, seed: u64) -> Result<SessionPlan, ConfigError> {
    let layout = partition(range, config.worker_count)?;
    Ok(SessionPlan {
        assignments: fresh_assignments(&layout, config.enumeration, seed, config.backend),
        resumed_keys_checked: 0,
        manifest: None,
        recorded_match: None,
    })
}

/// Checkpoint of `worker_id` if it belongs to `sub` under `mode`; anything
/// unreadable or mismatched is treated as absent.
fn load_matching(store: &CheckpointStore, worker_id: usize, sub: &KeyRange, mode: EnumerationMode) -> Option<Checkpoint> {
    match store.load(worker_id) {
        Ok(Some(checkpoint)) if checkpoint.range == *sub && checkpoint.enumeration.mode() == mode => Some(checkpoint),
        Ok(Some(checkpoint)) => {
            warn!(
                worker = worker_id,
                saved = %checkpoint.range,
                expected = %sub,
                "checkpoint does not match the session layout, ignoring it"
            );
            None
        }
        Ok(None) => None,
        Err(e @ CheckpointError::Corrupt { .. }) => {
            warn!(worker = worker_id, error = %e, "treating corrupt checkpoint as absent");
            None
        }
        Err(e) => {
            warn!(worker = worker_id, error = %e, "could not read checkpoint, treating it as absent");
            None
        }
    }
}

/// Assignments for `layout`, seeded from whatever checkpoints match it.
fn resume_layout(
    store: &CheckpointStore,
    layout: &[KeyRange],
    mode: EnumerationMode,
    seed: u64,
    backend: BackendKind,
) -> (Vec<WorkerAssignment>, u64) {
    let mut resumed = 0u64;
    let assignments = layout
        .iter()
        .enumerate()
        .map(|(id, sub)| match load_matching(store, id, sub, mode) {
            Some(checkpoint) => {
                debug!(worker = id, cursor = %format!("{:#x}", checkpoint.cursor), "resuming from checkpoint");
                resumed += checkpoint.keys_checked;
                WorkerAssignment::from_checkpoint(checkpoint, backend)
            }
            None => {
                let state = EnumerationState::for_worker(mode, sub, seed, id);
                WorkerAssignment::fresh(id, sub.clone(), state, backend)
            }
        })
        .collect();
    (assignments, resumed)
}

fn plan_resumable(
    config: &SearchConfig,
    range: &KeyRange,
    session_id: &str,
    fingerprint: &[String],
    store: &CheckpointStore,
) -> Result<SessionPlan, ConfigError> {
    let saved = match store.load_manifest() {
        Ok(manifest) => manifest,
        Err(e) => {
            warn!(session = session_id, error = %e, "ignoring unreadable session manifest");
            None
        }
    };

    let manifest = match saved {
        Some(manifest) if manifest.target_set == fingerprint && manifest.config.same_search(config) => manifest,
        other => {
            if other.is_some() {
                warn!(session = session_id, "saved session covers a different search, starting over");
            }
            store.clear()?;
            let seed = config.seed.unwrap_or_else(rand::random);
            let mut plan = plan_fresh(config, range, seed)?;
            let mut manifest = SessionManifest::new(session_id, config.clone(), seed, plan.assignments.len());
            manifest.worker_ranges = plan.assignments.iter().map(|a| a.range.clone()).collect();
            manifest.target_set = fingerprint.to_vec();
            plan.manifest = Some(manifest);
            return Ok(plan);
        }
    };

    let mode = config.enumeration;
    let old_layout = if manifest.worker_ranges.len() == manifest.worker_count && manifest.worker_count > 0 {
        manifest.worker_ranges.clone()
    } else {
        partition(range, manifest.worker_count)?
    };

    if let Some(result) = store.load_match()? {
        let (assignments, resumed) = resume_layout(store, &old_layout, mode, manifest.seed, config.backend);
        return Ok(SessionPlan {
            assignments,
            resumed_keys_checked: manifest.carried_keys_checked + resumed,
            manifest: None,
            recorded_match: Some(result),
        });
    }

    let mut next = manifest.clone();
    next.config = config.clone();

    if manifest.worker_count == config.worker_count {
        let (assignments, resumed) = resume_layout(store, &old_layout, mode, manifest.seed, config.backend);
        next.worker_ranges = old_layout;
        return Ok(SessionPlan {
            assignments,
            resumed_keys_checked: manifest.carried_keys_checked + resumed,
            manifest: Some(next),
            recorded_match: None,
        });
    }

    if mode == EnumerationMode::StridedRandom {
        return Err(ConfigError::WorkerCountMismatch {
            saved: manifest.worker_count,
            requested: config.worker_count,
        });
    }

    // Sequential: re-split what is left after the lowest unfinished position.
    let mut carried = manifest.carried_keys_checked;
    let mut positions = Vec::with_capacity(old_layout.len());
    for (id, sub) in old_layout.iter().enumerate() {
        match load_matching(store, id, sub, mode) {
            Some(checkpoint) => {
                carried += checkpoint.keys_checked;
                if !checkpoint.exhausted && checkpoint.cursor < sub.width() {
                    positions.push(checkpoint.position());
                }
            }
            None => positions.push(sub.start.clone()),
        }
    }

    let layout = repartition(&positions, &range.end, config.worker_count)?;
    if layout.is_empty() {
        info!(session = session_id, "nothing left to search, keeping the saved layout");
        let (assignments, resumed) = resume_layout(store, &old_layout, mode, manifest.seed, config.backend);
        next.worker_ranges = old_layout;
        return Ok(SessionPlan {
            assignments,
            resumed_keys_checked: manifest.carried_keys_checked + resumed,
            manifest: Some(next),
            recorded_match: None,
        });
    }

    info!(
        session = session_id,
        from = manifest.worker_count,
        to = config.worker_count,
        remainder_start = %format!("{:#x}", layout[0].start),
        "worker count changed, repartitioning the remainder"
    );

    for id in store.worker_ids()? {
        store.remove(id)?;
    }
    let assignments = fresh_assignments(&layout, mode, manifest.seed, config.backend);
    for assignment in &assignments {
        store.save(&Checkpoint::new(
            assignment.worker_id,
            assignment.range.clone(),
            assignment.cursor.clone(),
            0,
            false,
            assignment.enumeration.clone(),
        ))?;
    }

    next.worker_count = config.worker_count;
    next.worker_ranges = layout;
    next.carried_keys_checked = carried;
    Ok(SessionPlan {
        assignments,
        resumed_keys_checked: carried,
        manifest: Some(next),
        recorded_match: None,
    })
}

struct SessionState {
    status: SessionStatus,
    aggregator: ProgressAggregator,
    outcome: Option<SessionOutcome>,
    subscribers: Vec<Sender<SessionEvent>>,
    /// Workers that acknowledged the current pause
    acked: HashSet<usize>,
    finished: HashSet<usize>,
    /// Workers retired after missing a pause deadline
    timed_out: HashSet<usize>,
    stop_requested: bool,
    /// Every worker has been joined
    done: bool,
}

impl SessionState {
    fn new(aggregator: ProgressAggregator) -> Self {
        SessionState {
            status: SessionStatus::Running,
            aggregator,
            outcome: None,
            subscribers: Vec::new(),
            acked: HashSet::new(),
            finished: HashSet::new(),
            timed_out: HashSet::new(),
            stop_requested: false,
            done: false,
        }
    }

    fn broadcast(&mut self, event: SessionEvent) {
        self.subscribers.retain(|s| s.send(event.clone()).is_ok());
    }

    /// Record the outcome and emit the terminal event; first caller wins.
    fn finalize(&mut self, outcome: SessionOutcome) {
        if self.outcome.is_some() {
            return;
        }
        self.status = outcome.status();
        let event = outcome.event();
        self.outcome = Some(outcome);
        self.broadcast(event);
        self.subscribers.clear();
    }

    fn awaiting_pause_ack(&self) -> Vec<usize> {
        (0..self.aggregator.worker_count())
            .filter(|id| !self.acked.contains(id) && !self.finished.contains(id) && !self.timed_out.contains(id))
            .collect()
    }
}

struct SessionShared {
    state: Mutex<SessionState>,
    changed: Condvar,
}

impl SessionShared {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Coordinator {
    shared: Arc<SessionShared>,
    control: Arc<WorkerControl>,
    store: Option<CheckpointStore>,
    events: Receiver<WorkerEvent>,
    report_interval: Duration,
}

impl Coordinator {
    fn run(self, pool: WorkerPool) {
        let ticker = tick(self.report_interval);
        let worker_count = pool.len();

        while worker_count > 0 {
            select! {
                recv(self.events) -> event => match event {
                    Ok(event) => {
                        if self.apply(event, worker_count) {
                            break;
                        }
                    }
                    Err(_) => break,
                },
                recv(ticker) -> _ => self.publish_progress(),
            }
        }

        pool.join();

        let mut state = self.shared.lock();
        if state.outcome.is_none() {
            let exhausted = state.aggregator.count_where(|s| s == WorkerStatus::Exhausted);
            let outcome = if exhausted == worker_count {
                SessionOutcome::NoMatch
            } else if state.stop_requested {
                SessionOutcome::Stopped
            } else {
                let failed = state.aggregator.count_where(|s| s == WorkerStatus::Failed);
                SessionOutcome::Failed(format!(
                    "{} of {} workers failed; their remaining keys can be resumed",
                    failed, worker_count
                ))
            };
            let snapshot = state.aggregator.snapshot();
            state.broadcast(SessionEvent::Progress(snapshot));
            info!(outcome = ?outcome.status(), keys = state.aggregator.total_keys_checked(), "session finished");
            state.finalize(outcome);
        }
        state.done = true;
        drop(state);
        self.shared.changed.notify_all();
    }

    /// Returns `true` once every worker has finished.
    fn apply(&self, event: WorkerEvent, worker_count: usize) -> bool {
        let mut state = self.shared.lock();

        match event {
            WorkerEvent::Progress(report) => state.aggregator.record(&report),
            WorkerEvent::Matched(result) => {
                state.aggregator.set_status(result.worker_id, WorkerStatus::Matched);
                // a match landing after a timed-out stop is still recorded on disk
                if !matches!(state.outcome, Some(SessionOutcome::Matched(_))) {
                    if let Some(store) = &self.store {
                        if let Err(e) = store.save_match(&result) {
                            warn!(error = %e, "failed to record the match in the session directory");
                        }
                    }
                }
                if state.outcome.is_none() {
                    info!(
                        worker = result.worker_id,
                        scalar = %format!("{:#x}", result.scalar),
                        address = %result.derived_address,
                        "target matched, stopping workers"
                    );
                    self.control.cancel();
                    state.finalize(SessionOutcome::Matched(result));
                } else {
                    warn!(
                        worker = result.worker_id,
                        scalar = %format!("{:#x}", result.scalar),
                        address = %result.derived_address,
                        "additional match after the session ended"
                    );
                }
            }
            WorkerEvent::Paused { worker_id } => {
                if !state.timed_out.contains(&worker_id) {
                    state.acked.insert(worker_id);
                    state.aggregator.set_status(worker_id, WorkerStatus::Paused);
                }
            }
            WorkerEvent::Resumed { worker_id } => {
                if !state.timed_out.contains(&worker_id) {
                    state.aggregator.set_status(worker_id, WorkerStatus::Running);
                }
            }
            WorkerEvent::BackendFallback { worker_id, error } => {
                state.broadcast(SessionEvent::Warning(format!(
                    "worker {} fell back to the CPU backend: {}",
                    worker_id, error
                )));
            }
            WorkerEvent::Finished { worker_id, status } => {
                state.finished.insert(worker_id);
                state.aggregator.set_status(worker_id, status);
                debug!(worker = worker_id, status = ?status, "worker finished");
            }
        }

        let all_finished = state.finished.len() >= worker_count;
        drop(state);
        self.shared.changed.notify_all();
        all_finished
    }

    fn publish_progress(&self) {
        let mut state = self.shared.lock();
        if state.outcome.is_none() && !state.subscribers.is_empty() {
            let snapshot = state.aggregator.snapshot();
            state.broadcast(SessionEvent::Progress(snapshot));
        }
    }
}

/// Control surface of one running session.
///
/// Dropping the handle cancels the session; workers still flush their
/// checkpoints in the background.
pub struct SessionHandle {
    session_id: String,
    store: Option<CheckpointStore>,
    pause_timeout: Duration,
    control: Arc<WorkerControl>,
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Directory holding this session's checkpoints, if persistence is on.
    pub fn checkpoint_dir(&self) -> Option<&Path> {
        self.store.as_ref().map(|s| s.dir())
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.lock().status
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.shared.lock().aggregator.snapshot()
    }

    pub fn outcome(&self) -> Option<SessionOutcome> {
        self.shared.lock().outcome.clone()
    }

    /// New event stream. A subscriber arriving after the end gets the
    /// terminal event straight away.
    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        let (tx, rx) = unbounded();
        let mut state = self.shared.lock();
        match &state.outcome {
            Some(outcome) => {
                let _ = tx.send(outcome.event());
            }
            None => state.subscribers.push(tx),
        }
        rx
    }

    /// Park every worker at its next batch boundary.
    ///
    /// Blocks until each live worker has saved its checkpoint and acknowledged,
    /// or the pause timeout elapses; stragglers are marked failed and retired. Does nothing
    /// unless the session is running.
    pub fn pause(&self) -> SessionStatus {
        let mut state = self.shared.lock();
        if state.status != SessionStatus::Running {
            return state.status;
        }

        state.status = SessionStatus::Paused;
        state.acked.clear();
        self.control.gate.pause();

        let deadline = Instant::now() + self.pause_timeout;
        loop {
            let waiting = state.awaiting_pause_ack();
            if waiting.is_empty() || state.outcome.is_some() {
                break;
            }

            let now = Instant::now();
            if now >= deadline {
                for id in waiting {
                    warn!(worker = id, timeout = ?self.pause_timeout, "worker did not acknowledge pause, retiring it");
                    self.control.retire(id);
                    state.timed_out.insert(id);
                    state.aggregator.set_status(id, WorkerStatus::Failed);
                    state.broadcast(SessionEvent::Warning(format!(
                        "worker {} did not acknowledge pause within {:?} and was marked failed",
                        id, self.pause_timeout
                    )));
                }
                break;
            }

            state = self
                .shared
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        debug!(session = %self.session_id, acked = state.acked.len(), "session paused");
        state.status
    }

    /// Release paused workers. Does nothing unless the session is paused.
    pub fn resume(&self) -> SessionStatus {
        let mut state = self.shared.lock();
        if state.status == SessionStatus::Paused {
            state.status = SessionStatus::Running;
            self.control.gate.resume();
            debug!(session = %self.session_id, "session resumed");
        }
        state.status
    }

    /// Cancel every worker and wait for them to flush, at most the pause
    /// timeout. Idempotent; a session that already ended keeps its outcome.
    pub fn stop(&self) -> SessionStatus {
        {
            let mut state = self.shared.lock();
            if state.outcome.is_some() && state.done {
                return state.status;
            }
            state.stop_requested = true;
        }
        self.control.cancel();

        let state = self.shared.lock();
        let (mut state, _) = self
            .shared
            .changed
            .wait_timeout_while(state, self.pause_timeout, |s| !s.done)
            .unwrap_or_else(PoisonError::into_inner);

        if !state.done {
            warn!(session = %self.session_id, timeout = ?self.pause_timeout, "workers still running after stop timeout");
        }
        state.finalize(SessionOutcome::Stopped);
        state.status
    }

    /// Block until every worker has exited, up to `timeout`.
    pub fn wait(&self, timeout: Duration) -> Option<SessionOutcome> {
        let state = self.shared.lock();
        let (state, _) = self
            .shared
            .changed
            .wait_timeout_while(state, timeout, |s| !s.done)
            .unwrap_or_else(PoisonError::into_inner);
        if state.done {
            state.outcome.clone()
        } else {
            None
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        if !state.done {
            state.stop_requested = true;
            drop(state);
            self.control.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::{AddressFormat, KeyEncoding};
    use num_bigint::BigUint;

    const FAR_TARGET: &str = "1PWo3JeB9jrGwfHDNpdGK54CRas7fsVzXU";

    fn address_of(scalar: u32) -> String {
        let matcher = AddressMatcher::from_addresses(&[FAR_TARGET], Default::default(), Arc::new(Secp256k1Deriver)).unwrap();
        matcher
            .derive(&BigUint::from(scalar), KeyEncoding::Compressed, AddressFormat::P2pkh)
            .unwrap()
    }

    fn config(start: &str, end: &str, workers: usize, dir: Option<&Path>) -> SearchConfig {
        SearchConfig {
            targets: vec![FAR_TARGET.to_string()],
            range_start: start.to_string(),
            range_end: end.to_string(),
            worker_count: workers,
            batch_size: 8,
            checkpoint_interval: Duration::from_millis(10),
            progress_interval: Duration::from_millis(5),
            report_interval: Duration::from_millis(5),
            pause_timeout: Duration::from_secs(10),
            checkpoint_dir: dir.map(Path::to_path_buf),
            session_id: Some("unit".to_string()),
            seed: Some(7),
            ..SearchConfig::default()
        }
    }

    #[test]
    fn test_start_rejects_bad_config() {
        let controller = SearchController::new();

        let mut bad = config("0x0", "0x10", 2, None);
        bad.targets = vec!["3J98t1WpEZ73CNmQviecrnyiWrnqRhWNLy".to_string()];
        assert!(matches!(controller.start(bad), Err(ConfigError::InvalidTarget { .. })));

        let too_narrow = config("0x0", "0x3", 4, None);
        assert!(matches!(controller.start(too_narrow), Err(ConfigError::Partition(_))));

        let zero = config("0x0", "0x10", 0, None);
        assert!(matches!(controller.start(zero), Err(ConfigError::ZeroWorkers)));
    }

    #[test]
    fn test_no_match_exhausts_every_worker() {
        let session = SearchController::new().start(config("0x0", "0x40", 3, None)).unwrap();
        let events = session.subscribe();

        assert_eq!(session.wait(Duration::from_secs(30)), Some(SessionOutcome::NoMatch));
        assert_eq!(session.status(), SessionStatus::CompletedNoMatch);
        assert_eq!(session.snapshot().total_keys_checked, 64);

        let terminal: Vec<_> = events.try_iter().filter(|e| e.is_terminal()).collect();
        assert_eq!(terminal.len(), 1);
        assert!(matches!(terminal[0], SessionEvent::CompletedNoMatch));
    }

    #[test]
    fn test_late_subscriber_gets_terminal_event() {
        let mut cfg = config("0x0", "0x40", 2, None);
        cfg.targets = vec![address_of(3)];
        let session = SearchController::new().start(cfg).unwrap();
        session.wait(Duration::from_secs(30)).unwrap();

        let events = session.subscribe();
        match events.try_recv().unwrap() {
            SessionEvent::Matched(result) => assert_eq!(result.scalar, BigUint::from(3u32)),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_stop_after_completion_keeps_outcome() {
        let session = SearchController::new().start(config("0x0", "0x20", 2, None)).unwrap();
        session.wait(Duration::from_secs(30)).unwrap();
        assert_eq!(session.stop(), SessionStatus::CompletedNoMatch);
        assert_eq!(session.pause(), SessionStatus::CompletedNoMatch);
        assert_eq!(session.resume(), SessionStatus::CompletedNoMatch);
    }

    #[test]
    fn test_changed_range_discards_old_session() {
        let dir = tempfile::tempdir().unwrap();
        let first = SearchController::new().start(config("0x0", "0x40", 2, Some(dir.path()))).unwrap();
        first.wait(Duration::from_secs(30)).unwrap();

        let second = SearchController::new().start(config("0x0", "0x80", 2, Some(dir.path()))).unwrap();
        assert_eq!(second.wait(Duration::from_secs(30)), Some(SessionOutcome::NoMatch));
        let snapshot = second.snapshot();
        assert_eq!(snapshot.resumed_keys_checked, 0);
        assert_eq!(snapshot.total_keys_checked, 128);
    }

    #[test]
    fn test_strided_resume_requires_same_worker_count() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config("0x0", "0x40", 2, Some(dir.path()));
        cfg.enumeration = EnumerationMode::StridedRandom;
        let first = SearchController::new().start(cfg.clone()).unwrap();
        first.wait(Duration::from_secs(30)).unwrap();

        cfg.worker_count = 3;
        assert!(matches!(
            SearchController::new().start(cfg),
            Err(ConfigError::WorkerCountMismatch { saved: 2, requested: 3 })
        ));
    }

    #[test]
    fn test_exhausted_session_resumes_to_no_match() {
        let dir = tempfile::tempdir().unwrap();
        let first = SearchController::new().start(config("0x0", "0x40", 2, Some(dir.path()))).unwrap();
        first.wait(Duration::from_secs(30)).unwrap();

        let second = SearchController::new().start(config("0x0", "0x40", 4, Some(dir.path()))).unwrap();
        assert_eq!(second.wait(Duration::from_secs(30)), Some(SessionOutcome::NoMatch));
        let snapshot = second.snapshot();
        assert_eq!(snapshot.total_keys_checked, 0);
        assert_eq!(snapshot.resumed_keys_checked, 64);
    }
}
