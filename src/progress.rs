use crate::keyspace::KeyRange;
use crate::worker::{BackendKind, ProgressReport, WorkerStatus};
use num_bigint::BigUint;
use num_traits::ToPrimitive;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub const DEFAULT_RATE_WINDOW: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSnapshot {
    pub worker_id: usize,
    pub range: KeyRange,
    pub cursor: BigUint,
    pub keys_checked: u64,
    pub status: WorkerStatus,
    pub backend: BackendKind,
}

/// Point-in-time view of a run, handed to subscribers.
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    /// Keys checked since this process started the session
    pub total_keys_checked: u64,
    /// Keys already checked by earlier runs, restored from checkpoints
    pub resumed_keys_checked: u64,
    /// Keys per second over the sliding window
    pub rate: f64,
    pub per_worker: Vec<WorkerSnapshot>,
    pub elapsed: Duration,
    pub percent_complete: f64,
    pub eta: Option<Duration>,
}

impl ProgressSnapshot {
    pub fn per_worker_cursors(&self) -> Vec<(usize, BigUint)> {
        self.per_worker
            .iter()
            .map(|w| (w.worker_id, w.cursor.clone()))
            .collect()
    }
}

/// Merges worker reports into run totals.
///
/// Owned by the controller's coordinator thread; workers never touch it.
pub struct ProgressAggregator {
    started: Instant,
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
    total_keys_checked: u64,
    resumed_keys_checked: u64,
    total_width: f64,
    workers: Vec<WorkerSnapshot>,
}

impl ProgressAggregator {
    pub fn new(workers: Vec<WorkerSnapshot>, total_width: &BigUint, resumed_keys_checked: u64) -> Self {
        Self::with_window(workers, total_width, resumed_keys_checked, DEFAULT_RATE_WINDOW, Instant::now())
    }

    pub fn with_window(
        workers: Vec<WorkerSnapshot>,
        total_width: &BigUint,
        resumed_keys_checked: u64,
        window: Duration,
        started: Instant,
    ) -> Self {
        let mut samples = VecDeque::new();
        samples.push_back((started, 0));

        ProgressAggregator {
            started,
            window,
            samples,
            total_keys_checked: 0,
            resumed_keys_checked,
            total_width: total_width.to_f64().unwrap_or(f64::MAX),
            workers,
        }
    }

    pub fn record(&mut self, report: &ProgressReport) {
        self.record_at(report, Instant::now());
    }

    pub fn record_at(&mut self, report: &ProgressReport, now: Instant) {
        self.total_keys_checked += report.keys_checked_delta;

        if let Some(worker) = self.workers.get_mut(report.worker_id) {
            worker.cursor = report.cursor.clone();
            worker.keys_checked = report.keys_checked;
            worker.backend = report.backend;
        }

        self.samples.push_back((now, self.total_keys_checked));
        self.prune(now);
    }

    // Keep one sample at or before the window start as the rate baseline.
    fn prune(&mut self, now: Instant) {
        let Some(edge) = now.checked_sub(self.window) else {
            return;
        };
        while self.samples.len() > 1 && self.samples[1].0 <= edge {
            self.samples.pop_front();
        }
    }

    pub fn set_status(&mut self, worker_id: usize, status: WorkerStatus) {
        if let Some(worker) = self.workers.get_mut(worker_id) {
            worker.status = status;
        }
    }

    pub fn count_where<F: Fn(WorkerStatus) -> bool>(&self, predicate: F) -> usize {
        self.workers.iter().filter(|w| predicate(w.status)).count()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn total_keys_checked(&self) -> u64 {
        self.total_keys_checked
    }

    /// Keys per second over the window ending at `now`; zero until time has passed.
    pub fn rate_at(&self, now: Instant) -> f64 {
        let Some(&(_, latest)) = self.samples.back() else {
            return 0.0;
        };

        let edge = now.checked_sub(self.window);
        let baseline = self
            .samples
            .iter()
            .rev()
            .find(|(at, _)| edge.is_some_and(|edge| *at <= edge))
            .or_else(|| self.samples.front())
            .copied();

        let Some((since, base)) = baseline else {
            return 0.0;
        };
        let elapsed = now.saturating_duration_since(since).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        latest.saturating_sub(base) as f64 / elapsed
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, now: Instant) -> ProgressSnapshot {
        let rate = self.rate_at(now);
        let done = (self.total_keys_checked + self.resumed_keys_checked) as f64;
        let percent_complete = if self.total_width > 0.0 {
            (done / self.total_width * 100.0).min(100.0)
        } else {
            0.0
        };
        let eta = if rate > 0.0 {
            Duration::try_from_secs_f64((self.total_width - done).max(0.0) / rate).ok()
        } else {
            None
        };

        ProgressSnapshot {
            total_keys_checked: self.total_keys_checked,
            resumed_keys_checked: self.resumed_keys_checked,
            rate,
            per_worker: self.workers.clone(),
            elapsed: now.saturating_duration_since(self.started),
            percent_complete,
            eta,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workers(n: usize, width: u64) -> Vec<WorkerSnapshot> {
        (0..n)
            .map(|i| WorkerSnapshot {
                worker_id: i,
                range: KeyRange::new(
                    BigUint::from(i as u64 * width),
                    BigUint::from((i as u64 + 1) * width),
                )
                .unwrap(),
                cursor: BigUint::from(0u32),
                keys_checked: 0,
                status: WorkerStatus::Running,
                backend: BackendKind::Cpu,
            })
            .collect()
    }

    fn report(worker_id: usize, delta: u64, total: u64) -> ProgressReport {
        ProgressReport {
            worker_id,
            keys_checked_delta: delta,
            keys_checked: total,
            cursor: BigUint::from(total),
            backend: BackendKind::Cpu,
        }
    }

    #[test]
    fn test_rate_is_zero_before_any_interval() {
        let start = Instant::now();
        let agg = ProgressAggregator::with_window(workers(2, 100), &BigUint::from(200u32), 0, DEFAULT_RATE_WINDOW, start);
        assert_eq!(agg.rate_at(start), 0.0);
        assert_eq!(agg.snapshot_at(start).rate, 0.0);
        assert!(agg.snapshot_at(start).eta.is_none());
    }

    #[test]
    fn test_rate_uses_wall_clock() {
        let start = Instant::now();
        let mut agg = ProgressAggregator::with_window(
            workers(2, 1_000_000),
            &BigUint::from(2_000_000u32),
            0,
            DEFAULT_RATE_WINDOW,
            start,
        );

        agg.record_at(&report(0, 500, 500), start + Duration::from_secs(1));
        agg.record_at(&report(1, 1500, 1500), start + Duration::from_secs(2));

        let rate = agg.rate_at(start + Duration::from_secs(2));
        assert!((rate - 1000.0).abs() < 1e-6, "rate was {}", rate);
        assert_eq!(agg.total_keys_checked(), 2000);
    }

    #[test]
    fn test_rate_window_slides() {
        let start = Instant::now();
        let window = Duration::from_secs(10);
        let mut agg = ProgressAggregator::with_window(workers(1, 1_000_000), &BigUint::from(1_000_000u32), 0, window, start);

        // burst early, then a steady 100/s
        agg.record_at(&report(0, 100_000, 100_000), start + Duration::from_secs(1));
        for s in 2..=30u64 {
            let total = 100_000 + (s - 1) * 100;
            agg.record_at(&report(0, 100, total), start + Duration::from_secs(s));
        }

        let rate = agg.rate_at(start + Duration::from_secs(30));
        assert!((rate - 100.0).abs() < 1e-6, "rate was {}", rate);
    }

    #[test]
    fn test_snapshot_tracks_workers_and_percent() {
        let start = Instant::now();
        let mut agg = ProgressAggregator::with_window(workers(2, 50), &BigUint::from(100u32), 10, DEFAULT_RATE_WINDOW, start);
        agg.record_at(&report(1, 40, 40), start + Duration::from_secs(4));
        agg.set_status(0, WorkerStatus::Exhausted);

        let snap = agg.snapshot_at(start + Duration::from_secs(4));
        assert_eq!(snap.total_keys_checked, 40);
        assert_eq!(snap.resumed_keys_checked, 10);
        assert!((snap.percent_complete - 50.0).abs() < 1e-9);
        assert_eq!(snap.per_worker[1].keys_checked, 40);
        assert_eq!(snap.per_worker_cursors()[1], (1, BigUint::from(40u32)));
        assert_eq!(snap.elapsed, Duration::from_secs(4));
        assert_eq!(snap.eta, Some(Duration::from_secs(5)));
        assert_eq!(agg.count_where(|s| s == WorkerStatus::Exhausted), 1);
        assert_eq!(snap.per_worker[1].status, WorkerStatus::Running);
    }
}
