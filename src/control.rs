use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};

/// Broadcast-once stop signal shared by every worker of a session.
#[derive(Debug, Default)]
pub struct CancellationToken {
    cancelled: AtomicBool,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` for the call that actually flipped the token.
    pub fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Barrier workers park on between batches while a session is paused.
#[derive(Debug, Default)]
pub struct PauseGate {
    paused: Mutex<bool>,
    changed: Condvar,
}

impl PauseGate {
    pub fn pause(&self) {
        *self.paused.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }

    pub fn resume(&self) {
        *self.paused.lock().unwrap_or_else(PoisonError::into_inner) = false;
        self.changed.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the gate opens or `cancel` fires.
    pub fn wait_while_paused(&self, cancel: &CancellationToken) {
        let mut paused = self.paused.lock().unwrap_or_else(PoisonError::into_inner);
        while *paused && !cancel.is_cancelled() {
            paused = self
                .changed
                .wait(paused)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn wake_all(&self) {
        let _guard = self.paused.lock().unwrap_or_else(PoisonError::into_inner);
        self.changed.notify_all();
    }
}

/// Signals a controller sends to its workers.
#[derive(Debug, Default)]
pub struct WorkerControl {
    pub cancel: CancellationToken,
    pub gate: PauseGate,
    retired: Mutex<HashSet<usize>>,
}

impl WorkerControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel and release anyone parked on the pause gate. Idempotent.
    pub fn cancel(&self) -> bool {
        let first = self.cancel.cancel();
        self.gate.wake_all();
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Tell one worker to flush and exit at its next batch boundary, whatever
    /// the rest of the session does. Returns `true` the first time.
    pub fn retire(&self, worker_id: usize) -> bool {
        self.retired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(worker_id)
    }

    pub fn is_retired(&self, worker_id: usize) -> bool {
        self.retired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&worker_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_cancel_is_idempotent() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.cancel());
        assert!(!token.cancel());
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_resume_releases_waiter() {
        let control = Arc::new(WorkerControl::new());
        control.gate.pause();

        let waiter = {
            let control = control.clone();
            thread::spawn(move || control.gate.wait_while_paused(&control.cancel))
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        control.gate.resume();
        waiter.join().unwrap();
        assert!(!control.gate.is_paused());
    }

    #[test]
    fn test_cancel_releases_waiter() {
        let control = Arc::new(WorkerControl::new());
        control.gate.pause();

        let waiter = {
            let control = control.clone();
            thread::spawn(move || control.gate.wait_while_paused(&control.cancel))
        };

        thread::sleep(Duration::from_millis(20));
        assert!(control.cancel());
        waiter.join().unwrap();
        assert!(control.gate.is_paused());
    }

    #[test]
    fn test_retire_targets_one_worker() {
        let control = WorkerControl::new();
        assert!(control.retire(1));
        assert!(!control.retire(1));
        assert!(control.is_retired(1));
        assert!(!control.is_retired(0));
        assert!(!control.is_cancelled());
    }
}
