use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::automation::state::{ActivityState, Phase, SessionOutcome, SessionStats};

/// Snapshot of a session for whoever is displaying it.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub phase: Option<Phase>,
    pub outcome: Option<SessionOutcome>,
    pub stats: SessionStats,
    pub runtime: Duration,
    pub message: String,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            phase: None,
            outcome: None,
            stats: SessionStats::default(),
            runtime: Duration::ZERO,
            message: "Ready".to_string(),
        }
    }
}

/// Shared, cloneable handle to a [`SessionStatus`].
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    inner: Arc<Mutex<SessionStatus>>,
}

impl StatusBoard {
    fn lock(&self) -> MutexGuard<'_, SessionStatus> {
        // status is plain data; a panicked writer leaves it usable
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> SessionStatus {
        self.lock().clone()
    }

    /// Replaces the message. Repeats of the current message are dropped
    /// so a waiting session doesn't flood the log.
    pub fn set_message(&self, text: &str) -> bool {
        let mut status = self.lock();
        if status.message == text {
            return false;
        }
        log::info!("{}", text);
        status.message = text.to_string();
        true
    }

    pub fn publish(&self, state: &ActivityState, runtime: Duration) {
        let mut status = self.lock();
        status.phase = Some(state.phase);
        status.outcome = Some(state.outcome.clone());
        status.stats = state.stats.clone();
        status.runtime = runtime;
    }
}

/// Run and pause flags shared between a worker and its task.
#[derive(Debug, Clone, Default)]
pub struct Signals {
    running: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
}

impl Signals {
    /// Flags for a task that starts out running.
    pub fn running() -> Self {
        let signals = Self::default();
        signals.running.store(true, Ordering::SeqCst);
        signals
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct Worker {
    signals: Signals,
    status: StatusBoard,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start<F>(&mut self, task: F)
    where
        F: FnOnce(Signals, StatusBoard) + Send + 'static,
    {
        self.signals.set_paused(false);
        self.signals.running.store(true, Ordering::SeqCst);

        let signals = self.signals.clone();
        let status = self.status.clone();
        self.handle = Some(thread::spawn(move || {
            task(signals.clone(), status);
            signals.stop();
        }));
    }

    /// Asks the task to stop at its next tick boundary.
    pub fn stop(&self) {
        self.signals.stop();
    }

    pub fn is_running(&self) -> bool {
        self.signals.is_running()
    }

    /// Holds the task between ticks until [`Self::resume`].
    pub fn pause(&self) {
        self.signals.set_paused(true);
    }

    pub fn resume(&self) {
        self.signals.set_paused(false);
    }

    pub fn is_paused(&self) -> bool {
        self.signals.is_paused()
    }

    /// Blocks until the task has returned.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Worker thread panicked");
                self.signals.stop();
            }
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status.snapshot()
    }

    pub fn set_status(&self, text: &str) {
        self.status.set_message(text);
    }
}

/// Sleeps for `total` in short slices, returning early once the task is told to stop.
pub fn sleep_while_running(total: Duration, signals: &Signals) {
    const SLICE: Duration = Duration::from_millis(50);
    let mut left = total;
    while !left.is_zero() && signals.is_running() {
        let step = left.min(SLICE);
        thread::sleep(step);
        left -= step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_messages_are_suppressed() {
        let board = StatusBoard::default();
        assert!(board.set_message("Waiting in IN_QUEUE"));
        assert!(!board.set_message("Waiting in IN_QUEUE"));
        assert!(board.set_message("IN_QUEUE -> IN_PQ"));
        assert_eq!(board.snapshot().message, "IN_QUEUE -> IN_PQ");
    }

    #[test]
    fn worker_clears_running_when_task_returns() {
        let mut worker = Worker::new();
        worker.start(|_, status| {
            status.set_message("done");
        });
        worker.join();
        assert!(!worker.is_running());
        assert_eq!(worker.status().message, "done");
    }

    #[test]
    fn pause_and_stop_reach_the_task() {
        let mut worker = Worker::new();
        let (seen_tx, seen_rx) = std::sync::mpsc::channel();
        worker.start(move |signals, _| {
            while signals.is_running() {
                if signals.is_paused() {
                    let _ = seen_tx.send(());
                    while signals.is_paused() && signals.is_running() {
                        thread::sleep(Duration::from_millis(1));
                    }
                }
                thread::sleep(Duration::from_millis(1));
            }
        });
        worker.pause();
        assert!(worker.is_paused());
        seen_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        worker.resume();
        assert!(!worker.is_paused());
        worker.stop();
        worker.join();
        assert!(!worker.is_running());
    }

    #[test]
    fn stopped_signals_cut_a_sleep_short() {
        let signals = Signals::default();
        let started = std::time::Instant::now();
        sleep_while_running(Duration::from_secs(10), &signals);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
