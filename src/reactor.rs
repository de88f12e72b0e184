//! One-shot timers the state machines use for delayed work: restart
//! delays, faked NOOP replies, faked close callbacks.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use crate::error::ClientError;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// Schedules callbacks outside the caller's stack.
///
/// A task must never run on the thread that registered it, so callers may
/// hold locks the task will take.
pub trait Reactor: Send + Sync {
    fn register_oneshot(&self, delay: Duration, task: Task) -> Result<TimerId, ClientError>;

    /// Cancels a pending task. Returns true if it was cancelled before it
    /// started; false if it already ran, is running, or is unknown.
    fn unregister(&self, id: TimerId) -> bool;
}

/// Runs each task on its own thread after sleeping out the delay.
#[derive(Default)]
pub struct ThreadReactor {
    next_id: AtomicU64,
    pending: Arc<Mutex<HashSet<TimerId>>>,
}

impl ThreadReactor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Reactor for ThreadReactor {
    fn register_oneshot(&self, delay: Duration, task: Task) -> Result<TimerId, ClientError> {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
        let pending = Arc::clone(&self.pending);
        let spawned = thread::Builder::new()
            .name(format!("gridftp-timer-{}", id.0))
            .spawn(move || {
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                let claimed = pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id);
                if claimed {
                    task();
                }
            });
        if let Err(e) = spawned {
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            return Err(e.into());
        }
        Ok(id)
    }

    fn unregister(&self, id: TimerId) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Instant;

    #[test]
    fn test_oneshot_runs_after_delay() {
        let reactor = ThreadReactor::new();
        let (tx, rx) = mpsc::channel();
        let start = Instant::now();
        reactor
            .register_oneshot(
                Duration::from_millis(30),
                Box::new(move || {
                    tx.send(Instant::now()).unwrap();
                }),
            )
            .unwrap();
        let fired = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(fired.duration_since(start) >= Duration::from_millis(30));
    }

    #[test]
    fn test_unregister_before_run_cancels() {
        let reactor = ThreadReactor::new();
        let (tx, rx) = mpsc::channel::<()>();
        let id = reactor
            .register_oneshot(
                Duration::from_millis(200),
                Box::new(move || {
                    let _ = tx.send(());
                }),
            )
            .unwrap();
        assert!(reactor.unregister(id));
        assert!(!reactor.unregister(id));
        assert!(rx.recv_timeout(Duration::from_millis(400)).is_err());
    }

    #[test]
    fn test_unregister_after_run_reports_false() {
        let reactor = ThreadReactor::new();
        let (tx, rx) = mpsc::channel();
        let id = reactor
            .register_oneshot(Duration::ZERO, Box::new(move || tx.send(()).unwrap()))
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!reactor.unregister(id));
    }
}
