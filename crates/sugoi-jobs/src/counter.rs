//! Completion counters.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use crossbeam::utils::Backoff;
use parking_lot::{Condvar, Mutex};

/// Counts unfinished jobs. Clones share the same count.
///
/// Every job submitted with a counter increments it and decrements it once
/// the job body has returned.
#[derive(Clone, Default)]
pub struct JobCounter {
    inner: Arc<CounterInner>,
}

#[derive(Default)]
struct CounterInner {
    count: AtomicUsize,
    lock: Mutex<()>,
    zero: Condvar,
}

impl JobCounter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs still running or waiting.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.pending() == 0
    }

    pub(crate) fn increment(&self) {
        self.inner.count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn decrement(&self) {
        let previous = self.inner.count.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "job counter underflow");
        if previous == 1 {
            // take the lock so a waiter between its check and its sleep sees the notify
            let _guard = self.inner.lock.lock();
            self.inner.zero.notify_all();
        }
    }

    /// Block until the count reaches zero.
    ///
    /// With `pin` the calling thread only waits. Without it, a worker thread
    /// of the scheduler's pool keeps executing other jobs while it waits.
    pub fn wait(&self, pin: bool) {
        if !pin {
            while !self.is_done() {
                // `None` when not called from a pool thread
                match rayon::yield_now() {
                    Some(rayon::Yield::Executed) => {}
                    Some(rayon::Yield::Idle) => std::thread::yield_now(),
                    None => break,
                }
            }
        }

        let backoff = Backoff::new();
        while !self.is_done() {
            if backoff.is_completed() {
                let mut guard = self.inner.lock.lock();
                while !self.is_done() {
                    self.inner.zero.wait(&mut guard);
                }
                return;
            }
            backoff.snooze();
        }
    }
}

impl std::fmt::Debug for JobCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobCounter")
            .field("pending", &self.pending())
            .finish()
    }
}
