//! Job nodes of the dependency graph.
//!
//! A job starts with one pending "submission guard" plus one pending count per
//! unfinished dependency. Whoever drops the count to zero spawns the job on
//! the pool. When a job finishes it releases its dependents the same way.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use parking_lot::{Condvar, Mutex};
use rayon::ThreadPool;
use smallvec::SmallVec;
use tracing::trace;

use crate::counter::JobCounter;

pub(crate) type JobBody = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct JobState {
    finished: bool,
    dependents: Vec<Arc<Job>>,
}

pub(crate) struct Job {
    id: u64,
    name: String,
    pending: AtomicUsize,
    state: Mutex<JobState>,
    finished: Condvar,
    body: Mutex<Option<JobBody>>,
    counters: SmallVec<[JobCounter; 3]>,
}

impl Job {
    pub fn new(id: u64, name: String, body: JobBody, counters: SmallVec<[JobCounter; 3]>) -> Arc<Self> {
        for counter in &counters {
            counter.increment();
        }
        Arc::new(Self {
            id,
            name,
            pending: AtomicUsize::new(1),
            state: Mutex::new(JobState::default()),
            finished: Condvar::new(),
            body: Mutex::new(Some(body)),
            counters,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    /// Make `self` wait for `dependency`.
    ///
    /// Returns `false` if the dependency already finished.
    pub fn depend_on(self: &Arc<Self>, dependency: &Arc<Self>) -> bool {
        let mut state = dependency.state.lock();
        if state.finished {
            return false;
        }
        self.pending.fetch_add(1, Ordering::AcqRel);
        state.dependents.push(Arc::clone(self));
        trace!(job = self.id, waits_on = dependency.id, "job dependency");
        true
    }

    /// Drop one pending count, spawning the job when it was the last.
    pub fn release(self: &Arc<Self>, pool: &Arc<ThreadPool>) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            let job = Arc::clone(self);
            let pool_handle = Arc::clone(pool);
            pool.spawn_fifo(move || job.run(&pool_handle));
        }
    }

    fn run(self: &Arc<Self>, pool: &Arc<ThreadPool>) {
        let body = self.body.lock().take();
        if let Some(body) = body {
            trace!(job = self.id, name = %self.name, "job started");
            body();
        }

        let dependents = {
            let mut state = self.state.lock();
            state.finished = true;
            std::mem::take(&mut state.dependents)
        };
        self.finished.notify_all();
        trace!(job = self.id, name = %self.name, released = dependents.len(), "job finished");

        for counter in &self.counters {
            counter.decrement();
        }
        for dependent in dependents {
            dependent.release(pool);
        }
    }

    /// Block the calling thread until the job has run.
    pub fn wait(&self) {
        let mut state = self.state.lock();
        while !state.finished {
            self.finished.wait(&mut state);
        }
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("pending", &self.pending.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
