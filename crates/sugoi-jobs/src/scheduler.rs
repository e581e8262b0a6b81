//! Job submission and dependency resolution.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use rayon::{ThreadPool, ThreadPoolBuilder};
use rustc_hash::FxHashMap;
use smallvec::{SmallVec, smallvec};
use sugoi::{AccessMode, ChunkView, Query, Storage, StorageId, TypeRegistry};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    config::SchedulerConfig,
    counter::JobCounter,
    job::{Job, JobBody},
    resource::{AccessHistory, AccessKey, ResourceId, ResourceOperation},
    task::TaskContext,
};

/// Rows per task when an ECS job does not set its own batch size.
pub const DEFAULT_BATCH_SIZE: u32 = 256;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// A storage shared between the submitting thread and running jobs.
///
/// [`StorageHandle::read`] and [`StorageHandle::write`] first wait for every
/// job scheduled on the storage, so they must not be called from inside one
/// of those jobs.
#[derive(Clone)]
pub struct StorageHandle {
    inner: Arc<StorageShared>,
}

struct StorageShared {
    id: StorageId,
    storage: RwLock<Storage>,
    jobs: JobCounter,
}

impl StorageHandle {
    fn new(storage: Storage) -> Self {
        Self {
            inner: Arc::new(StorageShared {
                id: storage.id(),
                storage: RwLock::new(storage),
                jobs: JobCounter::new(),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> StorageId {
        self.inner.id
    }

    /// Jobs still pending on this storage.
    #[must_use]
    pub fn pending_jobs(&self) -> usize {
        self.inner.jobs.pending()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Storage> {
        self.inner.jobs.wait(false);
        self.inner.storage.read()
    }

    /// Exclusive access for structural changes.
    pub fn write(&self) -> RwLockWriteGuard<'_, Storage> {
        self.inner.jobs.wait(false);
        self.inner.storage.write()
    }
}

impl std::fmt::Debug for StorageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageHandle")
            .field("id", &self.inner.id)
            .field("pending_jobs", &self.pending_jobs())
            .finish()
    }
}

#[derive(Default)]
struct Graph {
    histories: FxHashMap<AccessKey, AccessHistory>,
    resources: FxHashMap<ResourceId, String>,
    next_resource: u32,
}

/// Runs jobs on a worker pool, ordering them by their declared accesses.
///
/// Two jobs touching the same component type of the same storage, or the
/// same external resource, run in submission order when either one writes.
/// Readers run together, and atomic accessors run together.
pub struct JobScheduler {
    pool: Arc<ThreadPool>,
    graph: Mutex<Graph>,
    all: JobCounter,
    next_job: AtomicU64,
}

impl JobScheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        let thread_name = config.thread_name.clone();
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.worker_threads.unwrap_or(0))
            .thread_name(move |index| format!("{thread_name}-{index}"))
            .build()?;
        info!(threads = pool.current_num_threads(), "job scheduler started");

        Ok(Self {
            pool: Arc::new(pool),
            graph: Mutex::new(Graph::default()),
            all: JobCounter::new(),
            next_job: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn worker_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Create an empty storage whose jobs go through this scheduler.
    pub fn create_storage(&self, registry: Arc<TypeRegistry>) -> StorageHandle {
        StorageHandle::new(Storage::new(registry))
    }

    /// Share an existing storage with the scheduler.
    pub fn adopt(&self, storage: Storage) -> StorageHandle {
        StorageHandle::new(storage)
    }

    /// Run `f` over every batch of `query`'s matching rows.
    pub fn schedule_ecs<F>(
        &self,
        storage: &StorageHandle,
        query: &Arc<Query>,
        batch_size: u32,
        f: F,
    ) -> JobCounter
    where
        F: Fn(&TaskContext<'_>) + Send + Sync + 'static,
    {
        self.ecs_job(storage, query).batch_size(batch_size).spawn(f)
    }

    /// Configure an ECS job before spawning it.
    pub fn ecs_job<'s>(&'s self, storage: &StorageHandle, query: &Arc<Query>) -> EcsJobBuilder<'s> {
        EcsJobBuilder {
            scheduler: self,
            storage: storage.clone(),
            query: Arc::clone(query),
            batch_size: DEFAULT_BATCH_SIZE,
            resources: SmallVec::new(),
            counter: None,
            name: None,
        }
    }

    /// Run a closure once, ordered against other jobs by `operations`.
    ///
    /// Operations on removed or unknown resources are logged and ignored.
    pub fn schedule_custom<F>(&self, name: impl Into<String>, operations: &[ResourceOperation], f: F) -> JobCounter
    where
        F: FnOnce() + Send + 'static,
    {
        let counter = JobCounter::new();
        let mut accesses = SmallVec::new();
        for op in operations {
            push_access(&mut accesses, AccessKey::Resource(op.resource), op.access);
        }
        self.submit(
            name.into(),
            &accesses,
            smallvec![counter.clone(), self.all.clone()],
            Box::new(f),
        );
        counter
    }

    /// Register an external resource jobs can declare accesses to.
    pub fn add_resource(&self, name: impl Into<String>) -> ResourceId {
        let mut graph = self.graph.lock();
        let id = ResourceId(graph.next_resource);
        graph.next_resource += 1;
        let name = name.into();
        debug!(resource = id.0, name = %name, "added resource");
        graph.resources.insert(id, name);
        id
    }

    /// Forget a resource after the jobs using it have finished.
    ///
    /// Returns `false` if the resource was unknown.
    pub fn remove_resource(&self, id: ResourceId) -> bool {
        let history = {
            let mut graph = self.graph.lock();
            if graph.resources.remove(&id).is_none() {
                return false;
            }
            graph.histories.remove(&AccessKey::Resource(id))
        };
        if let Some(history) = history {
            for job in history.jobs() {
                job.wait();
            }
        }
        debug!(resource = id.0, "removed resource");
        true
    }

    /// Block until `counter` reaches zero.
    ///
    /// Without `pin`, a calling worker thread keeps running other jobs while
    /// it waits.
    pub fn wait_counter(&self, counter: &JobCounter, pin: bool) {
        counter.wait(pin);
    }

    /// Block until every submitted job has finished.
    pub fn wait_all(&self) {
        self.all.wait(false);
        self.prune();
    }

    /// Block until every job scheduled on `storage` has finished.
    pub fn wait_storage(&self, storage: &StorageHandle) {
        storage.inner.jobs.wait(false);
    }

    fn submit(&self, name: String, accesses: &[(AccessKey, AccessMode)], counters: SmallVec<[JobCounter; 3]>, body: JobBody) {
        let mut graph = self.graph.lock();
        let id = self.next_job.fetch_add(1, Ordering::Relaxed);
        let job = Job::new(id, name, body, counters);
        let mut deps = Vec::new();
        for &(key, access) in accesses {
            let unknown = matches!(key, AccessKey::Resource(resource) if !graph.resources.contains_key(&resource));
            if unknown {
                warn!(job = id, name = job.name(), ?key, "ignoring access to unknown resource");
                continue;
            }
            graph.histories.entry(key).or_default().record(&job, access, &mut deps);
        }
        deps.sort_unstable_by_key(|dep| dep.id());
        deps.dedup_by_key(|dep| dep.id());
        deps.retain(|dep| job.depend_on(dep));
        drop(graph);

        debug!(job = id, name = job.name(), accesses = accesses.len(), waits_on = deps.len(), "submitted job");
        job.release(&self.pool);
    }

    /// Drop histories whose jobs have all finished.
    fn prune(&self) {
        self.graph.lock().histories.retain(|_, history| !history.is_idle());
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        self.all.wait(true);
    }
}

impl std::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScheduler")
            .field("worker_threads", &self.worker_threads())
            .field("pending", &self.all.pending())
            .finish_non_exhaustive()
    }
}

/// Builder returned by [`JobScheduler::ecs_job`].
#[must_use]
pub struct EcsJobBuilder<'s> {
    scheduler: &'s JobScheduler,
    storage: StorageHandle,
    query: Arc<Query>,
    batch_size: u32,
    resources: SmallVec<[ResourceOperation; 2]>,
    counter: Option<JobCounter>,
    name: Option<String>,
}

impl EcsJobBuilder<'_> {
    /// Rows per task. Zero is treated as one.
    pub fn batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Order the job against an external resource as well.
    ///
    /// A removed or unknown resource is logged and ignored at submission.
    pub fn resource(mut self, operation: ResourceOperation) -> Self {
        self.resources.push(operation);
        self
    }

    /// Count the job on an existing counter instead of a fresh one.
    pub fn counter(mut self, counter: &JobCounter) -> Self {
        self.counter = Some(counter.clone());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Submit the job. The returned counter reaches zero once it has run.
    ///
    /// # Panics
    ///
    /// Panics if the query was built for another storage.
    pub fn spawn<F>(self, f: F) -> JobCounter
    where
        F: Fn(&TaskContext<'_>) + Send + Sync + 'static,
    {
        let Self {
            scheduler,
            storage,
            query,
            batch_size,
            resources,
            counter,
            name,
        } = self;
        assert_eq!(
            query.storage_id(),
            storage.id(),
            "query belongs to another storage"
        );

        let mut accesses = SmallVec::new();
        for param in query.params().iter() {
            let access = if param.shared { AccessMode::ReadOnly } else { param.access };
            push_access(&mut accesses, AccessKey::Component(storage.id(), param.ty), access);
        }
        for op in &resources {
            push_access(&mut accesses, AccessKey::Resource(op.resource), op.access);
        }

        let counter = counter.unwrap_or_default();
        let counters = smallvec![counter.clone(), scheduler.all.clone(), storage.inner.jobs.clone()];
        let name = name.unwrap_or_else(|| format!("ecs job on {:?}", storage.id()));

        let body = move || {
            let guard = storage.inner.storage.read();
            run_batches(&guard, &query, batch_size, &f);
        };
        scheduler.submit(name, &accesses, counters, Box::new(body));
        counter
    }
}

fn push_access(accesses: &mut SmallVec<[(AccessKey, AccessMode); 8]>, key: AccessKey, access: AccessMode) {
    match accesses.iter_mut().find(|(k, _)| *k == key) {
        Some((_, existing)) => *existing = existing.max(access),
        None => accesses.push((key, access)),
    }
}

/// Cut views into batches of at most `batch_size` rows, each tagged with the
/// index of its first row among all rows.
fn split_batches(views: &[ChunkView], batch_size: u32) -> Vec<(ChunkView, usize)> {
    let mut batches = Vec::new();
    let mut index = 0;
    for &view in views {
        let mut rest = view;
        while !rest.is_empty() {
            let (head, tail) = rest.split_at(batch_size);
            batches.push((head, index));
            index += head.count as usize;
            rest = tail;
        }
    }
    batches
}

fn run_batches<F>(storage: &Storage, query: &Query, batch_size: u32, f: &F)
where
    F: Fn(&TaskContext<'_>) + Sync,
{
    let views = storage.query(query);
    let batches = split_batches(&views, batch_size);
    let params = query.params();

    if params.has_random_write() || batches.len() <= 1 {
        for (task, &(view, first)) in batches.iter().enumerate() {
            f(&TaskContext::new(storage, params, view, task, first));
        }
    } else {
        rayon::scope(|scope| {
            for (task, &(view, first)) in batches.iter().enumerate() {
                scope.spawn(move |_| f(&TaskContext::new(storage, params, view, task, first)));
            }
        });
    }

    for param in params.iter().filter(|p| p.access.writes() && !p.shared) {
        for view in &views {
            storage.mark_written(view.chunk, param.ty);
        }
    }
}

#[cfg(test)]
mod tests {
    use sugoi::{ChunkClass, ChunkHandle};

    use super::*;

    #[test]
    fn test_split_batches() {
        let chunk = ChunkHandle::new(ChunkClass::Default, 0);
        let other = ChunkHandle::new(ChunkClass::Default, 1);
        let views = [ChunkView::new(chunk, 0, 5), ChunkView::new(other, 0, 2)];

        let batches = split_batches(&views, 2);
        assert_eq!(
            batches,
            vec![
                (ChunkView::new(chunk, 0, 2), 0),
                (ChunkView::new(chunk, 2, 2), 2),
                (ChunkView::new(chunk, 4, 1), 4),
                (ChunkView::new(other, 0, 2), 5),
            ]
        );
    }

    #[test]
    fn test_push_access_merges() {
        let key = AccessKey::Resource(ResourceId(0));
        let mut accesses = SmallVec::new();
        push_access(&mut accesses, key, AccessMode::ReadOnly);
        push_access(&mut accesses, key, AccessMode::Atomic);
        assert_eq!(accesses.as_slice(), &[(key, AccessMode::Atomic)]);
        push_access(&mut accesses, key, AccessMode::ReadWrite);
        assert_eq!(accesses.as_slice(), &[(key, AccessMode::ReadWrite)]);
    }

    #[test]
    fn test_unknown_resource_is_removed_once() {
        let scheduler = JobScheduler::new(SchedulerConfig::default().worker_threads(2)).unwrap();
        let id = scheduler.add_resource("audio");
        assert!(scheduler.remove_resource(id));
        assert!(!scheduler.remove_resource(id));
    }
}
