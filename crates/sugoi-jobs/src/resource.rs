//! Access history per conflict unit.
//!
//! Conflict units are `(storage, component type)` pairs and external
//! resources. Each unit remembers its last writer, the readers since that
//! writer and the atomic accessors since that writer.

use std::sync::Arc;

use sugoi::{AccessMode, StorageId, TypeIndex};

use crate::job::Job;

/// Handle of an external resource registered with
/// [`crate::JobScheduler::add_resource`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub(crate) u32);

impl ResourceId {
    #[must_use]
    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

/// One declared access to an external resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceOperation {
    pub resource: ResourceId,
    pub access: AccessMode,
}

impl ResourceOperation {
    #[must_use]
    pub const fn read(resource: ResourceId) -> Self {
        Self {
            resource,
            access: AccessMode::ReadOnly,
        }
    }

    #[must_use]
    pub const fn write(resource: ResourceId) -> Self {
        Self {
            resource,
            access: AccessMode::ReadWrite,
        }
    }

    #[must_use]
    pub const fn atomic(resource: ResourceId) -> Self {
        Self {
            resource,
            access: AccessMode::Atomic,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum AccessKey {
    Component(StorageId, TypeIndex),
    Resource(ResourceId),
}

/// Lists shrink to their unfinished jobs once they grow past this.
const PRUNE_THRESHOLD: usize = 32;

#[derive(Default)]
pub(crate) struct AccessHistory {
    writer: Option<Arc<Job>>,
    readers: Vec<Arc<Job>>,
    atomics: Vec<Arc<Job>>,
}

impl AccessHistory {
    /// Record `job` accessing this unit and push the jobs it must wait for.
    pub fn record(&mut self, job: &Arc<Job>, access: AccessMode, deps: &mut Vec<Arc<Job>>) {
        match access {
            AccessMode::ReadOnly => {
                deps.extend(self.writer.iter().cloned());
                deps.extend(self.atomics.iter().cloned());
                push_pruned(&mut self.readers, job);
            }
            AccessMode::ReadWrite => {
                deps.extend(self.writer.take());
                deps.append(&mut self.readers);
                deps.append(&mut self.atomics);
                self.writer = Some(Arc::clone(job));
            }
            AccessMode::Atomic => {
                deps.extend(self.writer.iter().cloned());
                deps.extend(self.readers.iter().cloned());
                push_pruned(&mut self.atomics, job);
            }
        }
    }

    /// Every job still recorded here.
    pub fn jobs(&self) -> impl Iterator<Item = &Arc<Job>> {
        self.writer
            .iter()
            .chain(self.readers.iter())
            .chain(self.atomics.iter())
    }

    pub fn is_idle(&self) -> bool {
        self.jobs().all(|job| job.is_finished())
    }
}

fn push_pruned(list: &mut Vec<Arc<Job>>, job: &Arc<Job>) {
    if list.len() >= PRUNE_THRESHOLD {
        list.retain(|job| !job.is_finished());
    }
    list.push(Arc::clone(job));
}

#[cfg(test)]
mod tests {
    use smallvec::SmallVec;

    use super::*;

    fn job(id: u64) -> Arc<Job> {
        Job::new(id, format!("job{id}"), Box::new(|| {}), SmallVec::new())
    }

    fn ids(deps: &[Arc<Job>]) -> Vec<u64> {
        let mut ids: Vec<u64> = deps.iter().map(|job| job.id()).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    fn record(history: &mut AccessHistory, job: &Arc<Job>, access: AccessMode) -> Vec<u64> {
        let mut deps = Vec::new();
        history.record(job, access, &mut deps);
        ids(&deps)
    }

    #[test]
    fn test_readers_do_not_wait_on_each_other() {
        let mut history = AccessHistory::default();
        assert!(record(&mut history, &job(0), AccessMode::ReadOnly).is_empty());
        assert!(record(&mut history, &job(1), AccessMode::ReadOnly).is_empty());
        assert_eq!(record(&mut history, &job(2), AccessMode::ReadWrite), vec![0, 1]);
        assert_eq!(record(&mut history, &job(3), AccessMode::ReadOnly), vec![2]);
    }

    #[test]
    fn test_write_after_write() {
        let mut history = AccessHistory::default();
        assert!(record(&mut history, &job(0), AccessMode::ReadWrite).is_empty());
        assert_eq!(record(&mut history, &job(1), AccessMode::ReadWrite), vec![0]);
        assert_eq!(record(&mut history, &job(2), AccessMode::ReadWrite), vec![1]);
    }

    #[test]
    fn test_atomics_group_together() {
        let mut history = AccessHistory::default();
        record(&mut history, &job(0), AccessMode::ReadWrite);
        assert_eq!(record(&mut history, &job(1), AccessMode::Atomic), vec![0]);
        assert_eq!(record(&mut history, &job(2), AccessMode::Atomic), vec![0]);
        assert_eq!(record(&mut history, &job(3), AccessMode::ReadOnly), vec![0, 1, 2]);
        assert_eq!(record(&mut history, &job(4), AccessMode::Atomic), vec![0, 3]);
        assert_eq!(record(&mut history, &job(5), AccessMode::ReadWrite), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_jobs_and_idle() {
        let mut history = AccessHistory::default();
        assert!(history.is_idle());
        record(&mut history, &job(0), AccessMode::ReadOnly);
        record(&mut history, &job(1), AccessMode::Atomic);
        assert_eq!(history.jobs().count(), 2);
        assert!(!history.is_idle());
    }
}
