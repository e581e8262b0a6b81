// Allow unsafe code - jobs write component columns through shared storage borrows
#![allow(unsafe_code)]
#![allow(missing_docs)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

//! sugoi-jobs - dependency-resolving job scheduler for sugoi storages
//!
//! Every job declares what it touches: an ECS job through its [`sugoi::Query`]
//! parameters, a custom job through a list of [`ResourceOperation`]s. The
//! scheduler tracks one access history per `(storage, component type)` pair
//! and per external resource, and makes each new job wait for the earlier
//! jobs it conflicts with:
//!
//! | new access | waits on |
//! |------------|----------|
//! | read       | last writer, atomic accessors |
//! | write      | last writer, readers, atomic accessors |
//! | atomic     | last writer, readers |
//!
//! Jobs with no conflicts run concurrently on a rayon pool. An ECS job splits
//! its query's rows into batches that run in parallel, unless it writes a
//! component with random access, in which case the batches run in order.
//!
//! ```no_run
//! use std::sync::Arc;
//! use sugoi::{EntityType, Query, TypeRegistry};
//! use sugoi_jobs::{JobScheduler, SchedulerConfig};
//!
//! let registry = Arc::new(TypeRegistry::new());
//! let health = registry.register::<u32>().unwrap();
//!
//! let scheduler = JobScheduler::new(SchedulerConfig::from_env()).unwrap();
//! let storage = scheduler.create_storage(registry);
//! storage.write().allocate_entities(&EntityType::of(&[health]), 1000);
//!
//! let query = Arc::new(Query::builder(&storage.read()).write(health).build().unwrap());
//! scheduler.schedule_ecs(&storage, &query, 128, move |ctx| {
//!     for value in ctx.write::<u32>(health).unwrap() {
//!         *value += 1;
//!     }
//! });
//! scheduler.wait_storage(&storage);
//! ```

mod config;
mod counter;
mod job;
mod resource;
mod scheduler;
mod task;

pub use config::{SchedulerConfig, WORKER_THREADS_ENV};
pub use counter::JobCounter;
pub use resource::{ResourceId, ResourceOperation};
pub use scheduler::{DEFAULT_BATCH_SIZE, EcsJobBuilder, JobScheduler, SchedulerError, StorageHandle};
pub use task::TaskContext;
