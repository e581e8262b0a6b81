//! Scheduler configuration.

use tracing::warn;

/// Environment variable overriding [`SchedulerConfig::worker_threads`].
pub const WORKER_THREADS_ENV: &str = "SUGOI_WORKER_THREADS";

/// Settings for [`crate::JobScheduler::new`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Worker thread count. `None` lets rayon pick one per logical core.
    pub worker_threads: Option<usize>,
    /// Worker thread name prefix; the worker index is appended.
    pub thread_name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            thread_name: "sugoi-worker".to_owned(),
        }
    }
}

impl SchedulerConfig {
    /// Defaults, with the worker count read from `SUGOI_WORKER_THREADS` when set.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var(WORKER_THREADS_ENV) {
            config.worker_threads = parse_worker_threads(&value);
            if config.worker_threads.is_none() {
                warn!(value = %value, "ignoring invalid {WORKER_THREADS_ENV}");
            }
        }
        config
    }

    #[must_use]
    pub fn worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = Some(count);
        self
    }

    #[must_use]
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }
}

fn parse_worker_threads(value: &str) -> Option<usize> {
    value.trim().parse().ok().filter(|&count| count > 0)
}
