//! The worker contract and the name-keyed registry the executor resolves
//! workers from.

use crate::job::Job;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// What a worker run directed the queue to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The job succeeded.
    Complete,
    /// The job succeeded and this value should be stored in `meta.recorded`.
    Record(Value),
    /// Re-schedule the job to run again after the given number of seconds.
    Snooze(u64),
    /// Stop the job permanently, recording the reason.
    Cancel(String),
}

/// Result of a single worker run. Errors are recorded and retried with
/// backoff until attempts are exhausted.
pub type WorkerResult = anyhow::Result<Outcome>;

/// A unit of executable logic, resolved by name from the [`WorkerRegistry`].
///
/// Implementations must be cheap to share; one instance serves every
/// execution of its job type. Long blocking sections should be moved onto
/// the blocking pool (`tokio::task::spawn_blocking`) so the runtime's
/// cooperative loops keep turning.
#[async_trait::async_trait]
pub trait Worker: Send + Sync + 'static {
    async fn process(&self, job: &Job) -> WorkerResult;

    /// Retry delay override. Returning `None` uses the default jittered
    /// exponential backoff.
    fn backoff(&self, job: &Job) -> Option<Duration> {
        let _ = job;
        None
    }
}

/// Maps worker names to shared worker instances.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    workers: Arc<DashMap<String, Arc<dyn Worker>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker under the given name, replacing any previous entry.
    pub fn register(&self, name: impl Into<String>, worker: impl Worker) {
        self.workers.insert(name.into(), Arc::new(worker));
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Worker>> {
        self.workers.get(name).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workers.contains_key(name)
    }
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.workers.iter().map(|e| e.key().clone()).collect();
        f.debug_struct("WorkerRegistry").field("workers", &names).finish()
    }
}
