#![allow(clippy::disallowed_methods)]
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use db::MemoryStore;
use engine::{ExecutorRegistry, QueueManager};
use queue_core::{
    BackoffPolicy, Job, JobId, JobResult, JobStatus, JobStore, QueueConfig, QueueError, QueueStore,
};

pub const QUEUE: &str = "test-queue";
pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Config with immediate retries and timers long enough to stay out of the way.
pub fn config() -> QueueConfig {
    QueueConfig::new(QUEUE)
        .with_retry_backoff(BackoffPolicy::immediate())
        .with_poll_interval(Duration::from_secs(3600))
        .with_group_intervals(Duration::from_secs(3600), Duration::from_secs(3600))
}

pub fn manager(
    store: &MemoryStore,
    config: QueueConfig,
    executors: ExecutorRegistry,
) -> Result<QueueManager<MemoryStore>, QueueError> {
    QueueManager::new(config, Arc::new(store.clone()), executors)
}

/// Manager over any store, e.g. `SurrealStore` on an in-memory datastore.
pub fn manager_on<S: QueueStore>(
    store: Arc<S>,
    config: QueueConfig,
    executors: ExecutorRegistry,
) -> Result<QueueManager<S>, QueueError> {
    QueueManager::new(config, store, executors)
}

pub fn job(name: &str, executor: &str) -> Job {
    Job::new(QUEUE, name, executor, serde_json::Value::Null)
}

/// Names of executed jobs, in execution order.
#[derive(Clone, Default)]
pub struct ExecutionLog(Arc<Mutex<Vec<String>>>);

impl ExecutionLog {
    pub fn record(&self, name: &str) {
        self.0.lock().unwrap().push(name.to_string());
    }

    pub fn names(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Registry with a "record" executor that logs job names and succeeds.
pub fn recording_executors(log: &ExecutionLog) -> ExecutorRegistry {
    let mut executors = ExecutorRegistry::new();
    let log = log.clone();
    executors.register_fn("record", move |job: Job| {
        let log = log.clone();
        async move {
            log.record(&job.name);
            Ok(JobResult::new("recorded"))
        }
    });
    executors
}

/// Poll the store until the job reaches `status`.
pub async fn wait_for_status<S: JobStore>(
    store: &S,
    id: JobId,
    status: JobStatus,
) -> Result<Job, QueueError> {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        if let Some(job) = store.find_by_id(id).await?
            && job.status == status
        {
            return Ok(job);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(QueueError::Timeout(TIMEOUT));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
