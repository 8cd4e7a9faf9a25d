//! Executor trait and registry.

use queue_core::{Job, JobResult, QueueError};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Result type for executors. The error string is recorded on the job.
pub type ExecutorResult = Result<JobResult, String>;

/// Future type for async executors.
pub type ExecutorFuture = Pin<Box<dyn Future<Output = ExecutorResult> + Send>>;

/// Trait for executors.
///
/// Jobs name their executor; the registry resolves the name at dispatch time.
pub trait Executor: Send + Sync + 'static {
    /// The name jobs use to select this executor.
    fn name(&self) -> &str;

    /// Run a job and return its result.
    fn execute(&self, job: &Job) -> ExecutorFuture;
}

/// Registry mapping executor names to executors.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Register an executor under its name, replacing any previous one.
    pub fn register<E: Executor>(&mut self, executor: E) {
        let name = executor.name().to_string();
        self.executors.insert(name, Arc::new(executor));
    }

    /// Register an async function as an executor.
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, run: F)
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ExecutorResult> + Send + 'static,
    {
        self.register(FnExecutor::new(name, move |job: &Job| -> ExecutorFuture {
            Box::pin(run(job.clone()))
        }));
    }

    /// Look up an executor by name.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Executor>, QueueError> {
        self.executors
            .get(name)
            .cloned()
            .ok_or_else(|| QueueError::UnknownExecutor(name.to_string()))
    }

    pub fn has_executor(&self, name: &str) -> bool {
        self.executors.contains_key(name)
    }

    /// Registered executor names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.executors.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

/// A function-based executor.
pub struct FnExecutor<F>
where
    F: Fn(&Job) -> ExecutorFuture + Send + Sync + 'static,
{
    name: String,
    run: F,
}

impl<F> FnExecutor<F>
where
    F: Fn(&Job) -> ExecutorFuture + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, run: F) -> Self {
        Self {
            name: name.into(),
            run,
        }
    }
}

impl<F> Executor for FnExecutor<F>
where
    F: Fn(&Job) -> ExecutorFuture + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, job: &Job) -> ExecutorFuture {
        (self.run)(job)
    }
}
