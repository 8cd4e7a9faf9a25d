//! Error taxonomy shared by the store, the engine and the bootstrap binary.

use thiserror::Error;

use crate::JobId;

/// Errors raised by job/group store implementations.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Query error: {0}")]
    Query(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Write conflict: {0}")]
    Conflict(String),
}

impl StoreError {
    /// Whether the same call may succeed if repeated shortly after.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Connection(_) | StoreError::Unavailable(_) | StoreError::Conflict(_)
        )
    }
}

/// Result type returned by store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by the queue engine.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    /// The memory queue is at its watermark.
    #[error("Memory queue is full (watermark {watermark})")]
    CapacityExceeded { watermark: usize },

    /// The durable store failed; the next watermark check may retry.
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    /// No executor is registered under the job's executor name.
    #[error("unknown executor: {0}")]
    UnknownExecutor(String),

    /// The executor reported a failure; retryable up to the job's attempt budget.
    #[error("executor failure: {0}")]
    ExecutorFailure(String),

    /// A facade-level wait elapsed.
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Actor error: {0}")]
    Actor(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl QueueError {
    /// Whether a job failing with this error may be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueueError::ExecutorFailure(_) | QueueError::Storage(_))
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
    #[error("{0} must be greater than zero")]
    MustBePositive(&'static str),
}
