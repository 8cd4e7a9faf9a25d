//! Queue engine built on Ractor actors.
//!
//! # Architecture
//!
//! - `MemoryQueue` - Bounded priority queue of staged jobs (the watermark)
//! - `JobStream` - Loads eligible jobs from the store into the memory queue
//! - `JobExecutionService` - Drains the memory queue inside an `ExecutionActor`
//! - `GroupManagementService` - Pause/resume and group maintenance (`GroupMaintenanceActor`)
//! - `QueueManager` - Facade wiring the above together around the watermark check
//!
//! # Usage
//!
//! ```ignore
//! use engine::{ExecutorRegistry, QueueManager};
//!
//! let mut executors = ExecutorRegistry::new();
//! executors.register_fn("echo", |job| async move { Ok(JobResult::new("ok")) });
//!
//! let manager = QueueManager::new(QueueConfig::new("emails"), Arc::new(store), executors)?;
//! manager.start().await?;
//! manager.add_task(Job::new("emails", "welcome", "echo", payload)).await?;
//! ```

mod events;
mod execution;
mod executor;
mod groups;
mod job_stream;
mod manager;
mod memory_queue;
mod messages;

pub use events::EventBus;
pub use execution::JobExecutionService;
pub use executor::{Executor, ExecutorFuture, ExecutorRegistry, ExecutorResult, FnExecutor};
pub use groups::{GroupManagementService, GroupOperationResult};
pub use job_stream::{JobStream, LoadCursor};
pub use manager::{QueueCheckOutcome, QueueManager, RetryResult};
pub use memory_queue::MemoryQueue;
