//! Core domain types for the job queue engine.
//!
//! This crate contains shared types used across all packages:
//! - Job, JobStatus and Priority for work items
//! - Group and GroupStatus for pause/resume coordination
//! - QueueConfig and the derived statistics snapshots
//! - QueueEvent notifications
//! - The JobStore / GroupStore interfaces implemented by the `db` package

mod error;
mod events;
mod group;
mod job;
mod queue;
mod store;

pub use error::{ConfigError, QueueError, StoreError, StoreResult};
pub use events::{BatchLoadEvent, QueueEvent};
pub use group::{Group, GroupCounts, GroupId, GroupStatus};
pub use job::{DEFAULT_MAX_ATTEMPTS, Job, JobId, JobResult, JobStatus, Priority};
pub use queue::{
    BackoffPolicy, ExecutionStatistics, FailedTaskStats, QueueConfig, QueueStatistics, UNGROUPED,
};
pub use store::{EligibleQuery, GroupStore, JobStore, QueueStore};
