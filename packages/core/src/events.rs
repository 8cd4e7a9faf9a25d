//! Notification types published by the queue engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::{Group, GroupId, JobId};

/// Record of one batch load from the store into the memory queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchLoadEvent {
    pub event_id: Ulid,
    pub queue_name: String,
    /// Why the load was triggered (e.g. `job_added`, `empty_queue`, `poll`).
    pub reason: String,
    /// Pages consumed from the store.
    pub total_batches: u32,
    /// Jobs moved into the memory queue.
    pub total_jobs: usize,
    pub loaded_at: DateTime<Utc>,
}

/// Events emitted by the queue engine for observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    // Group events
    /// A group record was created on first submission.
    GroupCreated {
        group: Group,
        timestamp: DateTime<Utc>,
    },
    /// A group was paused.
    GroupPaused {
        queue_name: String,
        group_id: GroupId,
        reason: String,
        affected_jobs: u64,
        timestamp: DateTime<Utc>,
    },
    /// A group was resumed.
    GroupResumed {
        queue_name: String,
        group_id: GroupId,
        reason: String,
        affected_jobs: u64,
        timestamp: DateTime<Utc>,
    },
    /// A group's counters were recomputed from the store.
    GroupStatisticsUpdated {
        group: Group,
        timestamp: DateTime<Utc>,
    },
    /// Empty groups were garbage-collected.
    GroupCleanupCompleted {
        queue_name: Option<String>,
        removed: u64,
        timestamp: DateTime<Utc>,
    },

    // Stream events
    /// Jobs were moved from the store into the memory queue.
    StreamBatchLoaded { batch: BatchLoadEvent },

    // Processing events
    /// The processing loop began draining the memory queue.
    ProcessingStarted {
        queue_name: String,
        timestamp: DateTime<Utc>,
    },
    /// The processing loop exited with an empty memory queue.
    ProcessingDrained {
        queue_name: String,
        processed: u64,
        timestamp: DateTime<Utc>,
    },

    // Job events
    /// A job completed successfully.
    JobCompleted {
        job_id: JobId,
        queue_name: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// A job failed permanently.
    JobFailed {
        job_id: JobId,
        queue_name: String,
        error: String,
        attempts: u32,
        timestamp: DateTime<Utc>,
    },
    /// A failed job was put back to waiting.
    JobRetrying {
        job_id: JobId,
        queue_name: String,
        error: String,
        attempt: u32,
        eligible_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },
}

impl QueueEvent {
    /// Wire name of the notification.
    pub fn name(&self) -> &'static str {
        match self {
            QueueEvent::GroupCreated { .. } => "group:created",
            QueueEvent::GroupPaused { .. } => "group:paused",
            QueueEvent::GroupResumed { .. } => "group:resumed",
            QueueEvent::GroupStatisticsUpdated { .. } => "group:statistics:updated",
            QueueEvent::GroupCleanupCompleted { .. } => "group:cleanup:completed",
            QueueEvent::StreamBatchLoaded { .. } => "stream:batch-loaded",
            QueueEvent::ProcessingStarted { .. } => "processing:started",
            QueueEvent::ProcessingDrained { .. } => "processing:drained",
            QueueEvent::JobCompleted { .. } => "job:completed",
            QueueEvent::JobFailed { .. } => "job:failed",
            QueueEvent::JobRetrying { .. } => "job:retrying",
        }
    }

    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            QueueEvent::GroupCreated { timestamp, .. } => *timestamp,
            QueueEvent::GroupPaused { timestamp, .. } => *timestamp,
            QueueEvent::GroupResumed { timestamp, .. } => *timestamp,
            QueueEvent::GroupStatisticsUpdated { timestamp, .. } => *timestamp,
            QueueEvent::GroupCleanupCompleted { timestamp, .. } => *timestamp,
            QueueEvent::StreamBatchLoaded { batch } => batch.loaded_at,
            QueueEvent::ProcessingStarted { timestamp, .. } => *timestamp,
            QueueEvent::ProcessingDrained { timestamp, .. } => *timestamp,
            QueueEvent::JobCompleted { timestamp, .. } => *timestamp,
            QueueEvent::JobFailed { timestamp, .. } => *timestamp,
            QueueEvent::JobRetrying { timestamp, .. } => *timestamp,
        }
    }

    /// Get the queue name associated with this event, if any.
    pub fn queue_name(&self) -> Option<&str> {
        match self {
            QueueEvent::GroupCreated { group, .. } => Some(&group.queue_name),
            QueueEvent::GroupPaused { queue_name, .. } => Some(queue_name),
            QueueEvent::GroupResumed { queue_name, .. } => Some(queue_name),
            QueueEvent::GroupStatisticsUpdated { group, .. } => Some(&group.queue_name),
            QueueEvent::GroupCleanupCompleted { queue_name, .. } => queue_name.as_deref(),
            QueueEvent::StreamBatchLoaded { batch } => Some(&batch.queue_name),
            QueueEvent::ProcessingStarted { queue_name, .. } => Some(queue_name),
            QueueEvent::ProcessingDrained { queue_name, .. } => Some(queue_name),
            QueueEvent::JobCompleted { queue_name, .. } => Some(queue_name),
            QueueEvent::JobFailed { queue_name, .. } => Some(queue_name),
            QueueEvent::JobRetrying { queue_name, .. } => Some(queue_name),
        }
    }

    /// Get the job ID associated with this event, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            QueueEvent::JobCompleted { job_id, .. } => Some(*job_id),
            QueueEvent::JobFailed { job_id, .. } => Some(*job_id),
            QueueEvent::JobRetrying { job_id, .. } => Some(*job_id),
            _ => None,
        }
    }

    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            QueueEvent::GroupCreated { group, .. } => format!("Group '{}' created", group.id),
            QueueEvent::GroupPaused {
                group_id,
                affected_jobs,
                ..
            } => format!("Group {} paused ({} waiting jobs)", group_id, affected_jobs),
            QueueEvent::GroupResumed { group_id, .. } => format!("Group {} resumed", group_id),
            QueueEvent::GroupStatisticsUpdated { group, .. } => format!(
                "Group {} stats: {}/{} completed, {} failed",
                group.id, group.completed_jobs, group.total_jobs, group.failed_jobs
            ),
            QueueEvent::GroupCleanupCompleted { removed, .. } => {
                format!("Removed {} empty groups", removed)
            }
            QueueEvent::StreamBatchLoaded { batch } => format!(
                "Loaded {} jobs in {} batches ({})",
                batch.total_jobs, batch.total_batches, batch.reason
            ),
            QueueEvent::ProcessingStarted { queue_name, .. } => {
                format!("Queue {} processing started", queue_name)
            }
            QueueEvent::ProcessingDrained {
                queue_name,
                processed,
                ..
            } => format!("Queue {} drained after {} jobs", queue_name, processed),
            QueueEvent::JobCompleted {
                job_id,
                duration_ms,
                ..
            } => format!("Job {} completed in {}ms", job_id, duration_ms),
            QueueEvent::JobFailed { job_id, error, .. } => {
                format!("Job {} failed: {}", job_id, error)
            }
            QueueEvent::JobRetrying {
                job_id, attempt, ..
            } => format!("Job {} retrying (attempt {})", job_id, attempt + 1),
        }
    }
}
