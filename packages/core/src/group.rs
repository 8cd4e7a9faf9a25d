//! Group domain types for coordinating related jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a group, chosen by the producer and scoped to a queue.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub String);

impl GroupId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for GroupId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for GroupId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Scheduling state of a group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    /// Jobs of this group are loaded normally.
    #[default]
    Active,
    /// Waiting jobs of this group are excluded from batch loads.
    Paused,
}

impl GroupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupStatus::Active => "active",
            GroupStatus::Paused => "paused",
        }
    }
}

impl std::fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job counts of one group, derived from the job store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupCounts {
    pub total: u64,
    pub waiting: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
}

impl GroupCounts {
    /// Accumulate `count` jobs with the given stored status string.
    pub fn add(&mut self, status: &str, count: u64) {
        self.total += count;
        match status {
            "waiting" | "paused" => self.waiting += count,
            "running" => self.running += count,
            "completed" => self.completed += count,
            "failed" => self.failed += count,
            _ => {}
        }
    }
}

/// A group is an aggregation handle over jobs sharing a group id.
///
/// Groups own no jobs; jobs reference them by id. Counters are a cached
/// read-aggregate of the job store and are only ever replaced wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub queue_name: String,
    pub status: GroupStatus,
    pub total_jobs: u64,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Group {
    /// Create a new active group with zero counters.
    pub fn new(queue_name: impl Into<String>, id: impl Into<GroupId>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            queue_name: queue_name.into(),
            status: GroupStatus::Active,
            total_jobs: 0,
            completed_jobs: 0,
            failed_jobs: 0,
            paused_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.status == GroupStatus::Paused
    }

    /// Replace the counters with freshly derived ones.
    ///
    /// `updated_at` only moves when a counter changed, so an idle empty group
    /// ages towards cleanup even while it keeps being synced. Returns whether
    /// anything changed.
    pub fn apply_counts(&mut self, counts: &GroupCounts) -> bool {
        let completed = counts.completed.min(counts.total);
        let failed = counts.failed.min(counts.total - completed);
        let changed = self.total_jobs != counts.total
            || self.completed_jobs != completed
            || self.failed_jobs != failed;

        if changed {
            self.total_jobs = counts.total;
            self.completed_jobs = completed;
            self.failed_jobs = failed;
            self.updated_at = Utc::now();
        }
        changed
    }

    /// Jobs that are neither completed nor failed.
    pub fn outstanding_jobs(&self) -> u64 {
        self.total_jobs
            .saturating_sub(self.completed_jobs + self.failed_jobs)
    }
}
