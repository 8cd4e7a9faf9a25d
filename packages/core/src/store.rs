//! Store interfaces consumed by the queue engine.
//!
//! Implementations live outside this crate (see the `db` package). Methods
//! return `Send` futures so the engine can drive them from spawned tasks and
//! actors.

use std::future::Future;

use chrono::{DateTime, Utc};

use crate::{Group, GroupCounts, GroupId, Job, JobId, JobResult, StoreResult};

/// Filter for loading eligible jobs.
#[derive(Debug, Clone)]
pub struct EligibleQuery {
    pub queue_name: String,
    /// Only jobs with `eligible_at <= now` are returned.
    pub now: DateTime<Utc>,
    /// Groups whose waiting jobs must be skipped.
    pub excluded_groups: Vec<GroupId>,
    pub limit: usize,
    pub offset: usize,
}

/// Durable job storage.
pub trait JobStore: Send + Sync + 'static {
    /// Persist a new job.
    fn create(&self, job: &Job) -> impl Future<Output = StoreResult<Job>> + Send;

    /// Persist several jobs.
    fn create_batch(&self, jobs: &[Job]) -> impl Future<Output = StoreResult<Vec<Job>>> + Send;

    /// Look up a job by id.
    fn find_by_id(&self, id: JobId) -> impl Future<Output = StoreResult<Option<Job>>> + Send;

    /// Mark a waiting job running: increments attempts and stamps `started_at`.
    ///
    /// Fails with `StoreError::InvalidState` unless the job is waiting, so two
    /// runners never both start the same job.
    fn mark_running(
        &self,
        id: JobId,
        started_at: DateTime<Utc>,
    ) -> impl Future<Output = StoreResult<Job>> + Send;

    /// Mark a running job completed.
    fn mark_completed(
        &self,
        id: JobId,
        result: Option<JobResult>,
    ) -> impl Future<Output = StoreResult<Job>> + Send;

    /// Mark a running job permanently failed.
    fn mark_failed(&self, id: JobId, error: &str) -> impl Future<Output = StoreResult<Job>> + Send;

    /// Put a running job back to waiting, eligible again at `eligible_at`.
    fn requeue(
        &self,
        id: JobId,
        eligible_at: DateTime<Utc>,
        error: &str,
    ) -> impl Future<Output = StoreResult<Job>> + Send;

    /// Waiting jobs of a queue, eligible now, outside excluded groups,
    /// ordered by priority desc then creation asc.
    fn query_eligible(
        &self,
        query: &EligibleQuery,
    ) -> impl Future<Output = StoreResult<Vec<Job>>> + Send;

    /// Failed jobs of a queue, most recently updated first.
    fn get_failed_jobs(
        &self,
        queue_name: &str,
        limit: usize,
        offset: usize,
    ) -> impl Future<Output = StoreResult<Vec<Job>>> + Send;

    /// Reset a failed job to waiting with a fresh attempt budget.
    fn retry_failed_job(&self, id: JobId) -> impl Future<Output = StoreResult<Job>> + Send;

    /// Count the jobs of one group by status.
    fn count_group_jobs(
        &self,
        queue_name: &str,
        group_id: &GroupId,
    ) -> impl Future<Output = StoreResult<GroupCounts>> + Send;

    /// Running jobs of a queue whose current attempt started before `started_before`.
    fn find_stale_running(
        &self,
        queue_name: &str,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> impl Future<Output = StoreResult<Vec<Job>>> + Send;

    /// Take back a running job whose runner is gone.
    ///
    /// Applies only while the job is still running attempt number `attempts`.
    /// The job returns to waiting, eligible now, when attempts remain and is
    /// marked failed with `error` otherwise.
    fn reclaim_running(
        &self,
        id: JobId,
        attempts: u32,
        error: &str,
    ) -> impl Future<Output = StoreResult<Job>> + Send;
}

/// Durable group storage.
pub trait GroupStore: Send + Sync + 'static {
    /// Create the group if absent. Returns the stored group and whether it was created.
    fn upsert_group(
        &self,
        queue_name: &str,
        group_id: &GroupId,
    ) -> impl Future<Output = StoreResult<(Group, bool)>> + Send;

    fn find_group(
        &self,
        queue_name: &str,
        group_id: &GroupId,
    ) -> impl Future<Output = StoreResult<Option<Group>>> + Send;

    /// Groups of a queue, or of every queue when `queue_name` is `None`.
    fn find_groups_by_queue(
        &self,
        queue_name: Option<&str>,
    ) -> impl Future<Output = StoreResult<Vec<Group>>> + Send;

    fn count_groups(&self, queue_name: &str) -> impl Future<Output = StoreResult<u64>> + Send;

    /// Mark a group paused. Returns the number of its waiting jobs.
    fn pause_group(
        &self,
        queue_name: &str,
        group_id: &GroupId,
        reason: &str,
    ) -> impl Future<Output = StoreResult<u64>> + Send;

    /// Mark a group active again. Returns the number of its waiting jobs.
    fn resume_group(
        &self,
        queue_name: &str,
        group_id: &GroupId,
    ) -> impl Future<Output = StoreResult<u64>> + Send;

    fn paused_group_ids(
        &self,
        queue_name: &str,
    ) -> impl Future<Output = StoreResult<Vec<GroupId>>> + Send;

    /// Replace a group's counters.
    fn save_group_statistics(
        &self,
        queue_name: &str,
        group_id: &GroupId,
        counts: &GroupCounts,
    ) -> impl Future<Output = StoreResult<Group>> + Send;

    /// Remove groups without jobs whose last update is older than `older_than`.
    /// Returns the number of groups removed.
    fn cleanup_empty_groups(
        &self,
        queue_name: Option<&str>,
        older_than: DateTime<Utc>,
    ) -> impl Future<Output = StoreResult<u64>> + Send;
}

/// A store that provides both jobs and groups.
pub trait QueueStore: JobStore + GroupStore {}

impl<T: JobStore + GroupStore> QueueStore for T {}
