//! SurrealDB-backed implementation of the engine's store interfaces.

use chrono::{DateTime, Utc};
use queue_core::{
    EligibleQuery, Group, GroupCounts, GroupId, GroupStatus, GroupStore, Job, JobId, JobResult,
    JobStatus, JobStore, StoreResult,
};

use crate::repositories::{GroupRepository, JobFilter, JobRepository};
use crate::{Database, DbConfig, DbError, connect, init_schema};

/// Job and group store over one SurrealDB connection.
#[derive(Clone)]
pub struct SurrealStore {
    jobs: JobRepository,
    groups: GroupRepository,
}

impl SurrealStore {
    /// Wrap an existing connection. The schema must already be initialized.
    pub fn new(db: Database) -> Self {
        Self {
            jobs: JobRepository::new(db.clone()),
            groups: GroupRepository::new(db),
        }
    }

    /// Connect, initialize the schema and wrap the connection.
    pub async fn open(config: &DbConfig) -> Result<Self, DbError> {
        let db = connect(config).await?;
        init_schema(&db).await?;
        Ok(Self::new(db))
    }

    pub fn jobs(&self) -> &JobRepository {
        &self.jobs
    }

    pub fn groups(&self) -> &GroupRepository {
        &self.groups
    }
}

impl JobStore for SurrealStore {
    async fn create(&self, job: &Job) -> StoreResult<Job> {
        Ok(self.jobs.create(job).await?)
    }

    async fn create_batch(&self, jobs: &[Job]) -> StoreResult<Vec<Job>> {
        let mut created = Vec::with_capacity(jobs.len());
        for job in jobs {
            created.push(self.jobs.create(job).await?);
        }
        Ok(created)
    }

    async fn find_by_id(&self, id: JobId) -> StoreResult<Option<Job>> {
        Ok(self.jobs.find(id).await?)
    }

    async fn mark_running(&self, id: JobId, started_at: DateTime<Utc>) -> StoreResult<Job> {
        Ok(self.jobs.mark_running(id, started_at).await?)
    }

    async fn mark_completed(&self, id: JobId, result: Option<JobResult>) -> StoreResult<Job> {
        Ok(self.jobs.mark_completed(id, result).await?)
    }

    async fn mark_failed(&self, id: JobId, error: &str) -> StoreResult<Job> {
        Ok(self.jobs.mark_failed(id, error).await?)
    }

    async fn requeue(&self, id: JobId, eligible_at: DateTime<Utc>, error: &str) -> StoreResult<Job> {
        Ok(self.jobs.requeue(id, eligible_at, error).await?)
    }

    async fn query_eligible(&self, query: &EligibleQuery) -> StoreResult<Vec<Job>> {
        Ok(self.jobs.query_eligible(query).await?)
    }

    async fn get_failed_jobs(
        &self,
        queue_name: &str,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<Job>> {
        let filter = JobFilter {
            queue_name: Some(queue_name.to_string()),
            status: Some(JobStatus::Failed),
            limit: Some(limit),
            offset: Some(offset),
            ..Default::default()
        };
        Ok(self.jobs.list(filter).await?)
    }

    async fn retry_failed_job(&self, id: JobId) -> StoreResult<Job> {
        Ok(self.jobs.retry_failed(id).await?)
    }

    async fn count_group_jobs(&self, queue_name: &str, group_id: &GroupId) -> StoreResult<GroupCounts> {
        Ok(self.jobs.count_by_group(queue_name, group_id).await?)
    }

    async fn find_stale_running(
        &self,
        queue_name: &str,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Job>> {
        Ok(self
            .jobs
            .find_stale_running(queue_name, started_before, limit)
            .await?)
    }

    async fn reclaim_running(&self, id: JobId, attempts: u32, error: &str) -> StoreResult<Job> {
        Ok(self.jobs.reclaim(id, attempts, error).await?)
    }
}

impl GroupStore for SurrealStore {
    async fn upsert_group(&self, queue_name: &str, group_id: &GroupId) -> StoreResult<(Group, bool)> {
        Ok(self.groups.upsert(queue_name, group_id).await?)
    }

    async fn find_group(&self, queue_name: &str, group_id: &GroupId) -> StoreResult<Option<Group>> {
        Ok(self.groups.find(queue_name, group_id).await?)
    }

    async fn find_groups_by_queue(&self, queue_name: Option<&str>) -> StoreResult<Vec<Group>> {
        Ok(self.groups.list(queue_name).await?)
    }

    async fn count_groups(&self, queue_name: &str) -> StoreResult<u64> {
        Ok(self.groups.count(queue_name).await?)
    }

    async fn pause_group(&self, queue_name: &str, group_id: &GroupId, reason: &str) -> StoreResult<u64> {
        self.groups
            .set_status(queue_name, group_id, GroupStatus::Paused, Some(reason))
            .await?;
        Ok(self.jobs.count_waiting_in_group(queue_name, group_id).await?)
    }

    async fn resume_group(&self, queue_name: &str, group_id: &GroupId) -> StoreResult<u64> {
        self.groups
            .set_status(queue_name, group_id, GroupStatus::Active, None)
            .await?;
        Ok(self.jobs.count_waiting_in_group(queue_name, group_id).await?)
    }

    async fn paused_group_ids(&self, queue_name: &str) -> StoreResult<Vec<GroupId>> {
        Ok(self.groups.paused_ids(queue_name).await?)
    }

    async fn save_group_statistics(
        &self,
        queue_name: &str,
        group_id: &GroupId,
        counts: &GroupCounts,
    ) -> StoreResult<Group> {
        Ok(self.groups.save_counts(queue_name, group_id, counts).await?)
    }

    async fn cleanup_empty_groups(
        &self,
        queue_name: Option<&str>,
        older_than: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut removed = 0;
        for group in self.groups.list(queue_name).await? {
            if group.updated_at >= older_than {
                continue;
            }
            let counts = self.jobs.count_by_group(&group.queue_name, &group.id).await?;
            if counts.total == 0 {
                self.groups.delete(&group.queue_name, &group.id).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
