//! In-process store used by tests and embedded setups.
//!
//! Mirrors the semantics of [`SurrealStore`](crate::SurrealStore) over plain
//! maps. Availability can be toggled to exercise storage failure paths.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use queue_core::{
    EligibleQuery, Group, GroupCounts, GroupId, GroupStatus, GroupStore, Job, JobId, JobResult,
    JobStatus, JobStore, StoreError, StoreResult,
};
use tokio::sync::RwLock;

#[derive(Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    groups: HashMap<(String, GroupId), Group>,
}

/// Map-backed job and group store. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<State>>,
    unavailable: Arc<AtomicBool>,
    eligible_queries: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with [`StoreError::Unavailable`] until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of eligible-job queries served so far.
    pub fn eligible_queries(&self) -> usize {
        self.eligible_queries.load(Ordering::SeqCst)
    }

    /// Number of stored jobs of a queue with the given status.
    pub async fn count_by_status(&self, queue_name: &str, status: JobStatus) -> usize {
        let state = self.state.read().await;
        state
            .jobs
            .values()
            .filter(|job| job.queue_name == queue_name && job.status == status)
            .count()
    }

    fn check(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".into()));
        }
        Ok(())
    }

    /// Apply `apply` to a job currently in status `from`, stamping `updated_at`.
    async fn transition<F>(&self, id: JobId, from: JobStatus, apply: F) -> StoreResult<Job>
    where
        F: FnOnce(&mut Job) -> StoreResult<()>,
    {
        self.check()?;
        let mut state = self.state.write().await;
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("Job not found: {}", id)))?;
        if job.status != from {
            return Err(StoreError::InvalidState(format!(
                "Job {} is {}, expected {}",
                id, job.status, from
            )));
        }
        apply(job)?;
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    fn counts_for(state: &State, queue_name: &str, group_id: &GroupId) -> GroupCounts {
        let mut counts = GroupCounts::default();
        for job in state.jobs.values() {
            if job.queue_name == queue_name && job.group_id.as_ref() == Some(group_id) {
                counts.add(job.status.as_str(), 1);
            }
        }
        counts
    }

    async fn set_group_status(
        &self,
        queue_name: &str,
        group_id: &GroupId,
        status: GroupStatus,
        reason: Option<&str>,
    ) -> StoreResult<u64> {
        self.check()?;
        let mut state = self.state.write().await;
        let group = state
            .groups
            .entry((queue_name.to_string(), group_id.clone()))
            .or_insert_with(|| Group::new(queue_name, group_id.clone()));
        group.status = status;
        group.paused_reason = reason.map(str::to_string);
        group.updated_at = Utc::now();

        Ok(Self::counts_for(&state, queue_name, group_id).waiting)
    }
}

impl JobStore for MemoryStore {
    async fn create(&self, job: &Job) -> StoreResult<Job> {
        self.check()?;
        let mut state = self.state.write().await;
        if state.jobs.contains_key(&job.id) {
            return Err(StoreError::InvalidState(format!("Job already exists: {}", job.id)));
        }
        state.jobs.insert(job.id, job.clone());
        Ok(job.clone())
    }

    async fn create_batch(&self, jobs: &[Job]) -> StoreResult<Vec<Job>> {
        let mut created = Vec::with_capacity(jobs.len());
        for job in jobs {
            created.push(self.create(job).await?);
        }
        Ok(created)
    }

    async fn find_by_id(&self, id: JobId) -> StoreResult<Option<Job>> {
        self.check()?;
        Ok(self.state.read().await.jobs.get(&id).cloned())
    }

    async fn mark_running(&self, id: JobId, started_at: DateTime<Utc>) -> StoreResult<Job> {
        self.transition(id, JobStatus::Waiting, |job| {
            job.status = JobStatus::Running;
            job.attempts = job.attempts.saturating_add(1);
            job.started_at = Some(started_at);
            Ok(())
        })
        .await
    }

    async fn mark_completed(&self, id: JobId, result: Option<JobResult>) -> StoreResult<Job> {
        self.transition(id, JobStatus::Running, |job| {
            job.status = JobStatus::Completed;
            job.completed_at = Some(Utc::now());
            job.error = None;
            job.result = result;
            Ok(())
        })
        .await
    }

    async fn mark_failed(&self, id: JobId, error: &str) -> StoreResult<Job> {
        self.transition(id, JobStatus::Running, |job| {
            job.status = JobStatus::Failed;
            job.completed_at = Some(Utc::now());
            job.error = Some(error.to_string());
            Ok(())
        })
        .await
    }

    async fn requeue(&self, id: JobId, eligible_at: DateTime<Utc>, error: &str) -> StoreResult<Job> {
        self.transition(id, JobStatus::Running, |job| {
            job.status = JobStatus::Waiting;
            job.eligible_at = eligible_at;
            job.error = Some(error.to_string());
            Ok(())
        })
        .await
    }

    async fn query_eligible(&self, query: &EligibleQuery) -> StoreResult<Vec<Job>> {
        self.check()?;
        self.eligible_queries.fetch_add(1, Ordering::SeqCst);

        let state = self.state.read().await;
        let mut eligible: Vec<&Job> = state
            .jobs
            .values()
            .filter(|job| {
                job.queue_name == query.queue_name
                    && job.status == JobStatus::Waiting
                    && job.is_eligible_at(query.now)
                    && !job
                        .group_id
                        .as_ref()
                        .is_some_and(|g| query.excluded_groups.contains(g))
            })
            .collect();

        eligible.sort_by(|a, b| {
            b.priority
                .rank()
                .cmp(&a.priority.rank())
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });

        Ok(eligible
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .cloned()
            .collect())
    }

    async fn get_failed_jobs(
        &self,
        queue_name: &str,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<Job>> {
        self.check()?;
        let state = self.state.read().await;
        let mut failed: Vec<&Job> = state
            .jobs
            .values()
            .filter(|job| job.queue_name == queue_name && job.status == JobStatus::Failed)
            .collect();
        failed.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

        Ok(failed.into_iter().skip(offset).take(limit).cloned().collect())
    }

    async fn retry_failed_job(&self, id: JobId) -> StoreResult<Job> {
        self.transition(id, JobStatus::Failed, |job| {
            job.status = JobStatus::Waiting;
            job.attempts = 0;
            job.error = None;
            job.started_at = None;
            job.completed_at = None;
            job.eligible_at = Utc::now();
            Ok(())
        })
        .await
    }

    async fn count_group_jobs(&self, queue_name: &str, group_id: &GroupId) -> StoreResult<GroupCounts> {
        self.check()?;
        let state = self.state.read().await;
        Ok(Self::counts_for(&state, queue_name, group_id))
    }

    async fn find_stale_running(
        &self,
        queue_name: &str,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Job>> {
        self.check()?;
        let state = self.state.read().await;
        let mut stale: Vec<&Job> = state
            .jobs
            .values()
            .filter(|job| {
                job.queue_name == queue_name
                    && job.status == JobStatus::Running
                    && job.started_at.is_some_and(|at| at < started_before)
            })
            .collect();
        stale.sort_by_key(|job| job.started_at);

        Ok(stale.into_iter().take(limit).cloned().collect())
    }

    async fn reclaim_running(&self, id: JobId, attempts: u32, error: &str) -> StoreResult<Job> {
        self.transition(id, JobStatus::Running, |job| {
            if job.attempts != attempts {
                return Err(StoreError::InvalidState(format!(
                    "Job {} moved on to attempt {}",
                    id, job.attempts
                )));
            }
            let now = Utc::now();
            if job.has_attempts_left() {
                job.status = JobStatus::Waiting;
                job.eligible_at = now;
            } else {
                job.status = JobStatus::Failed;
                job.completed_at = Some(now);
            }
            job.error = Some(error.to_string());
            Ok(())
        })
        .await
    }
}

impl GroupStore for MemoryStore {
    async fn upsert_group(&self, queue_name: &str, group_id: &GroupId) -> StoreResult<(Group, bool)> {
        self.check()?;
        let mut state = self.state.write().await;
        let key = (queue_name.to_string(), group_id.clone());
        if let Some(group) = state.groups.get(&key) {
            return Ok((group.clone(), false));
        }
        let group = Group::new(queue_name, group_id.clone());
        state.groups.insert(key, group.clone());
        Ok((group, true))
    }

    async fn find_group(&self, queue_name: &str, group_id: &GroupId) -> StoreResult<Option<Group>> {
        self.check()?;
        let state = self.state.read().await;
        Ok(state
            .groups
            .get(&(queue_name.to_string(), group_id.clone()))
            .cloned())
    }

    async fn find_groups_by_queue(&self, queue_name: Option<&str>) -> StoreResult<Vec<Group>> {
        self.check()?;
        let state = self.state.read().await;
        let mut groups: Vec<Group> = state
            .groups
            .values()
            .filter(|g| queue_name.is_none_or(|q| g.queue_name == q))
            .cloned()
            .collect();
        groups.sort_by(|a, b| (&a.queue_name, &a.id).cmp(&(&b.queue_name, &b.id)));
        Ok(groups)
    }

    async fn count_groups(&self, queue_name: &str) -> StoreResult<u64> {
        self.check()?;
        let state = self.state.read().await;
        Ok(state
            .groups
            .values()
            .filter(|g| g.queue_name == queue_name)
            .count() as u64)
    }

    async fn pause_group(&self, queue_name: &str, group_id: &GroupId, reason: &str) -> StoreResult<u64> {
        self.set_group_status(queue_name, group_id, GroupStatus::Paused, Some(reason))
            .await
    }

    async fn resume_group(&self, queue_name: &str, group_id: &GroupId) -> StoreResult<u64> {
        self.set_group_status(queue_name, group_id, GroupStatus::Active, None)
            .await
    }

    async fn paused_group_ids(&self, queue_name: &str) -> StoreResult<Vec<GroupId>> {
        self.check()?;
        let state = self.state.read().await;
        Ok(state
            .groups
            .values()
            .filter(|g| g.queue_name == queue_name && g.is_paused())
            .map(|g| g.id.clone())
            .collect())
    }

    async fn save_group_statistics(
        &self,
        queue_name: &str,
        group_id: &GroupId,
        counts: &GroupCounts,
    ) -> StoreResult<Group> {
        self.check()?;
        let mut state = self.state.write().await;
        let group = state
            .groups
            .entry((queue_name.to_string(), group_id.clone()))
            .or_insert_with(|| Group::new(queue_name, group_id.clone()));
        group.apply_counts(counts);
        Ok(group.clone())
    }

    async fn cleanup_empty_groups(
        &self,
        queue_name: Option<&str>,
        older_than: DateTime<Utc>,
    ) -> StoreResult<u64> {
        self.check()?;
        let mut state = self.state.write().await;

        let stale: Vec<(String, GroupId)> = state
            .groups
            .iter()
            .filter(|((queue, _), group)| {
                queue_name.is_none_or(|q| queue == q) && group.updated_at < older_than
            })
            .filter(|((queue, id), _)| Self::counts_for(&state, queue, id).total == 0)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &stale {
            state.groups.remove(key);
        }
        Ok(stale.len() as u64)
    }
}
