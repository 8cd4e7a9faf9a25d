//! Job repository for CRUD operations.

use chrono::{DateTime, Utc};
use queue_core::{
    EligibleQuery, GroupCounts, GroupId, Job, JobId, JobResult, JobStatus,
};
use serde::{Deserialize, Serialize};
use surrealdb::sql::Thing;

use super::retry_on_conflict;
use crate::{Database, DbError};

/// Repository for job persistence operations.
#[derive(Clone)]
pub struct JobRepository {
    db: Database,
}

/// Internal record type for SurrealDB.
///
/// The job itself travels as JSON text: SurrealDB stores a JSON `null` as
/// NONE and drops the field, so payloads and metadata are kept opaque.
#[derive(Debug, Serialize, Deserialize)]
struct JobRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Thing>,
    queue_name: String,
    status: String,
    group_id: Option<String>,
    executor: String,
    priority_rank: u8,
    attempts: u32,
    created_ns: i64,
    eligible_ns: i64,
    started_ns: Option<i64>,
    updated_ns: i64,
    document: String,
}

impl JobRecord {
    fn from_job(job: &Job) -> Result<Self, DbError> {
        Ok(Self {
            id: None,
            queue_name: job.queue_name.clone(),
            status: job.status.as_str().to_string(),
            group_id: job.group_id.as_ref().map(|g| g.0.clone()),
            executor: job.executor.clone(),
            priority_rank: job.priority.rank(),
            attempts: job.attempts,
            created_ns: nanos(job.created_at),
            eligible_ns: nanos(job.eligible_at),
            started_ns: job.started_at.map(nanos),
            updated_ns: nanos(job.updated_at),
            document: serde_json::to_string(job)?,
        })
    }

    fn into_job(self) -> Result<Job, DbError> {
        Ok(serde_json::from_str(&self.document)?)
    }
}

fn into_jobs(records: Vec<JobRecord>) -> Result<Vec<Job>, DbError> {
    records.into_iter().map(JobRecord::into_job).collect()
}

fn wrong_status(job: &Job, expected: JobStatus) -> DbError {
    DbError::InvalidState(format!(
        "Job {} is {}, expected {}",
        job.id, job.status, expected
    ))
}

/// Timestamps are mirrored as integer nanoseconds so the store can compare
/// and order them without datetime coercion.
pub(crate) fn nanos(at: DateTime<Utc>) -> i64 {
    at.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Filter options for listing jobs.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub queue_name: Option<String>,
    pub status: Option<JobStatus>,
    pub group_id: Option<GroupId>,
    pub executor: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl JobRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new job in the database.
    pub async fn create(&self, job: &Job) -> Result<Job, DbError> {
        let record: Option<JobRecord> = self
            .db
            .create(("job", job.id.to_string()))
            .content(JobRecord::from_job(job)?)
            .await?;

        record
            .ok_or_else(|| DbError::Query("Failed to create job".into()))?
            .into_job()
    }

    /// Get a job by ID.
    pub async fn get(&self, id: JobId) -> Result<Job, DbError> {
        self.find(id)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("Job not found: {}", id)))
    }

    /// Get a job by ID, if it exists.
    pub async fn find(&self, id: JobId) -> Result<Option<Job>, DbError> {
        let record: Option<JobRecord> = self.db.select(("job", id.to_string())).await?;
        record.map(JobRecord::into_job).transpose()
    }

    /// Replace a stored job, refreshing `updated_at`.
    pub async fn update(&self, job: &Job) -> Result<Job, DbError> {
        let mut updated = job.clone();
        updated.updated_at = Utc::now();

        let record: Option<JobRecord> = self
            .db
            .update(("job", job.id.to_string()))
            .content(JobRecord::from_job(&updated)?)
            .await?;

        record
            .ok_or_else(|| DbError::NotFound(format!("Job not found: {}", job.id)))?
            .into_job()
    }

    /// Delete a job.
    pub async fn delete(&self, id: JobId) -> Result<(), DbError> {
        let _: Option<JobRecord> = self.db.delete(("job", id.to_string())).await?;
        Ok(())
    }

    /// List jobs with optional filtering, most recently updated first.
    pub async fn list(&self, filter: JobFilter) -> Result<Vec<Job>, DbError> {
        let mut conditions = Vec::new();
        let mut bindings: Vec<(&str, serde_json::Value)> = Vec::new();

        if let Some(queue_name) = &filter.queue_name {
            conditions.push("queue_name = $queue_name");
            bindings.push(("queue_name", serde_json::json!(queue_name)));
        }

        if let Some(status) = &filter.status {
            conditions.push("status = $status");
            bindings.push(("status", serde_json::json!(status.as_str())));
        }

        if let Some(group_id) = &filter.group_id {
            conditions.push("group_id = $group_id");
            bindings.push(("group_id", serde_json::json!(group_id.as_str())));
        }

        if let Some(executor) = &filter.executor {
            conditions.push("executor = $executor");
            bindings.push(("executor", serde_json::json!(executor)));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let limit_clause = filter
            .limit
            .map(|l| format!("LIMIT {}", l))
            .unwrap_or_default();

        let offset_clause = filter
            .offset
            .map(|o| format!("START {}", o))
            .unwrap_or_default();

        let query = format!(
            "SELECT * FROM job {} ORDER BY updated_ns DESC {} {}",
            where_clause, limit_clause, offset_clause
        );

        let mut result = self.db.query(&query);

        for (name, value) in bindings {
            result = result.bind((name.to_string(), value));
        }

        let mut response = result.await?;
        let records: Vec<JobRecord> = response.take(0)?;

        into_jobs(records)
    }

    /// Waiting jobs eligible for a batch load, by priority and creation time.
    pub async fn query_eligible(&self, query: &EligibleQuery) -> Result<Vec<Job>, DbError> {
        let excluded: Vec<String> = query
            .excluded_groups
            .iter()
            .map(|g| g.0.clone())
            .collect();

        let mut result = self
            .db
            .query(
                r#"
                SELECT * FROM job
                WHERE queue_name = $queue_name
                    AND status = "waiting"
                    AND eligible_ns <= $now
                    AND group_id NOTINSIDE $excluded
                ORDER BY priority_rank DESC, created_ns ASC, id ASC
                LIMIT $limit START $offset
                "#,
            )
            .bind(("queue_name", query.queue_name.clone()))
            .bind(("now", nanos(query.now)))
            .bind(("excluded", excluded))
            .bind(("limit", query.limit as i64))
            .bind(("offset", query.offset as i64))
            .await?;

        let records: Vec<JobRecord> = result.take(0)?;

        into_jobs(records)
    }

    /// Running jobs of a queue whose current attempt started before `started_before`.
    pub async fn find_stale_running(
        &self,
        queue_name: &str,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, DbError> {
        let mut result = self
            .db
            .query(
                r#"
                SELECT * FROM job
                WHERE queue_name = $queue_name
                    AND status = "running"
                    AND started_ns < $before
                ORDER BY started_ns ASC
                LIMIT $limit
                "#,
            )
            .bind(("queue_name", queue_name.to_string()))
            .bind(("before", nanos(started_before)))
            .bind(("limit", limit as i64))
            .await?;

        let records: Vec<JobRecord> = result.take(0)?;

        into_jobs(records)
    }

    /// Apply `change` to a job that is in status `from` (and on attempt
    /// `on_attempt`, when given).
    ///
    /// The write only lands if status and attempts are still what was read;
    /// losing that race, or finding the job elsewhere, yields
    /// `DbError::InvalidState`.
    async fn transition<F>(
        &self,
        id: JobId,
        from: JobStatus,
        on_attempt: Option<u32>,
        change: F,
    ) -> Result<Job, DbError>
    where
        F: Fn(&mut Job),
    {
        let this = self;
        let change = &change;
        retry_on_conflict(move || async move {
            let mut job = this.get(id).await?;
            if job.status != from {
                return Err(wrong_status(&job, from));
            }
            if on_attempt.is_some_and(|attempt| attempt != job.attempts) {
                return Err(DbError::InvalidState(format!(
                    "Job {} moved on to attempt {}",
                    id, job.attempts
                )));
            }
            let read_attempts = job.attempts;

            change(&mut job);
            job.updated_at = Utc::now();

            let mut result = this
                .db
                .query(
                    r#"
                    UPDATE type::thing("job", $id) CONTENT $record
                    WHERE status = $status AND attempts = $attempts
                    RETURN AFTER
                    "#,
                )
                .bind(("id", id.to_string()))
                .bind(("record", JobRecord::from_job(&job)?))
                .bind(("status", from.as_str()))
                .bind(("attempts", read_attempts))
                .await?;

            let records: Vec<JobRecord> = result.take(0)?;
            match records.into_iter().next() {
                Some(record) => record.into_job(),
                None => Err(DbError::InvalidState(format!(
                    "Job {} changed while moving out of {}",
                    id, from
                ))),
            }
        })
        .await
    }

    /// Mark a waiting job running, counting the attempt.
    pub async fn mark_running(&self, id: JobId, started_at: DateTime<Utc>) -> Result<Job, DbError> {
        self.transition(id, JobStatus::Waiting, None, |job| {
            job.status = JobStatus::Running;
            job.attempts = job.attempts.saturating_add(1);
            job.started_at = Some(started_at);
        })
        .await
    }

    /// Mark a running job completed with its result.
    pub async fn mark_completed(&self, id: JobId, result: Option<JobResult>) -> Result<Job, DbError> {
        self.transition(id, JobStatus::Running, None, |job| {
            job.status = JobStatus::Completed;
            job.completed_at = Some(Utc::now());
            job.error = None;
            job.result = result.clone();
        })
        .await
    }

    /// Mark a running job permanently failed.
    pub async fn mark_failed(&self, id: JobId, error: &str) -> Result<Job, DbError> {
        self.transition(id, JobStatus::Running, None, |job| {
            job.status = JobStatus::Failed;
            job.completed_at = Some(Utc::now());
            job.error = Some(error.to_string());
        })
        .await
    }

    /// Put a running job back to waiting after a retryable failure.
    pub async fn requeue(
        &self,
        id: JobId,
        eligible_at: DateTime<Utc>,
        error: &str,
    ) -> Result<Job, DbError> {
        self.transition(id, JobStatus::Running, None, |job| {
            job.status = JobStatus::Waiting;
            job.eligible_at = eligible_at;
            job.error = Some(error.to_string());
        })
        .await
    }

    /// Take back a running job whose runner is gone, if it is still on
    /// attempt number `attempts`.
    pub async fn reclaim(&self, id: JobId, attempts: u32, error: &str) -> Result<Job, DbError> {
        self.transition(id, JobStatus::Running, Some(attempts), |job| {
            let now = Utc::now();
            if job.has_attempts_left() {
                job.status = JobStatus::Waiting;
                job.eligible_at = now;
            } else {
                job.status = JobStatus::Failed;
                job.completed_at = Some(now);
            }
            job.error = Some(error.to_string());
        })
        .await
    }

    /// Reset a failed job so it is loaded again with a fresh attempt budget.
    pub async fn retry_failed(&self, id: JobId) -> Result<Job, DbError> {
        self.transition(id, JobStatus::Failed, None, |job| {
            job.status = JobStatus::Waiting;
            job.attempts = 0;
            job.error = None;
            job.started_at = None;
            job.completed_at = None;
            job.eligible_at = Utc::now();
        })
        .await
    }

    /// Count the jobs of one group by status.
    pub async fn count_by_group(
        &self,
        queue_name: &str,
        group_id: &GroupId,
    ) -> Result<GroupCounts, DbError> {
        let mut result = self
            .db
            .query(
                r#"
                SELECT status, count() AS count
                FROM job
                WHERE queue_name = $queue_name AND group_id = $group_id
                GROUP BY status
                "#,
            )
            .bind(("queue_name", queue_name.to_string()))
            .bind(("group_id", group_id.0.clone()))
            .await?;

        #[derive(Deserialize)]
        struct StatusCount {
            status: Option<String>,
            count: i64,
        }

        let rows: Vec<StatusCount> = result.take(0)?;

        let mut counts = GroupCounts::default();
        for row in rows {
            if let Some(status) = row.status {
                counts.add(&status, row.count.max(0) as u64);
            }
        }

        Ok(counts)
    }

    /// Count waiting jobs of one group.
    pub async fn count_waiting_in_group(
        &self,
        queue_name: &str,
        group_id: &GroupId,
    ) -> Result<u64, DbError> {
        let mut result = self
            .db
            .query(
                r#"
                SELECT count() AS count FROM job
                WHERE queue_name = $queue_name AND group_id = $group_id AND status = "waiting"
                GROUP ALL
                "#,
            )
            .bind(("queue_name", queue_name.to_string()))
            .bind(("group_id", group_id.0.clone()))
            .await?;

        #[derive(Deserialize)]
        struct CountResult {
            count: i64,
        }

        let counts: Vec<CountResult> = result.take(0)?;

        Ok(counts.first().map_or(0, |c| c.count.max(0) as u64))
    }
}
