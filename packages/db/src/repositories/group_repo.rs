//! Group repository for CRUD operations.
//!
//! Status and counters are written with field-level `UPDATE ... SET`
//! statements, so a statistics sync never overwrites a concurrent pause.

use chrono::{DateTime, Utc};
use queue_core::{Group, GroupCounts, GroupId, GroupStatus};
use serde::{Deserialize, Serialize};
use surrealdb::sql::Thing;

use super::retry_on_conflict;
use crate::repositories::job_repo::nanos;
use crate::{Database, DbError};

/// Repository for group persistence operations.
#[derive(Clone)]
pub struct GroupRepository {
    db: Database,
}

/// Internal record type for SurrealDB.
#[derive(Debug, Serialize, Deserialize)]
struct GroupRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Thing>,
    queue_name: String,
    group_id: String,
    status: String,
    paused_reason: Option<String>,
    total_jobs: u64,
    completed_jobs: u64,
    failed_jobs: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    updated_ns: i64,
}

impl GroupRecord {
    fn from_group(group: &Group) -> Self {
        Self {
            id: None,
            queue_name: group.queue_name.clone(),
            group_id: group.id.0.clone(),
            status: group.status.as_str().to_string(),
            paused_reason: group.paused_reason.clone(),
            total_jobs: group.total_jobs,
            completed_jobs: group.completed_jobs,
            failed_jobs: group.failed_jobs,
            created_at: group.created_at,
            updated_at: group.updated_at,
            updated_ns: nanos(group.updated_at),
        }
    }

    fn into_group(self) -> Group {
        let status = if self.status == GroupStatus::Paused.as_str() {
            GroupStatus::Paused
        } else {
            GroupStatus::Active
        };

        Group {
            id: GroupId(self.group_id),
            queue_name: self.queue_name,
            status,
            total_jobs: self.total_jobs,
            completed_jobs: self.completed_jobs,
            failed_jobs: self.failed_jobs,
            paused_reason: self.paused_reason,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Record key of a group; group ids are only unique within a queue.
fn record_key(queue_name: &str, group_id: &GroupId) -> String {
    format!("{}::{}", queue_name, group_id)
}

impl GroupRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new group in the database.
    pub async fn create(&self, group: &Group) -> Result<Group, DbError> {
        let record: Option<GroupRecord> = self
            .db
            .create(("job_group", record_key(&group.queue_name, &group.id)))
            .content(GroupRecord::from_group(group))
            .await?;

        record
            .map(GroupRecord::into_group)
            .ok_or_else(|| DbError::Query("Failed to create group".into()))
    }

    /// Get a group, if it exists.
    pub async fn find(&self, queue_name: &str, group_id: &GroupId) -> Result<Option<Group>, DbError> {
        let record: Option<GroupRecord> = self
            .db
            .select(("job_group", record_key(queue_name, group_id)))
            .await?;
        Ok(record.map(GroupRecord::into_group))
    }

    /// Get a group or create it when absent. Returns whether it was created.
    ///
    /// Losing a creation race to another writer returns the winner's group.
    pub async fn upsert(&self, queue_name: &str, group_id: &GroupId) -> Result<(Group, bool), DbError> {
        retry_on_conflict(|| async {
            if let Some(group) = self.find(queue_name, group_id).await? {
                return Ok((group, false));
            }

            match self.create(&Group::new(queue_name, group_id.clone())).await {
                Ok(created) => Ok((created, true)),
                Err(e) if e.is_conflict() => Err(e),
                Err(e) => match self.find(queue_name, group_id).await? {
                    Some(group) => Ok((group, false)),
                    None => Err(e),
                },
            }
        })
        .await
    }

    /// Delete a group.
    pub async fn delete(&self, queue_name: &str, group_id: &GroupId) -> Result<(), DbError> {
        let _: Option<GroupRecord> = self
            .db
            .delete(("job_group", record_key(queue_name, group_id)))
            .await?;
        Ok(())
    }

    /// List groups of one queue, or of all queues.
    pub async fn list(&self, queue_name: Option<&str>) -> Result<Vec<Group>, DbError> {
        let mut response = match queue_name {
            Some(queue_name) => {
                self.db
                    .query("SELECT * FROM job_group WHERE queue_name = $queue_name ORDER BY group_id ASC")
                    .bind(("queue_name", queue_name.to_string()))
                    .await?
            }
            None => {
                self.db
                    .query("SELECT * FROM job_group ORDER BY queue_name ASC, group_id ASC")
                    .await?
            }
        };

        let records: Vec<GroupRecord> = response.take(0)?;

        Ok(records.into_iter().map(GroupRecord::into_group).collect())
    }

    /// Count the groups of a queue.
    pub async fn count(&self, queue_name: &str) -> Result<u64, DbError> {
        let mut result = self
            .db
            .query("SELECT count() AS count FROM job_group WHERE queue_name = $queue_name GROUP ALL")
            .bind(("queue_name", queue_name.to_string()))
            .await?;

        #[derive(Deserialize)]
        struct CountResult {
            count: i64,
        }

        let counts: Vec<CountResult> = result.take(0)?;

        Ok(counts.first().map_or(0, |c| c.count.max(0) as u64))
    }

    /// Ids of the paused groups of a queue.
    pub async fn paused_ids(&self, queue_name: &str) -> Result<Vec<GroupId>, DbError> {
        let mut result = self
            .db
            .query(
                r#"SELECT group_id FROM job_group WHERE queue_name = $queue_name AND status = "paused""#,
            )
            .bind(("queue_name", queue_name.to_string()))
            .await?;

        #[derive(Deserialize)]
        struct PausedRow {
            group_id: String,
        }

        let rows: Vec<PausedRow> = result.take(0)?;

        Ok(rows.into_iter().map(|r| GroupId(r.group_id)).collect())
    }

    /// Set a group's status, creating the group when absent.
    ///
    /// Only status, reason and update time are written; counters are left
    /// to the statistics sync.
    pub async fn set_status(
        &self,
        queue_name: &str,
        group_id: &GroupId,
        status: GroupStatus,
        reason: Option<&str>,
    ) -> Result<Group, DbError> {
        self.upsert(queue_name, group_id).await?;

        let key = record_key(queue_name, group_id);
        let reason = reason.map(str::to_string);
        let updated: Vec<GroupRecord> = retry_on_conflict(|| async {
            let now = Utc::now();
            let mut result = self
                .db
                .query(
                    r#"
                    UPDATE type::thing("job_group", $key)
                    SET status = $status,
                        paused_reason = $reason,
                        updated_at = $now,
                        updated_ns = $now_ns
                    RETURN AFTER
                    "#,
                )
                .bind(("key", key.clone()))
                .bind(("status", status.as_str()))
                .bind(("reason", reason.clone()))
                .bind(("now", now))
                .bind(("now_ns", nanos(now)))
                .await?;
            Ok::<_, DbError>(result.take(0)?)
        })
        .await?;

        updated
            .into_iter()
            .next()
            .map(GroupRecord::into_group)
            .ok_or_else(|| DbError::NotFound(format!("Group not found: {}", group_id)))
    }

    /// Replace a group's counters, creating the group when absent.
    ///
    /// The update time only moves when a counter actually changed, so an
    /// idle empty group keeps ageing towards cleanup.
    pub async fn save_counts(
        &self,
        queue_name: &str,
        group_id: &GroupId,
        counts: &GroupCounts,
    ) -> Result<Group, DbError> {
        let (mut group, _) = self.upsert(queue_name, group_id).await?;
        if !group.apply_counts(counts) {
            return Ok(group);
        }

        let key = record_key(queue_name, group_id);
        let (total, completed, failed) = (group.total_jobs, group.completed_jobs, group.failed_jobs);
        let updated: Vec<GroupRecord> = retry_on_conflict(|| async {
            let now = Utc::now();
            let mut result = self
                .db
                .query(
                    r#"
                    UPDATE type::thing("job_group", $key)
                    SET total_jobs = $total,
                        completed_jobs = $completed,
                        failed_jobs = $failed,
                        updated_at = $now,
                        updated_ns = $now_ns
                    WHERE total_jobs != $total
                        OR completed_jobs != $completed
                        OR failed_jobs != $failed
                    RETURN AFTER
                    "#,
                )
                .bind(("key", key.clone()))
                .bind(("total", total))
                .bind(("completed", completed))
                .bind(("failed", failed))
                .bind(("now", now))
                .bind(("now_ns", nanos(now)))
                .await?;
            Ok::<_, DbError>(result.take(0)?)
        })
        .await?;

        match updated.into_iter().next() {
            Some(record) => Ok(record.into_group()),
            // Another writer stored the same counters first.
            None => self
                .find(queue_name, group_id)
                .await?
                .ok_or_else(|| DbError::NotFound(format!("Group not found: {}", group_id))),
        }
    }
}
