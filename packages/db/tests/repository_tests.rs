#![allow(clippy::disallowed_methods)]

mod common;

use chrono::{Duration, Utc};
use queue_core::{
    EligibleQuery, GroupId, GroupStore, Job, JobResult, JobStatus, JobStore, Priority, StoreError,
};
use serde_json::{Map, Value};
use std::error::Error;

use db::{DbError, repositories::JobFilter};

fn payload_with_message(message: &str) -> Value {
    let mut map = Map::new();
    map.insert("msg".to_string(), Value::String(message.to_string()));
    Value::Object(map)
}

/// Backdate creation so ordering by age is deterministic.
fn created_ago(mut job: Job, seconds: i64) -> Job {
    job.created_at = Utc::now() - Duration::seconds(seconds);
    job
}

fn eligible(queue_name: &str, excluded: Vec<GroupId>) -> EligibleQuery {
    EligibleQuery {
        queue_name: queue_name.to_string(),
        now: Utc::now(),
        excluded_groups: excluded,
        limit: 100,
        offset: 0,
    }
}

#[tokio::test]
async fn test_job_repository() -> Result<(), Box<dyn Error>> {
    let store = common::setup_store().await?;
    let jobs = store.jobs();

    // create/get/update/delete
    let job = Job::new("alpha", "greet", "echo", payload_with_message("hi"));
    let created = jobs.create(&job).await?;
    assert_eq!(created.executor, "echo");
    assert_eq!(created.status, JobStatus::Waiting);

    let loaded = jobs.get(job.id).await?;
    assert_eq!(loaded.id, job.id);
    assert_eq!(loaded.payload, payload_with_message("hi"));

    let mut changed = loaded.clone();
    changed.priority = Priority::High;
    let updated = jobs.update(&changed).await?;
    assert_eq!(updated.priority, Priority::High);
    assert!(updated.updated_at >= loaded.updated_at);

    jobs.delete(job.id).await?;
    let missing = jobs.get(job.id).await;
    assert!(matches!(missing, Err(DbError::NotFound(_))));
    assert!(jobs.find(job.id).await?.is_none());

    // lifecycle transitions
    let job = jobs
        .create(&Job::new("alpha", "work", "echo", payload_with_message("w")))
        .await?;

    let running = jobs.mark_running(job.id, Utc::now()).await?;
    assert_eq!(running.status, JobStatus::Running);
    assert_eq!(running.attempts, 1);
    assert!(running.started_at.is_some());

    let requeued = jobs
        .requeue(job.id, Utc::now() + Duration::seconds(30), "flaky")
        .await?;
    assert_eq!(requeued.status, JobStatus::Waiting);
    assert_eq!(requeued.attempts, 1);
    assert_eq!(requeued.error.as_deref(), Some("flaky"));

    jobs.mark_running(job.id, Utc::now()).await?;
    let completed = jobs
        .mark_completed(job.id, Some(JobResult::new("done")))
        .await?;
    assert_eq!(completed.status, JobStatus::Completed);
    assert_eq!(completed.attempts, 2);
    assert!(completed.error.is_none());
    assert!(completed.completed_at.is_some());

    // list filters
    let failed = jobs
        .create(&Job::new("alpha", "broken", "fail", payload_with_message("f")))
        .await?;
    jobs.mark_running(failed.id, Utc::now()).await?;
    jobs.mark_failed(failed.id, "boom").await?;

    let filter = JobFilter {
        queue_name: Some("alpha".to_string()),
        status: Some(JobStatus::Failed),
        ..Default::default()
    };
    let listed = jobs.list(filter).await?;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].error.as_deref(), Some("boom"));

    let by_executor = jobs
        .list(JobFilter {
            executor: Some("echo".to_string()),
            ..Default::default()
        })
        .await?;
    assert_eq!(by_executor.len(), 1);

    Ok(())
}

#[tokio::test]
async fn test_eligible_query_ordering_and_filters() -> Result<(), Box<dyn Error>> {
    let store = common::setup_store().await?;

    let normal_a = created_ago(Job::new("q", "normal-a", "echo", Value::Null), 60);
    let urgent = created_ago(
        Job::new("q", "urgent", "echo", Value::Null).with_priority(Priority::Urgent),
        10,
    );
    let normal_b = created_ago(Job::new("q", "normal-b", "echo", Value::Null), 50);
    let low = created_ago(
        Job::new("q", "low", "echo", Value::Null).with_priority(Priority::Low),
        90,
    );
    let delayed = Job::new("q", "delayed", "echo", Value::Null).with_delay(Duration::hours(1));
    let paused = created_ago(
        Job::new("q", "paused", "echo", Value::Null).with_group("g-paused"),
        70,
    );
    let grouped = created_ago(
        Job::new("q", "grouped", "echo", Value::Null).with_group("g-active"),
        40,
    );
    let other = Job::new("other", "other", "echo", Value::Null);

    store
        .create_batch(&[
            normal_a, urgent, normal_b, low, delayed, paused, grouped, other,
        ])
        .await?;

    let loaded = store
        .query_eligible(&eligible("q", vec![GroupId::from("g-paused")]))
        .await?;
    let names: Vec<&str> = loaded.iter().map(|j| j.name.as_str()).collect();
    assert_eq!(names, vec!["urgent", "normal-a", "normal-b", "grouped", "low"]);

    let mut page = eligible("q", Vec::new());
    page.limit = 2;
    page.offset = 2;
    let second_page = store.query_eligible(&page).await?;
    assert_eq!(second_page.len(), 2);
    assert_eq!(second_page[0].name, "normal-b");

    Ok(())
}

#[tokio::test]
async fn test_retry_failed_job() -> Result<(), Box<dyn Error>> {
    let store = common::setup_store().await?;

    let job = store
        .create(&Job::new("q", "j", "fail", Value::Null).with_max_attempts(1))
        .await?;

    let not_failed = store.retry_failed_job(job.id).await;
    assert!(matches!(not_failed, Err(StoreError::InvalidState(_))));

    store.mark_running(job.id, Utc::now()).await?;
    store.mark_failed(job.id, "boom").await?;

    let failed = store.get_failed_jobs("q", 10, 0).await?;
    assert_eq!(failed.len(), 1);

    let retried = store.retry_failed_job(job.id).await?;
    assert_eq!(retried.status, JobStatus::Waiting);
    assert_eq!(retried.attempts, 0);
    assert!(retried.error.is_none());

    assert!(store.get_failed_jobs("q", 10, 0).await?.is_empty());
    assert_eq!(store.query_eligible(&eligible("q", Vec::new())).await?.len(), 1);

    Ok(())
}

#[tokio::test]
async fn test_group_repository() -> Result<(), Box<dyn Error>> {
    let store = common::setup_store().await?;
    let group_id = GroupId::from("batch-7");

    let (group, created) = store.upsert_group("q", &group_id).await?;
    assert!(created);
    assert!(!group.is_paused());

    let (_, created_again) = store.upsert_group("q", &group_id).await?;
    assert!(!created_again);

    // Same id in another queue is a different group
    store.upsert_group("other", &group_id).await?;
    assert_eq!(store.count_groups("q").await?, 1);
    assert_eq!(store.find_groups_by_queue(None).await?.len(), 2);

    for i in 0..3 {
        store
            .create(&Job::new("q", format!("job-{i}"), "echo", Value::Null).with_group("batch-7"))
            .await?;
    }

    let affected = store.pause_group("q", &group_id, "maintenance").await?;
    assert_eq!(affected, 3);
    assert_eq!(store.paused_group_ids("q").await?, vec![group_id.clone()]);

    let paused = store
        .find_group("q", &group_id)
        .await?
        .ok_or("group missing")?;
    assert_eq!(paused.paused_reason.as_deref(), Some("maintenance"));

    let resumed = store.resume_group("q", &group_id).await?;
    assert_eq!(resumed, 3);
    assert!(store.paused_group_ids("q").await?.is_empty());

    let counts = store.count_group_jobs("q", &group_id).await?;
    assert_eq!(counts.total, 3);
    assert_eq!(counts.waiting, 3);

    let saved = store.save_group_statistics("q", &group_id, &counts).await?;
    assert_eq!(saved.total_jobs, 3);
    assert_eq!(saved.completed_jobs, 0);

    Ok(())
}

#[tokio::test]
async fn test_cleanup_empty_groups() -> Result<(), Box<dyn Error>> {
    let store = common::setup_store().await?;

    store.upsert_group("q", &GroupId::from("empty")).await?;
    store.upsert_group("q", &GroupId::from("busy")).await?;
    store
        .create(&Job::new("q", "j", "echo", Value::Null).with_group("busy"))
        .await?;

    // Nothing is old enough yet
    let removed = store
        .cleanup_empty_groups(Some("q"), Utc::now() - Duration::hours(1))
        .await?;
    assert_eq!(removed, 0);

    let removed = store
        .cleanup_empty_groups(Some("q"), Utc::now() + Duration::seconds(1))
        .await?;
    assert_eq!(removed, 1);

    let remaining = store.find_groups_by_queue(Some("q")).await?;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, GroupId::from("busy"));

    Ok(())
}

#[tokio::test]
async fn test_null_payload_round_trips() -> Result<(), Box<dyn Error>> {
    let store = common::setup_store().await?;

    let bare = Job::new("nulls", "bare", "echo", Value::Null);
    let mut nested = Map::new();
    nested.insert("note".to_string(), Value::Null);
    let with_nested = Job::new("nulls", "nested", "echo", Value::Object(nested.clone()))
        .with_metadata(Value::Null);

    let created = store.create(&bare).await?;
    assert_eq!(created.payload, Value::Null);

    let found = store.find_by_id(bare.id).await?.ok_or("job missing")?;
    assert_eq!(found.payload, Value::Null);
    assert_eq!(found, created);

    store.create(&with_nested).await?;
    let loaded = store.query_eligible(&eligible("nulls", Vec::new())).await?;
    assert_eq!(loaded.len(), 2);
    assert!(loaded.iter().any(|j| j.payload.is_null()));
    assert!(loaded.iter().any(|j| j.payload == Value::Object(nested.clone())));

    let running = store.mark_running(bare.id, Utc::now()).await?;
    assert_eq!(running.payload, Value::Null);

    Ok(())
}

#[tokio::test]
async fn test_transitions_are_conditional() -> Result<(), Box<dyn Error>> {
    let store = common::setup_store().await?;

    let job = store.create(&Job::new("q", "once", "echo", Value::Null)).await?;

    let early = store.mark_completed(job.id, None).await;
    assert!(matches!(early, Err(StoreError::InvalidState(_))));

    store.mark_running(job.id, Utc::now()).await?;
    let twice = store.mark_running(job.id, Utc::now()).await;
    assert!(matches!(twice, Err(StoreError::InvalidState(_))));

    store.mark_completed(job.id, Some(JobResult::new("done"))).await?;
    let restarted = store.mark_running(job.id, Utc::now()).await;
    assert!(matches!(restarted, Err(StoreError::InvalidState(_))));

    let stored = store.find_by_id(job.id).await?.ok_or("job missing")?;
    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(stored.attempts, 1);

    Ok(())
}

#[tokio::test]
async fn test_reclaim_stale_running_jobs() -> Result<(), Box<dyn Error>> {
    let store = common::setup_store().await?;

    let job = store
        .create(&Job::new("q", "orphan", "echo", Value::Null).with_max_attempts(2))
        .await?;
    let started = Utc::now() - Duration::minutes(10);
    store.mark_running(job.id, started).await?;

    let stale = store.find_stale_running("q", Utc::now(), 10).await?;
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].id, job.id);
    assert!(
        store
            .find_stale_running("q", started - Duration::minutes(1), 10)
            .await?
            .is_empty()
    );

    let wrong_attempt = store.reclaim_running(job.id, 2, "runner lost").await;
    assert!(matches!(wrong_attempt, Err(StoreError::InvalidState(_))));

    let reclaimed = store.reclaim_running(job.id, 1, "runner lost").await?;
    assert_eq!(reclaimed.status, JobStatus::Waiting);
    assert_eq!(reclaimed.error.as_deref(), Some("runner lost"));
    assert_eq!(store.query_eligible(&eligible("q", Vec::new())).await?.len(), 1);

    // Second attempt is the last one, so a lost runner fails the job.
    store.mark_running(job.id, started).await?;
    let failed = store.reclaim_running(job.id, 2, "runner lost").await?;
    assert_eq!(failed.status, JobStatus::Failed);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pause_survives_concurrent_statistics_sync() -> Result<(), Box<dyn Error>> {
    let store = common::setup_store().await?;
    let group_id = GroupId::from("contended");

    for i in 0..4 {
        store
            .create(&Job::new("q", format!("job-{i}"), "echo", Value::Null).with_group("contended"))
            .await?;
    }

    for round in 0..20u64 {
        let counts = queue_core::GroupCounts {
            total: 4 + round,
            waiting: 4 + round,
            ..Default::default()
        };

        let syncing = {
            let store = store.clone();
            let group_id = group_id.clone();
            tokio::spawn(async move {
                store.save_group_statistics("q", &group_id, &counts).await
            })
        };
        let pausing = {
            let store = store.clone();
            let group_id = group_id.clone();
            tokio::spawn(async move { store.pause_group("q", &group_id, "hold").await })
        };

        syncing.await??;
        pausing.await??;

        let group = store
            .find_group("q", &group_id)
            .await?
            .ok_or("group missing")?;
        assert!(group.is_paused(), "pause lost in round {round}");
        assert_eq!(group.paused_reason.as_deref(), Some("hold"));
        assert_eq!(group.total_jobs, 4 + round);

        store.resume_group("q", &group_id).await?;
    }

    Ok(())
}
