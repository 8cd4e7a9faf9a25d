#![allow(clippy::disallowed_methods)]

//! QueueManager scenarios on the SurrealDB store (in-memory datastore).

mod common;

use std::error::Error;
use std::sync::Arc;

use chrono::Utc;
use common::{
    ExecutionLog, QUEUE, TIMEOUT, config, job, manager_on, recording_executors, wait_for_status,
};
use db::{DbConfig, SurrealStore, repositories::JobFilter};
use queue_core::{GroupId, Job, JobStatus, Priority};

async fn surreal_store() -> Result<Arc<SurrealStore>, Box<dyn Error>> {
    Ok(Arc::new(SurrealStore::open(&DbConfig::memory()).await?))
}

fn created_ago(mut job: Job, seconds: i64) -> Job {
    job.created_at = Utc::now() - chrono::Duration::seconds(seconds);
    job
}

#[tokio::test]
async fn test_priority_order_on_surreal_store() -> Result<(), Box<dyn Error>> {
    let store = surreal_store().await?;
    let log = ExecutionLog::default();
    let manager = manager_on(
        store.clone(),
        config().with_max_concurrency(1),
        recording_executors(&log),
    )?;

    // Null payloads throughout.
    let a = created_ago(job("A", "record").with_priority(Priority::Urgent), 30);
    let b = created_ago(job("B", "record"), 20);
    let c = created_ago(job("C", "record").with_priority(Priority::Urgent), 10);
    assert!(a.payload.is_null());

    let created = manager.add_tasks(vec![a, b, c]).await?;
    manager.start().await?;

    for job in &created {
        let done = wait_for_status(store.as_ref(), job.id, JobStatus::Completed).await?;
        assert!(done.payload.is_null());
        assert_eq!(done.attempts, 1);
    }
    assert!(manager.wait_for_completion(TIMEOUT).await);
    manager.stop().await?;

    assert_eq!(log.names(), vec!["A", "C", "B"]);
    Ok(())
}

#[tokio::test]
async fn test_pause_and_resume_on_surreal_store() -> Result<(), Box<dyn Error>> {
    let store = surreal_store().await?;
    let log = ExecutionLog::default();
    let manager = manager_on(
        store.clone(),
        config().with_max_concurrency(1),
        recording_executors(&log),
    )?;
    let group = GroupId::from("G");

    let added = manager
        .add_group_tasks(
            "G",
            vec![
                created_ago(job("g-normal", "record"), 30),
                created_ago(job("g-urgent", "record").with_priority(Priority::Urgent), 10),
                created_ago(job("g-low", "record").with_priority(Priority::Low), 40),
            ],
        )
        .await?;
    let loose = manager.add_task(job("ungrouped", "record")).await?;

    let paused = manager.pause_group(&group, "maintenance").await;
    assert!(paused.success);
    assert_eq!(paused.affected_jobs, 3);

    manager.start().await?;
    wait_for_status(store.as_ref(), loose.id, JobStatus::Completed).await?;
    assert!(manager.wait_for_completion(TIMEOUT).await);
    assert_eq!(log.names(), vec!["ungrouped"]);

    let waiting = store
        .jobs()
        .list(JobFilter {
            queue_name: Some(QUEUE.to_string()),
            status: Some(JobStatus::Waiting),
            group_id: Some(group.clone()),
            ..Default::default()
        })
        .await?;
    assert_eq!(waiting.len(), 3);

    let status = manager
        .get_group_status(&group)
        .await?
        .ok_or("group missing")?;
    assert!(status.is_paused());
    assert_eq!(status.total_jobs, 3);

    let resumed = manager.resume_group(&group, "done").await;
    assert!(resumed.success);
    assert_eq!(resumed.affected_jobs, 3);

    for job in &added {
        wait_for_status(store.as_ref(), job.id, JobStatus::Completed).await?;
    }
    assert_eq!(
        log.names(),
        vec!["ungrouped", "g-urgent", "g-normal", "g-low"]
    );

    let status = manager
        .get_group_status(&group)
        .await?
        .ok_or("group missing")?;
    assert!(!status.is_paused());
    assert_eq!(status.completed_jobs, 3);

    manager.stop().await?;
    Ok(())
}
