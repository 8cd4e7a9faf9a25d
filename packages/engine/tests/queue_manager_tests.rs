#![allow(clippy::disallowed_methods)]

mod common;

use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use common::{ExecutionLog, QUEUE, TIMEOUT, config, job, manager, recording_executors, wait_for_status};
use db::MemoryStore;
use engine::{ExecutorRegistry, QueueCheckOutcome};
use queue_core::{
    GroupId, Job, JobId, JobResult, JobStatus, JobStore, Priority, QueueError, QueueEvent, UNGROUPED,
};
use tokio::sync::Notify;

/// Backdate creation so ordering by age is deterministic.
fn created_ago(mut job: Job, seconds: i64) -> Job {
    job.created_at = Utc::now() - chrono::Duration::seconds(seconds);
    job
}

#[tokio::test]
async fn test_priority_order_with_single_slot() -> Result<(), Box<dyn Error>> {
    let store = MemoryStore::new();
    let log = ExecutionLog::default();
    let manager = manager(
        &store,
        config().with_max_concurrency(1),
        recording_executors(&log),
    )?;

    let a = created_ago(job("A", "record").with_priority(Priority::Urgent), 30);
    let b = created_ago(job("B", "record"), 20);
    let c = created_ago(job("C", "record").with_priority(Priority::Urgent), 10);
    let low = created_ago(job("low", "record").with_priority(Priority::Low), 40);
    let high = created_ago(job("high", "record").with_priority(Priority::High), 5);

    // Not started: jobs are persisted but nothing is loaded.
    let created = manager.add_tasks(vec![a, b, c, low, high]).await?;
    assert_eq!(created.len(), 5);
    assert!(matches!(
        manager.trigger_queue_check_if_needed("test").await?,
        QueueCheckOutcome::NotStarted
    ));

    manager.start().await?;
    assert!(manager.wait_for_completion(TIMEOUT).await);
    for job in &created {
        wait_for_status(&store, job.id, JobStatus::Completed).await?;
    }
    manager.stop().await?;

    assert_eq!(log.names(), vec!["A", "C", "high", "B", "low"]);
    Ok(())
}

#[tokio::test]
async fn test_retry_bound() -> Result<(), Box<dyn Error>> {
    let store = MemoryStore::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut executors = ExecutorRegistry::new();
    let counter = calls.clone();
    executors.register_fn("always-fail", move |_job: Job| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<JobResult, String>("still broken".to_string())
        }
    });

    let manager = manager(&store, config(), executors)?;
    manager.start().await?;

    let added = manager
        .add_task(job("flaky", "always-fail").with_max_attempts(3))
        .await?;
    let failed = wait_for_status(&store, added.id, JobStatus::Failed).await?;

    assert_eq!(failed.attempts, 3);
    assert_eq!(failed.error.as_deref(), Some("still broken"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    assert!(manager.wait_for_completion(TIMEOUT).await);
    let stats = manager.get_statistics();
    assert_eq!(stats.execution.total_failed, 1);
    assert_eq!(stats.execution.total_processed, 3);
    assert_eq!(stats.execution.total_successful, 0);

    manager.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_idle_wake_loads_exactly_once() -> Result<(), Box<dyn Error>> {
    let store = MemoryStore::new();
    let log = ExecutionLog::default();
    let manager = manager(&store, config(), recording_executors(&log))?;

    manager.start().await?;
    assert!(manager.wait_for_completion(TIMEOUT).await);
    let baseline = manager.get_statistics().total_batch_loads;

    let added = manager.add_task(job("wake", "record")).await?;
    wait_for_status(&store, added.id, JobStatus::Completed).await?;
    assert!(manager.wait_for_completion(TIMEOUT).await);

    // Give a stray recheck the chance to show up.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.get_statistics().total_batch_loads, baseline + 1);
    assert_eq!(log.names(), vec!["wake"]);

    manager.stop().await?;
    Ok(())
}

/// Registry whose "gate" executor signals `started` and waits for `release`.
fn gated_executors(started: &Arc<Notify>, release: &Arc<Notify>, log: &ExecutionLog) -> ExecutorRegistry {
    let mut executors = recording_executors(log);
    let (started, release) = (started.clone(), release.clone());
    executors.register_fn("gate", move |_job: Job| {
        let (started, release) = (started.clone(), release.clone());
        async move {
            started.notify_one();
            release.notified().await;
            Ok(JobResult::new("released"))
        }
    });
    executors
}

#[tokio::test]
async fn test_no_redundant_load_while_draining() -> Result<(), Box<dyn Error>> {
    let store = MemoryStore::new();
    let log = ExecutionLog::default();
    let (started, release) = (Arc::new(Notify::new()), Arc::new(Notify::new()));
    let manager = manager(&store, config(), gated_executors(&started, &release, &log))?;

    manager.start().await?;
    assert!(manager.wait_for_completion(TIMEOUT).await);
    let baseline = manager.get_statistics().total_batch_loads;

    let gate = manager.add_task(job("gate", "gate")).await?;
    tokio::time::timeout(TIMEOUT, started.notified()).await?;
    assert_eq!(manager.get_statistics().total_batch_loads, baseline + 1);

    let mut followers = Vec::new();
    for i in 0..5 {
        followers.push(manager.add_task(job(&format!("follower-{i}"), "record")).await?);
    }
    assert!(matches!(
        manager.trigger_queue_check_if_needed("test").await?,
        QueueCheckOutcome::Draining
    ));
    assert_eq!(manager.get_statistics().total_batch_loads, baseline + 1);
    assert_eq!(store.count_by_status(QUEUE, JobStatus::Waiting).await, 5);

    release.notify_one();
    wait_for_status(&store, gate.id, JobStatus::Completed).await?;
    for follower in &followers {
        wait_for_status(&store, follower.id, JobStatus::Completed).await?;
    }
    assert!(manager.wait_for_completion(TIMEOUT).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // One load for the gate, one after it drained for all followers.
    assert_eq!(manager.get_statistics().total_batch_loads, baseline + 2);
    assert_eq!(log.names().len(), 5);

    manager.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_pause_excludes_and_resume_restores_order() -> Result<(), Box<dyn Error>> {
    let store = MemoryStore::new();
    let log = ExecutionLog::default();
    let manager = manager(
        &store,
        config().with_max_concurrency(1),
        recording_executors(&log),
    )?;
    let group = GroupId::from("G");

    let jobs = vec![
        created_ago(job("g-normal-old", "record"), 50),
        created_ago(job("g-low", "record").with_priority(Priority::Low), 60),
        created_ago(job("g-urgent", "record").with_priority(Priority::Urgent), 10),
        created_ago(job("g-normal-new", "record"), 20),
        created_ago(job("g-high", "record").with_priority(Priority::High), 5),
    ];
    let added = manager.add_group_tasks("G", jobs).await?;
    assert!(added.iter().all(|j| j.group_id.as_ref() == Some(&group)));

    let paused = manager.pause_group(&group, "maintenance").await;
    assert!(paused.success);
    assert_eq!(paused.affected_jobs, 5);

    manager.start().await?;
    assert!(manager.wait_for_completion(TIMEOUT).await);
    assert!(log.names().is_empty());
    assert_eq!(store.count_by_status(QUEUE, JobStatus::Waiting).await, 5);

    let mut events = manager.subscribe();
    let resumed = manager.resume_group(&group, "done").await;
    assert!(resumed.success);
    assert_eq!(resumed.affected_jobs, 5);

    for job in &added {
        wait_for_status(&store, job.id, JobStatus::Completed).await?;
    }
    assert_eq!(
        log.names(),
        vec!["g-urgent", "g-high", "g-normal-old", "g-normal-new", "g-low"]
    );

    // The resume notification precedes the load it caused.
    let mut names = Vec::new();
    while let Ok(event) = events.try_recv() {
        names.push(event.name());
    }
    let resumed_at = names.iter().position(|n| *n == "group:resumed");
    let loaded_at = names.iter().position(|n| *n == "stream:batch-loaded");
    assert!(resumed_at.is_some() && resumed_at < loaded_at);

    let status = manager
        .get_group_status(&group)
        .await?
        .ok_or("group missing")?;
    assert_eq!(status.total_jobs, 5);
    assert_eq!(status.completed_jobs, 5);
    assert!(!status.is_paused());

    manager.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_watermark_is_respected_while_refilling() -> Result<(), Box<dyn Error>> {
    let store = MemoryStore::new();
    let log = ExecutionLog::default();
    let mut executors = recording_executors(&log);
    executors.register_fn("slow", |_job: Job| async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(JobResult::new("slow"))
    });
    let manager = manager(
        &store,
        config().with_watermark(3).with_batch_size(2).with_max_concurrency(2),
        executors,
    )?;

    let jobs: Vec<Job> = (0..10).map(|i| job(&format!("job-{i}"), "slow")).collect();
    let added = manager.add_tasks(jobs).await?;
    let mut events = manager.subscribe();
    manager.start().await?;

    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        let stats = manager.get_statistics();
        assert!(stats.memory_queue_length <= 3);
        if store.count_by_status(QUEUE, JobStatus::Completed).await == added.len() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "jobs did not complete");
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let mut loaded = 0;
    while let Ok(event) = events.try_recv() {
        if let QueueEvent::StreamBatchLoaded { batch } = event {
            assert!(batch.total_jobs <= 3);
            loaded += batch.total_jobs;
        }
    }
    assert_eq!(loaded, 10);

    manager.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_failed_tasks_can_be_retried() -> Result<(), Box<dyn Error>> {
    let store = MemoryStore::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut executors = ExecutorRegistry::new();
    let counter = calls.clone();
    executors.register_fn("second-time-lucky", move |_job: Job| {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err("first attempt fails".to_string())
            } else {
                Ok(JobResult::new("recovered"))
            }
        }
    });

    let manager = manager(&store, config(), executors)?;
    manager.start().await?;

    let lucky = manager
        .add_task(job("lucky", "second-time-lucky").with_max_attempts(1).with_group("batch"))
        .await?;
    let unknown = manager.add_task(job("orphan", "missing-executor")).await?;
    wait_for_status(&store, lucky.id, JobStatus::Failed).await?;
    let orphan = wait_for_status(&store, unknown.id, JobStatus::Failed).await?;
    assert_eq!(orphan.error.as_deref(), Some("unknown executor: missing-executor"));
    assert!(manager.wait_for_completion(TIMEOUT).await);

    let failed = manager.get_failed_tasks(10, 0).await?;
    assert_eq!(failed.len(), 2);

    let stats = manager.get_failed_tasks_stats().await?;
    assert_eq!(stats.total, 2);
    assert_eq!(stats.by_executor.get("second-time-lucky"), Some(&1));
    assert_eq!(stats.by_group.get("batch"), Some(&1));
    assert_eq!(stats.by_group.get(UNGROUPED), Some(&1));

    let missing = JobId::new();
    let results = manager.retry_failed_tasks(&[lucky.id, missing]).await;
    assert_eq!(results.len(), 2);
    assert!(results[0].success);
    assert!(!results[1].success);
    assert!(results[1].error.is_some());

    let completed = wait_for_status(&store, lucky.id, JobStatus::Completed).await?;
    assert_eq!(completed.attempts, 1);
    assert!(completed.error.is_none());

    // Retrying a job that is not failed is reported, not raised.
    let again = manager.retry_failed_task(lucky.id).await;
    assert!(!again.success);

    manager.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_stop_waits_for_in_flight_jobs() -> Result<(), Box<dyn Error>> {
    let store = MemoryStore::new();
    let log = ExecutionLog::default();
    let (started, release) = (Arc::new(Notify::new()), Arc::new(Notify::new()));
    let manager = manager(&store, config(), gated_executors(&started, &release, &log))?;

    manager.start().await?;
    let gate = manager.add_task(job("gate", "gate")).await?;
    tokio::time::timeout(TIMEOUT, started.notified()).await?;

    let stopping = tokio::spawn({
        let manager = manager.clone();
        async move { manager.stop().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!stopping.is_finished());

    release.notify_one();
    tokio::time::timeout(TIMEOUT, stopping).await???;

    let job = store.find_by_id(gate.id).await?.ok_or("job missing")?;
    assert_eq!(job.status, JobStatus::Completed);
    assert!(!manager.is_started());
    assert!(matches!(
        manager.trigger_queue_check_if_needed("after-stop").await?,
        QueueCheckOutcome::NotStarted
    ));
    Ok(())
}

#[tokio::test]
async fn test_rejects_jobs_for_other_queues() -> Result<(), Box<dyn Error>> {
    let store = MemoryStore::new();
    let manager = manager(&store, config(), ExecutorRegistry::new())?;

    let result = manager
        .add_task(Job::new("elsewhere", "stray", "record", serde_json::Value::Null))
        .await;
    assert!(matches!(result, Err(QueueError::InvalidJob(_))));
    assert_eq!(store.count_by_status("elsewhere", JobStatus::Waiting).await, 0);

    let invalid = engine::QueueManager::new(
        config().with_watermark(0),
        Arc::new(store.clone()),
        ExecutorRegistry::new(),
    );
    assert!(matches!(invalid, Err(QueueError::Config(_))));
    Ok(())
}

#[tokio::test]
async fn test_storage_outage_is_recovered_by_polling() -> Result<(), Box<dyn Error>> {
    let store = MemoryStore::new();
    let log = ExecutionLog::default();
    let manager = manager(
        &store,
        config().with_poll_interval(Duration::from_millis(20)),
        recording_executors(&log),
    )?;
    manager.start().await?;

    // Stored behind the manager's back, so only polling can find it.
    let job = store.create(&job("survivor", "record")).await?;

    store.set_unavailable(true);
    let outcome = manager.trigger_queue_check_if_needed("outage").await;
    assert!(matches!(outcome, Err(QueueError::Storage(_))));

    store.set_unavailable(false);
    wait_for_status(&store, job.id, JobStatus::Completed).await?;
    assert_eq!(log.names(), vec!["survivor"]);

    manager.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_unrecorded_outcome_is_reclaimed_and_rerun() -> Result<(), Box<dyn Error>> {
    let store = MemoryStore::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let outage_started = Arc::new(Notify::new());

    let mut executors = ExecutorRegistry::new();
    let (counter, flaky, signal) = (calls.clone(), store.clone(), outage_started.clone());
    executors.register_fn("outage", move |_job: Job| {
        let (counter, flaky, signal) = (counter.clone(), flaky.clone(), signal.clone());
        async move {
            // The first run succeeds, but the store goes away before the
            // outcome can be written.
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                flaky.set_unavailable(true);
                signal.notify_one();
            }
            Ok(JobResult::new("done"))
        }
    });

    let manager = manager(
        &store,
        config()
            .with_poll_interval(Duration::from_millis(20))
            .with_stale_job_timeout(Duration::ZERO),
        executors,
    )?;
    manager.start().await?;

    let added = manager.add_task(job("lost-outcome", "outage")).await?;
    outage_started.notified().await;

    // Outlast every settlement retry so the job is left running.
    tokio::time::sleep(Duration::from_millis(300)).await;
    store.set_unavailable(false);

    let done = wait_for_status(&store, added.id, JobStatus::Completed).await?;
    assert_eq!(done.attempts, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(store.count_by_status(QUEUE, JobStatus::Running).await, 0);

    manager.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_jobs_running_elsewhere_are_left_alone_until_stale() -> Result<(), Box<dyn Error>> {
    let store = MemoryStore::new();
    let log = ExecutionLog::default();

    // Another process started this one a moment ago.
    let busy = store.create(&job("busy-elsewhere", "record")).await?;
    store.mark_running(busy.id, Utc::now()).await?;

    let manager = manager(
        &store,
        config().with_stale_job_timeout(Duration::from_secs(3600)),
        recording_executors(&log),
    )?;
    manager.start().await?;

    assert_eq!(manager.reclaim_stale_jobs().await?, 0);
    assert!(manager.wait_for_completion(TIMEOUT).await);
    assert!(log.names().is_empty());
    let still = store.find_by_id(busy.id).await?.map(|j| j.status);
    assert_eq!(still, Some(JobStatus::Running));

    manager.stop().await?;
    Ok(())
}
