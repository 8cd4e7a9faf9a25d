//! Queue worker process.
//!
//! Consumes one queue from SurrealDB until interrupted. Configuration comes
//! from `QUEUE_*` variables (see `QueueConfig::from_env`) and `DB_*` variables
//! (see `DbConfig::from_lookup`).

use std::sync::Arc;
use std::time::Duration;

use db::{DbConfig, SurrealStore};
use engine::{ExecutorRegistry, QueueManager};
use queue_core::{Job, JobResult, QueueConfig, QueueEvent};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

/// Executors available to jobs of this worker.
fn demo_executors() -> ExecutorRegistry {
    let mut executors = ExecutorRegistry::new();

    // Echo executor
    executors.register_fn("echo", |job: Job| async move {
        tracing::info!("Echo job {}: {}", job.id, job.payload);
        Ok(JobResult::with_output("Echo completed", job.payload))
    });

    // Sleep executor
    executors.register_fn("sleep", |job: Job| async move {
        let seconds = job
            .payload
            .get("seconds")
            .and_then(|v| v.as_u64())
            .unwrap_or(5);
        tracing::info!("Sleeping for {} seconds", seconds);
        tokio::time::sleep(Duration::from_secs(seconds)).await;
        Ok(JobResult::new(format!("Slept for {} seconds", seconds)))
    });

    // Failing executor (for exercising retries)
    executors.register_fn("fail", |job: Job| async move {
        let should_fail = job
            .payload
            .get("fail")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        if should_fail {
            Err("Intentional failure".to_string())
        } else {
            Ok(JobResult::new("Success"))
        }
    });

    executors
}

/// Log queue events until the manager goes away. Returns how many were logged.
async fn log_events(mut events: broadcast::Receiver<QueueEvent>) -> usize {
    let mut logged = 0;
    loop {
        match events.recv().await {
            Ok(event) => {
                tracing::debug!("{}", event.description());
                logged += 1;
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!("Event log fell behind, skipped {} events", missed);
            }
            Err(broadcast::error::RecvError::Closed) => return logged,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = QueueConfig::from_env()?;
    let db_config = DbConfig::from_lookup(|key| std::env::var(key).ok());
    tracing::info!(
        "Starting worker for queue {} on {}",
        config.queue_name,
        db_config.endpoint
    );

    let store = Arc::new(SurrealStore::open(&db_config).await?);
    let manager = QueueManager::new(config.clone(), store, demo_executors())?;

    tokio::spawn(log_events(manager.subscribe()));

    manager.start().await?;

    // Seed demo jobs when asked to, like a fresh local setup would.
    let demo_jobs: usize = std::env::var("WORKER_DEMO_JOBS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if demo_jobs > 0 {
        let jobs = (0..demo_jobs)
            .map(|i| {
                Job::new(
                    config.queue_name.as_str(),
                    format!("demo-{i}"),
                    "echo",
                    serde_json::json!({ "index": i }),
                )
            })
            .collect();
        let created = manager.add_tasks(jobs).await?;
        tracing::info!("Seeded {} demo jobs", created.len());
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    manager.stop().await?;
    let stats = manager.get_statistics();
    tracing::info!(
        "Worker stopped: {} processed, {} successful, {} failed",
        stats.execution.total_processed,
        stats.execution.total_successful,
        stats.execution.total_failed
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(queue_name: &str) -> QueueEvent {
        QueueEvent::ProcessingStarted {
            queue_name: queue_name.to_string(),
            timestamp: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn event_log_keeps_going_after_falling_behind() {
        let (sender, receiver) = broadcast::channel(2);
        for i in 0..5 {
            let _ = sender.send(started(&format!("q{i}")));
        }
        drop(sender);

        // The three oldest events are lost; the two newest are still logged.
        assert_eq!(log_events(receiver).await, 2);
    }
}
