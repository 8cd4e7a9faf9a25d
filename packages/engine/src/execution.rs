//! Job execution service: drains the memory queue through the executors.
//!
//! The processing loop runs inside an [`ExecutionActor`]. Each
//! `StartProcessingLoop` message runs the loop to completion: jobs are
//! dequeued up to `max_concurrency` at a time, marked running, executed and
//! settled in the store. The loop ends once the memory queue is empty and
//! nothing is in flight, or when a stop was requested.
//!
//! Settlement writes are retried while the store reports transient errors.
//! A job whose settlement still cannot be written stays `running`; the
//! service tracks which jobs it owns so [`JobExecutionService::reclaim_orphaned`]
//! can hand such jobs back without touching work still in flight here.

use std::collections::HashSet;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::FutureExt;
use futures_util::stream::{FuturesUnordered, StreamExt};
use queue_core::{
    BackoffPolicy, ExecutionStatistics, Job, JobId, JobStatus, QueueError, QueueEvent,
    QueueStore, StoreResult,
};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use ulid::Ulid;

use crate::events::EventBus;
use crate::executor::ExecutorRegistry;
use crate::memory_queue::MemoryQueue;
use crate::messages::ExecutionMessage;

/// Attempts made for one settlement write.
const SETTLE_ATTEMPTS: u32 = 3;
/// Delay before the second settlement attempt; doubles per attempt.
const SETTLE_BACKOFF: Duration = Duration::from_millis(25);
/// Stale running jobs inspected per reclaim pass.
const RECLAIM_BATCH: usize = 100;

/// Shared counters read by statistics snapshots.
#[derive(Default)]
struct Counters {
    active: AtomicU64,
    processed: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    looping: AtomicBool,
    /// A loop request is queued in the actor mailbox.
    loop_requested: AtomicBool,
    stopping: AtomicBool,
}

/// How a dispatched job settled.
enum Settlement {
    Completed,
    Retrying,
    Failed,
    /// The store refused the start of the job, or its outcome could not be
    /// written. In the latter case the job stays `running` until reclaimed.
    Abandoned,
}

/// Everything the processing loop needs. Cheap to clone.
pub(crate) struct ExecutionContext<S> {
    store: Arc<S>,
    memory: Arc<MemoryQueue>,
    executors: Arc<ExecutorRegistry>,
    events: EventBus,
    queue_name: String,
    max_concurrency: usize,
    backoff: BackoffPolicy,
    counters: Arc<Counters>,
    /// Jobs dispatched by this service and not yet settled.
    owned: Arc<Mutex<HashSet<JobId>>>,
}

impl<S> Clone for ExecutionContext<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            memory: self.memory.clone(),
            executors: self.executors.clone(),
            events: self.events.clone(),
            queue_name: self.queue_name.clone(),
            max_concurrency: self.max_concurrency,
            backoff: self.backoff.clone(),
            counters: self.counters.clone(),
            owned: self.owned.clone(),
        }
    }
}

impl<S: QueueStore> ExecutionContext<S> {
    /// Drain the memory queue. Returns the number of jobs settled.
    async fn run_processing_loop(&self) -> u64 {
        if self.memory.is_empty() || self.counters.stopping.load(Ordering::SeqCst) {
            return 0;
        }

        self.counters.looping.store(true, Ordering::SeqCst);
        tracing::debug!("Processing loop started for queue {}", self.queue_name);
        self.events.publish(QueueEvent::ProcessingStarted {
            queue_name: self.queue_name.clone(),
            timestamp: Utc::now(),
        });

        let mut in_flight = FuturesUnordered::new();
        let mut processed = 0u64;

        loop {
            while !self.counters.stopping.load(Ordering::SeqCst)
                && in_flight.len() < self.max_concurrency
            {
                let Some(job) = self.memory.dequeue() else {
                    break;
                };
                self.counters.active.fetch_add(1, Ordering::SeqCst);
                in_flight.push(self.process_job(job));
            }

            match in_flight.next().await {
                Some(Settlement::Abandoned) => {}
                Some(_) => processed += 1,
                None => break,
            }
        }

        self.counters.looping.store(false, Ordering::SeqCst);
        tracing::debug!(
            "Processing loop for queue {} drained after {} jobs",
            self.queue_name,
            processed
        );
        self.events.publish(QueueEvent::ProcessingDrained {
            queue_name: self.queue_name.clone(),
            processed,
            timestamp: Utc::now(),
        });

        processed
    }

    async fn process_job(&self, job: Job) -> Settlement {
        let job_id = job.id;
        self.owned.lock().await.insert(job_id);
        let settlement = self.settle(job).await;
        self.owned.lock().await.remove(&job_id);

        match settlement {
            Settlement::Completed => {
                self.counters.processed.fetch_add(1, Ordering::SeqCst);
                self.counters.successful.fetch_add(1, Ordering::SeqCst);
            }
            Settlement::Failed => {
                self.counters.processed.fetch_add(1, Ordering::SeqCst);
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
            }
            Settlement::Retrying => {
                self.counters.processed.fetch_add(1, Ordering::SeqCst);
            }
            Settlement::Abandoned => {}
        }
        self.counters.active.fetch_sub(1, Ordering::SeqCst);

        settlement
    }

    async fn settle(&self, job: Job) -> Settlement {
        let job_id = job.id;
        let job = match self.store.mark_running(job_id, Utc::now()).await {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(
                    "Failed to mark job {} running in queue {}: {}",
                    job_id,
                    self.queue_name,
                    e
                );
                return Settlement::Abandoned;
            }
        };

        let executor = match self.executors.resolve(&job.executor) {
            Ok(executor) => executor,
            Err(e) => return self.fail(&job, &e.to_string()).await,
        };

        let started = Instant::now();
        let outcome = AssertUnwindSafe(async { executor.execute(&job).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(result)) => {
                let completed = self
                    .write_settlement(job_id, "completed", || {
                        self.store.mark_completed(job_id, Some(result.clone()))
                    })
                    .await;
                if completed.is_none() {
                    return Settlement::Abandoned;
                }
                let duration_ms = started.elapsed().as_millis() as u64;
                tracing::debug!("Job {} completed in {}ms", job_id, duration_ms);
                self.events.publish(QueueEvent::JobCompleted {
                    job_id,
                    queue_name: self.queue_name.clone(),
                    duration_ms,
                    timestamp: Utc::now(),
                });
                Settlement::Completed
            }
            Ok(Err(error)) => self.retry_or_fail(&job, &error).await,
            Err(_) => self.retry_or_fail(&job, "executor panicked").await,
        }
    }

    async fn retry_or_fail(&self, job: &Job, error: &str) -> Settlement {
        if !job.has_attempts_left() {
            return self.fail(job, error).await;
        }

        let delay = self.backoff.delay_for_attempt(job.attempts);
        let eligible_at = Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);

        let requeued = self
            .write_settlement(job.id, "requeued", || {
                self.store.requeue(job.id, eligible_at, error)
            })
            .await;
        if requeued.is_none() {
            return Settlement::Abandoned;
        }

        tracing::info!(
            "Job {} failed (attempt {}/{}), retrying in {:?}: {}",
            job.id,
            job.attempts,
            job.max_attempts,
            delay,
            error
        );
        self.events.publish(QueueEvent::JobRetrying {
            job_id: job.id,
            queue_name: self.queue_name.clone(),
            error: error.to_string(),
            attempt: job.attempts,
            eligible_at,
            timestamp: Utc::now(),
        });
        Settlement::Retrying
    }

    async fn fail(&self, job: &Job, error: &str) -> Settlement {
        let failed = self
            .write_settlement(job.id, "failed", || self.store.mark_failed(job.id, error))
            .await;
        if failed.is_none() {
            return Settlement::Abandoned;
        }

        tracing::warn!(
            "Job {} failed after {} attempts: {}",
            job.id,
            job.attempts,
            error
        );
        self.events.publish(QueueEvent::JobFailed {
            job_id: job.id,
            queue_name: self.queue_name.clone(),
            error: error.to_string(),
            attempts: job.attempts,
            timestamp: Utc::now(),
        });
        Settlement::Failed
    }

    /// Write the outcome of a job, retrying transient store errors.
    async fn write_settlement<F, Fut>(&self, job_id: JobId, outcome: &str, write: F) -> Option<Job>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = StoreResult<Job>>,
    {
        let mut attempt = 1;
        loop {
            match write().await {
                Ok(job) => return Some(job),
                Err(e) if e.is_transient() && attempt < SETTLE_ATTEMPTS => {
                    tracing::debug!(
                        "Retrying settlement of job {} as {} in queue {}: {}",
                        job_id,
                        outcome,
                        self.queue_name,
                        e
                    );
                    tokio::time::sleep(SETTLE_BACKOFF * 2u32.pow(attempt - 1)).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to record job {} as {} in queue {}: {}",
                        job_id,
                        outcome,
                        self.queue_name,
                        e
                    );
                    return None;
                }
            }
        }
    }
}

/// Actor hosting the processing loop.
pub(crate) struct ExecutionActor<S>(PhantomData<fn() -> S>);

impl<S> ExecutionActor<S> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<S> Default for ExecutionActor<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: QueueStore> Actor for ExecutionActor<S> {
    type Msg = ExecutionMessage;
    type State = ExecutionContext<S>;
    type Arguments = ExecutionContext<S>;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting execution actor for queue {}", args.queue_name);
        Ok(args)
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            ExecutionMessage::StartProcessingLoop => {
                state.counters.loop_requested.store(false, Ordering::SeqCst);
                state.run_processing_loop().await;
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        tracing::info!("Execution actor for queue {} stopped", state.queue_name);
        Ok(())
    }
}

/// Runs jobs from the memory queue and records their outcome in the store.
pub struct JobExecutionService<S> {
    context: ExecutionContext<S>,
    actor: Mutex<Option<(ActorRef<ExecutionMessage>, JoinHandle<()>)>>,
}

impl<S: QueueStore> JobExecutionService<S> {
    pub fn new(
        store: Arc<S>,
        memory: Arc<MemoryQueue>,
        executors: Arc<ExecutorRegistry>,
        events: EventBus,
        queue_name: impl Into<String>,
        max_concurrency: usize,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            context: ExecutionContext {
                store,
                memory,
                executors,
                events,
                queue_name: queue_name.into(),
                max_concurrency: max_concurrency.max(1),
                backoff,
                counters: Arc::new(Counters::default()),
                owned: Arc::new(Mutex::new(HashSet::new())),
            },
            actor: Mutex::new(None),
        }
    }

    /// Spawn the execution actor. Starting twice is a no-op.
    pub async fn start(&self) -> Result<(), QueueError> {
        let mut actor = self.actor.lock().await;
        if actor.is_some() {
            return Ok(());
        }

        let counters = &self.context.counters;
        counters.stopping.store(false, Ordering::SeqCst);
        counters.loop_requested.store(false, Ordering::SeqCst);

        let name = format!("execution-{}-{}", self.context.queue_name, Ulid::new());
        let spawned = Actor::spawn(Some(name), ExecutionActor::new(), self.context.clone())
            .await
            .map_err(|e| QueueError::Actor(format!("Failed to spawn execution actor: {}", e)))?;

        *actor = Some(spawned);
        Ok(())
    }

    /// Stop accepting work and wait for in-flight jobs to settle.
    pub async fn stop(&self) -> Result<(), QueueError> {
        let Some((actor, handle)) = self.actor.lock().await.take() else {
            return Ok(());
        };

        self.context.counters.stopping.store(true, Ordering::SeqCst);
        actor.stop(None);
        handle
            .await
            .map_err(|e| QueueError::Actor(format!("Execution actor did not stop cleanly: {}", e)))
    }

    /// Ask the actor to run the processing loop.
    ///
    /// At most one request is queued at a time; a loop that is already
    /// running picks up newly staged jobs by itself.
    pub async fn start_processing_loop(&self) -> Result<(), QueueError> {
        let actor = self.actor.lock().await;
        let Some((actor, _)) = actor.as_ref() else {
            return Err(QueueError::Actor("execution service is not started".into()));
        };

        let counters = &self.context.counters;
        if counters.loop_requested.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        actor
            .send_message(ExecutionMessage::StartProcessingLoop)
            .map_err(|e| {
                counters.loop_requested.store(false, Ordering::SeqCst);
                QueueError::Actor(format!("Failed to start processing loop: {}", e))
            })
    }

    pub async fn is_running(&self) -> bool {
        self.actor.lock().await.is_some()
    }

    /// Hand back running jobs whose attempt started more than `stale_after`
    /// ago and that this service is not executing.
    ///
    /// Such jobs lost their runner: a crashed process, or a settlement this
    /// service could not write. Each goes back to waiting while it has
    /// attempts left and is marked failed otherwise. Returns how many jobs
    /// were reclaimed.
    pub async fn reclaim_orphaned(&self, stale_after: Duration) -> Result<usize, QueueError> {
        let context = &self.context;
        let cutoff = Utc::now() - chrono::Duration::milliseconds(stale_after.as_millis() as i64);
        let stale = context
            .store
            .find_stale_running(&context.queue_name, cutoff, RECLAIM_BATCH)
            .await?;

        let mut reclaimed = 0;
        for job in stale {
            if context.owned.lock().await.contains(&job.id) {
                continue;
            }

            let error = "execution abandoned before its outcome was recorded";
            let job = match context.store.reclaim_running(job.id, job.attempts, error).await {
                Ok(job) => job,
                Err(e) => {
                    // Settled or restarted since it was listed.
                    tracing::debug!("Skipped reclaiming job {}: {}", job.id, e);
                    continue;
                }
            };

            reclaimed += 1;
            if job.status == JobStatus::Failed {
                tracing::warn!(
                    "Reclaimed job {} in queue {} has no attempts left",
                    job.id,
                    context.queue_name
                );
                context.events.publish(QueueEvent::JobFailed {
                    job_id: job.id,
                    queue_name: context.queue_name.clone(),
                    error: error.to_string(),
                    attempts: job.attempts,
                    timestamp: Utc::now(),
                });
            } else {
                tracing::info!(
                    "Reclaimed job {} in queue {} after attempt {}",
                    job.id,
                    context.queue_name,
                    job.attempts
                );
                context.events.publish(QueueEvent::JobRetrying {
                    job_id: job.id,
                    queue_name: context.queue_name.clone(),
                    error: error.to_string(),
                    attempt: job.attempts,
                    eligible_at: job.eligible_at,
                    timestamp: Utc::now(),
                });
            }
        }

        Ok(reclaimed)
    }

    pub fn is_processing_loop(&self) -> bool {
        self.context.counters.looping.load(Ordering::SeqCst)
    }

    pub fn active_jobs(&self) -> u64 {
        self.context.counters.active.load(Ordering::SeqCst)
    }

    pub fn statistics(&self) -> ExecutionStatistics {
        let counters = &self.context.counters;
        ExecutionStatistics {
            active_jobs_count: counters.active.load(Ordering::SeqCst),
            total_processed: counters.processed.load(Ordering::SeqCst),
            total_successful: counters.successful.load(Ordering::SeqCst),
            total_failed: counters.failed.load(Ordering::SeqCst),
            is_processing_loop: counters.looping.load(Ordering::SeqCst),
        }
    }
}
