//! Queue orchestrator.
//!
//! [`QueueManager`] wires the memory queue, job stream, execution service and
//! group management together and owns the watermark check that decides when
//! the next batch is loaded from the store.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use queue_core::{
    BatchLoadEvent, FailedTaskStats, Group, GroupId, Job, JobId, QueueConfig, QueueError,
    QueueEvent, QueueStatistics, QueueStore, UNGROUPED,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;

use crate::events::EventBus;
use crate::execution::JobExecutionService;
use crate::executor::ExecutorRegistry;
use crate::groups::{GroupManagementService, GroupOperationResult};
use crate::job_stream::JobStream;
use crate::memory_queue::MemoryQueue;

/// Result of a watermark check.
#[derive(Debug, Clone)]
pub enum QueueCheckOutcome {
    /// The manager is not started.
    NotStarted,
    /// A processing loop is draining; the check is repeated once it drains.
    Draining,
    /// A batch was loaded into the empty memory queue.
    Loaded(BatchLoadEvent),
    /// Jobs are staged but no loop is running yet.
    Pending,
    /// The stream had no room to load into.
    Skipped,
}

/// Per-job outcome of a retry request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryResult {
    pub job_id: JobId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct ManagerInner<S> {
    config: QueueConfig,
    store: Arc<S>,
    memory: Arc<MemoryQueue>,
    events: EventBus,
    stream: JobStream<S>,
    execution: JobExecutionService<S>,
    groups: GroupManagementService<S>,
    started: AtomicBool,
    /// A watermark check was refused or left work behind; run it again on drain.
    recheck: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Facade over one queue. Cheap to clone.
pub struct QueueManager<S> {
    inner: Arc<ManagerInner<S>>,
}

impl<S> Clone for QueueManager<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: QueueStore> QueueManager<S> {
    pub fn new(
        config: QueueConfig,
        store: Arc<S>,
        executors: ExecutorRegistry,
    ) -> Result<Self, QueueError> {
        config.validate()?;

        let events = EventBus::default();
        let memory = Arc::new(MemoryQueue::new(config.watermark));
        let stream = JobStream::new(
            store.clone(),
            memory.clone(),
            events.clone(),
            config.queue_name.clone(),
            config.batch_size,
        );
        let execution = JobExecutionService::new(
            store.clone(),
            memory.clone(),
            Arc::new(executors),
            events.clone(),
            config.queue_name.clone(),
            config.max_concurrency,
            config.retry_backoff.clone(),
        );
        let groups = GroupManagementService::new(
            store.clone(),
            events.clone(),
            config.group_sync_interval(),
            config.group_cleanup_interval(),
            config.group_retention(),
        );
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                store,
                memory,
                events,
                stream,
                execution,
                groups,
                started: AtomicBool::new(false),
                recheck: AtomicBool::new(false),
                shutdown,
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn queue_name(&self) -> &str {
        &self.inner.config.queue_name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Start the dispatcher, execution service, group maintenance and monitor,
    /// then load the first batch.
    pub async fn start(&self) -> Result<(), QueueError> {
        let inner = &self.inner;
        let mut tasks = inner.tasks.lock().await;
        if inner.started.load(Ordering::SeqCst) {
            return Ok(());
        }

        tracing::info!("Starting queue manager for queue {}", self.queue_name());
        inner.shutdown.send_replace(false);

        // Subscribe before anything can publish.
        let events = inner.events.subscribe();
        tasks.push(tokio::spawn(self.clone().dispatch_events(events)));

        if let Err(e) = self.start_services().await {
            inner.shutdown.send_replace(true);
            return Err(e);
        }
        tasks.push(tokio::spawn(self.clone().monitor()));

        inner.stream.initialize().await;
        inner.started.store(true, Ordering::SeqCst);
        drop(tasks);

        self.reclaim_quietly().await;

        if inner.memory.is_empty() {
            match inner.stream.trigger_batch_load("startup").await {
                Ok(Some(batch)) => self.note_load(&batch),
                Ok(None) => {}
                Err(e) => tracing::warn!(
                    "Initial batch load for queue {} failed: {}",
                    self.queue_name(),
                    e
                ),
            }
        }

        tracing::info!("Queue manager for queue {} started", self.queue_name());
        Ok(())
    }

    async fn start_services(&self) -> Result<(), QueueError> {
        self.inner.execution.start().await?;
        if let Err(e) = self.inner.groups.start(self.queue_name()).await {
            self.inner.execution.stop().await?;
            return Err(e);
        }
        Ok(())
    }

    /// Stop in reverse start order. In-flight jobs settle before this returns.
    pub async fn stop(&self) -> Result<(), QueueError> {
        let inner = &self.inner;
        let mut tasks = inner.tasks.lock().await;
        if !inner.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        tracing::info!("Stopping queue manager for queue {}", self.queue_name());
        inner.shutdown.send_replace(true);

        let handles: Vec<JoinHandle<()>> = tasks.drain(..).collect();
        drop(tasks);

        let groups = inner.groups.stop().await;
        let execution = inner.execution.stop().await;

        for handle in handles.into_iter().rev() {
            if let Err(e) = handle.await {
                tracing::warn!("Queue manager task ended abnormally: {}", e);
            }
        }

        groups?;
        execution?;
        tracing::info!("Queue manager for queue {} stopped", self.queue_name());
        Ok(())
    }

    /// Persist a job, then run the watermark check.
    pub async fn add_task(&self, job: Job) -> Result<Job, QueueError> {
        self.check_job(&job)?;
        if let Some(group_id) = &job.group_id {
            self.inner.groups.upsert_group(self.queue_name(), group_id).await?;
        }

        let created = self.inner.store.create(&job).await?;
        tracing::debug!("Added job {} to queue {}", created.id, self.queue_name());

        if let Some(group_id) = &created.group_id {
            self.sync_group_quietly(group_id).await;
        }
        self.check_quietly("task_added").await;
        Ok(created)
    }

    /// Persist several jobs, then run the watermark check once.
    pub async fn add_tasks(&self, jobs: Vec<Job>) -> Result<Vec<Job>, QueueError> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        for job in &jobs {
            self.check_job(job)?;
        }

        let group_ids: BTreeSet<&GroupId> = jobs.iter().filter_map(|j| j.group_id.as_ref()).collect();
        for group_id in &group_ids {
            self.inner.groups.upsert_group(self.queue_name(), group_id).await?;
        }

        let created = self.inner.store.create_batch(&jobs).await?;
        tracing::debug!("Added {} jobs to queue {}", created.len(), self.queue_name());

        for group_id in group_ids {
            self.sync_group_quietly(group_id).await;
        }
        self.check_quietly("tasks_added").await;
        Ok(created)
    }

    /// Persist jobs as members of one group.
    pub async fn add_group_tasks(
        &self,
        group_id: impl Into<GroupId>,
        jobs: Vec<Job>,
    ) -> Result<Vec<Job>, QueueError> {
        let group_id = group_id.into();
        let jobs = jobs
            .into_iter()
            .map(|job| job.with_group(group_id.clone()))
            .collect();
        self.add_tasks(jobs).await
    }

    fn check_job(&self, job: &Job) -> Result<(), QueueError> {
        if job.queue_name != self.queue_name() {
            return Err(QueueError::InvalidJob(format!(
                "job {} targets queue {}, not {}",
                job.id,
                job.queue_name,
                self.queue_name()
            )));
        }
        Ok(())
    }

    /// Load the next batch if the memory queue is empty and nothing is draining.
    pub async fn trigger_queue_check_if_needed(
        &self,
        reason: &str,
    ) -> Result<QueueCheckOutcome, QueueError> {
        let inner = &self.inner;
        if !inner.started.load(Ordering::SeqCst) {
            return Ok(QueueCheckOutcome::NotStarted);
        }

        let draining = || inner.execution.is_processing_loop() || inner.execution.active_jobs() > 0;
        if draining() {
            inner.recheck.store(true, Ordering::SeqCst);
            // The loop may have drained between the two reads; then nobody
            // would consume the recheck, so handle it here.
            if draining() {
                tracing::debug!(
                    "Queue check for {} ({}) deferred: processing loop is draining",
                    self.queue_name(),
                    reason
                );
                return Ok(QueueCheckOutcome::Draining);
            }
            inner.recheck.store(false, Ordering::SeqCst);
        }

        if !inner.memory.is_empty() {
            inner.recheck.store(true, Ordering::SeqCst);
            return Ok(QueueCheckOutcome::Pending);
        }

        match inner.stream.trigger_batch_load(reason).await? {
            Some(batch) => {
                self.note_load(&batch);
                Ok(QueueCheckOutcome::Loaded(batch))
            }
            None => Ok(QueueCheckOutcome::Skipped),
        }
    }

    /// A load that filled the memory queue may have left eligible jobs behind.
    fn note_load(&self, batch: &BatchLoadEvent) {
        if batch.total_jobs > 0 && self.inner.memory.remaining_water_mark() == 0 {
            self.inner.recheck.store(true, Ordering::SeqCst);
        }
    }

    async fn check_quietly(&self, reason: &str) {
        if let Err(e) = self.trigger_queue_check_if_needed(reason).await {
            tracing::warn!("Queue check for {} ({}) failed: {}", self.queue_name(), reason, e);
        }
    }

    /// Put running jobs that lost their runner back in line.
    ///
    /// Runs at start and on every monitor tick; jobs this manager is still
    /// executing are never touched.
    pub async fn reclaim_stale_jobs(&self) -> Result<usize, QueueError> {
        self.inner
            .execution
            .reclaim_orphaned(self.inner.config.stale_job_timeout())
            .await
    }

    async fn reclaim_quietly(&self) {
        match self.reclaim_stale_jobs().await {
            Ok(0) => {}
            Ok(reclaimed) => tracing::info!(
                "Reclaimed {} stale running jobs in queue {}",
                reclaimed,
                self.queue_name()
            ),
            Err(e) => tracing::warn!(
                "Failed to reclaim stale jobs in queue {}: {}",
                self.queue_name(),
                e
            ),
        }
    }

    async fn sync_group_quietly(&self, group_id: &GroupId) {
        if let Err(e) = self
            .inner
            .groups
            .sync_group_statistics(Some(self.queue_name()), Some(group_id))
            .await
        {
            tracing::warn!(
                "Failed to sync statistics of group {} in queue {}: {}",
                group_id,
                self.queue_name(),
                e
            );
        }
    }

    /// Current state of a job, as stored.
    pub async fn get_task_status(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.inner.store.find_by_id(id).await?)
    }

    /// A group with freshly derived counters, if it exists.
    pub async fn get_group_status(&self, group_id: &GroupId) -> Result<Option<Group>, QueueError> {
        let groups = &self.inner.groups;
        if groups.get_group(self.queue_name(), group_id).await?.is_none() {
            return Ok(None);
        }
        let synced = groups
            .sync_group_statistics(Some(self.queue_name()), Some(group_id))
            .await?;
        Ok(synced.into_iter().next())
    }

    /// Every group of the queue with freshly derived counters.
    pub async fn get_all_group_statuses(&self) -> Result<Vec<Group>, QueueError> {
        self.inner
            .groups
            .sync_group_statistics(Some(self.queue_name()), None)
            .await
    }

    pub async fn get_failed_tasks(&self, limit: usize, offset: usize) -> Result<Vec<Job>, QueueError> {
        Ok(self
            .inner
            .store
            .get_failed_jobs(self.queue_name(), limit, offset)
            .await?)
    }

    /// Failed jobs of the queue, counted by executor and by group.
    pub async fn get_failed_tasks_stats(&self) -> Result<FailedTaskStats, QueueError> {
        let page_size = self.inner.config.batch_size;
        let mut stats = FailedTaskStats::default();
        let mut offset = 0;

        loop {
            let page = self.get_failed_tasks(page_size, offset).await?;
            let fetched = page.len();
            for job in page {
                stats.total += 1;
                *stats.by_executor.entry(job.executor).or_default() += 1;
                let group = job
                    .group_id
                    .map(|g| g.0)
                    .unwrap_or_else(|| UNGROUPED.to_string());
                *stats.by_group.entry(group).or_default() += 1;
            }
            if fetched < page_size {
                break;
            }
            offset += fetched;
        }

        Ok(stats)
    }

    /// Put one failed job back to waiting with a fresh attempt budget.
    pub async fn retry_failed_task(&self, id: JobId) -> RetryResult {
        let result = self.reset_failed(id).await;
        if result.success {
            self.check_quietly("retry").await;
        }
        result
    }

    /// Retry several failed jobs; individual failures do not stop the batch.
    pub async fn retry_failed_tasks(&self, ids: &[JobId]) -> Vec<RetryResult> {
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            results.push(self.reset_failed(*id).await);
        }
        if results.iter().any(|r| r.success) {
            self.check_quietly("retry").await;
        }
        results
    }

    async fn reset_failed(&self, id: JobId) -> RetryResult {
        match self.inner.store.retry_failed_job(id).await {
            Ok(_) => {
                tracing::info!("Job {} reset for retry in queue {}", id, self.queue_name());
                RetryResult {
                    job_id: id,
                    success: true,
                    error: None,
                }
            }
            Err(e) => {
                tracing::warn!("Failed to retry job {} in queue {}: {}", id, self.queue_name(), e);
                RetryResult {
                    job_id: id,
                    success: false,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Wait until nothing is staged, running or draining. Returns `false` on timeout.
    pub async fn wait_for_completion(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.get_statistics().is_idle() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    pub fn get_statistics(&self) -> QueueStatistics {
        let inner = &self.inner;
        QueueStatistics {
            queue_name: self.queue_name().to_string(),
            memory_queue_length: inner.memory.len(),
            watermark: inner.memory.watermark(),
            remaining_water_mark: inner.memory.remaining_water_mark(),
            total_batch_loads: inner.stream.total_loads(),
            execution: inner.execution.statistics(),
        }
    }

    /// Drop every staged job. Stored state is untouched; the jobs are loaded again later.
    pub fn clear_memory_queue(&self) -> usize {
        let dropped = self.inner.memory.clear();
        tracing::info!("Cleared {} staged jobs from queue {}", dropped, self.queue_name());
        dropped
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    pub async fn pause_group(&self, group_id: &GroupId, reason: &str) -> GroupOperationResult {
        self.inner
            .groups
            .pause_group(self.queue_name(), group_id, reason)
            .await
    }

    pub async fn resume_group(&self, group_id: &GroupId, reason: &str) -> GroupOperationResult {
        let result = self
            .inner
            .groups
            .resume_group(self.queue_name(), group_id, reason)
            .await;
        if result.success {
            self.check_quietly("group_resumed").await;
        }
        result
    }

    pub fn groups(&self) -> &GroupManagementService<S> {
        &self.inner.groups
    }

    /// React to stream and processing events until shutdown.
    async fn dispatch_events(self, mut events: broadcast::Receiver<QueueEvent>) {
        let mut shutdown = self.inner.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return;
        }

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = events.recv() => match received {
                    Ok(QueueEvent::StreamBatchLoaded { batch }) => {
                        if batch.total_jobs > 0 && batch.queue_name == self.queue_name() {
                            self.start_loop_quietly().await;
                        }
                    }
                    Ok(QueueEvent::ProcessingDrained { queue_name, .. }) => {
                        if queue_name == self.queue_name()
                            && self.inner.recheck.swap(false, Ordering::SeqCst)
                        {
                            self.check_quietly("empty_queue").await;
                        }
                    }
                    Ok(QueueEvent::JobRetrying { .. }) => {
                        self.inner.recheck.store(true, Ordering::SeqCst);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(
                            "Event dispatcher for queue {} missed {} events",
                            self.queue_name(),
                            missed
                        );
                        self.inner.recheck.store(true, Ordering::SeqCst);
                        if !self.inner.memory.is_empty() {
                            self.start_loop_quietly().await;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        tracing::debug!("Event dispatcher for queue {} stopped", self.queue_name());
    }

    async fn start_loop_quietly(&self) {
        if let Err(e) = self.inner.execution.start_processing_loop().await {
            tracing::warn!(
                "Failed to start processing loop for queue {}: {}",
                self.queue_name(),
                e
            );
        }
    }

    /// Periodic statistics log, loop nudge, stale job reclaim and watermark check.
    async fn monitor(self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return;
        }
        let period = self.inner.config.poll_interval().max(Duration::from_millis(1));
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {
                    let stats = self.get_statistics();
                    tracing::debug!(
                        "Queue {}: {} staged, {} active, {} processed, {} loads",
                        stats.queue_name,
                        stats.memory_queue_length,
                        stats.active_jobs(),
                        stats.execution.total_processed,
                        stats.total_batch_loads
                    );

                    if stats.memory_queue_length > 0 && !stats.execution.is_processing_loop {
                        self.start_loop_quietly().await;
                    }
                    self.reclaim_quietly().await;
                    self.check_quietly("poll").await;
                }
            }
        }

        tracing::debug!("Monitor for queue {} stopped", self.queue_name());
    }
}
