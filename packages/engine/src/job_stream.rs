//! Moves eligible jobs from the store into the memory queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use queue_core::{BatchLoadEvent, EligibleQuery, QueueError, QueueEvent, QueueStore};
use tokio::sync::Mutex;
use ulid::Ulid;

use crate::events::EventBus;
use crate::memory_queue::MemoryQueue;

/// Position of the stream after its most recent load.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadCursor {
    pub last_loaded_at: Option<DateTime<Utc>>,
    pub last_event_id: Option<Ulid>,
}

/// Batch loader for one queue.
///
/// Loads are serialized: a second caller waits for the running load and then
/// sees the memory queue it left behind.
pub struct JobStream<S> {
    store: Arc<S>,
    memory: Arc<MemoryQueue>,
    events: EventBus,
    queue_name: String,
    batch_size: usize,
    cursor: Mutex<LoadCursor>,
    initialized: AtomicBool,
    total_loads: AtomicU64,
}

impl<S: QueueStore> JobStream<S> {
    pub fn new(
        store: Arc<S>,
        memory: Arc<MemoryQueue>,
        events: EventBus,
        queue_name: impl Into<String>,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            memory,
            events,
            queue_name: queue_name.into(),
            batch_size: batch_size.max(1),
            cursor: Mutex::new(LoadCursor::default()),
            initialized: AtomicBool::new(false),
            total_loads: AtomicU64::new(0),
        }
    }

    /// Reset the load cursor. Only the first call has an effect; returns
    /// whether this call initialized the stream.
    pub async fn initialize(&self) -> bool {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return false;
        }
        *self.cursor.lock().await = LoadCursor::default();
        tracing::debug!("Job stream for queue {} initialized", self.queue_name);
        true
    }

    /// Fill the memory queue up to its watermark with eligible jobs.
    ///
    /// Returns `Ok(None)` when the memory queue has no free slot. On a
    /// storage error, jobs staged so far stay staged.
    pub async fn trigger_batch_load(
        &self,
        reason: &str,
    ) -> Result<Option<BatchLoadEvent>, QueueError> {
        let mut cursor = self.cursor.lock().await;

        let mut remaining = self.memory.remaining_water_mark();
        if remaining == 0 {
            tracing::debug!(
                "Skipping batch load for queue {} ({}): memory queue is full",
                self.queue_name,
                reason
            );
            return Ok(None);
        }

        let excluded_groups = self
            .store
            .paused_group_ids(&self.queue_name)
            .await
            .map_err(|e| self.load_failed(reason, e.into()))?;

        let now = Utc::now();
        let mut offset = 0;
        let mut total_batches = 0u32;
        let mut total_jobs = 0usize;

        while remaining > 0 {
            let limit = remaining.min(self.batch_size);
            let query = EligibleQuery {
                queue_name: self.queue_name.clone(),
                now,
                excluded_groups: excluded_groups.clone(),
                limit,
                offset,
            };

            let page = self
                .store
                .query_eligible(&query)
                .await
                .map_err(|e| self.load_failed(reason, e.into()))?;

            total_batches += 1;
            let fetched = page.len();
            offset += fetched;

            for job in page {
                match self.memory.enqueue(job) {
                    Ok(true) => total_jobs += 1,
                    // Already staged by an earlier load
                    Ok(false) => {}
                    Err(QueueError::CapacityExceeded { .. }) => break,
                    Err(e) => return Err(self.load_failed(reason, e)),
                }
            }

            if fetched < limit {
                break;
            }
            remaining = self.memory.remaining_water_mark();
        }

        let batch = BatchLoadEvent {
            event_id: Ulid::new(),
            queue_name: self.queue_name.clone(),
            reason: reason.to_string(),
            total_batches,
            total_jobs,
            loaded_at: now,
        };

        cursor.last_loaded_at = Some(now);
        cursor.last_event_id = Some(batch.event_id);
        self.total_loads.fetch_add(1, Ordering::SeqCst);

        tracing::debug!(
            "Loaded {} jobs in {} batches into queue {} ({})",
            total_jobs,
            total_batches,
            self.queue_name,
            reason
        );

        self.events.publish(QueueEvent::StreamBatchLoaded {
            batch: batch.clone(),
        });

        Ok(Some(batch))
    }

    fn load_failed(&self, reason: &str, error: QueueError) -> QueueError {
        tracing::error!(
            "Batch load for queue {} ({}) failed: {}",
            self.queue_name,
            reason,
            error
        );
        error
    }

    /// Loads performed so far; no-op calls are not counted.
    pub fn total_loads(&self) -> u64 {
        self.total_loads.load(Ordering::SeqCst)
    }

    pub async fn last_load(&self) -> LoadCursor {
        self.cursor.lock().await.clone()
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }
}
