//! Bounded in-memory staging area between the store and the executors.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use queue_core::{Job, JobId, QueueError};

/// A staged job plus its arrival sequence number.
struct Staged {
    job: Job,
    seq: u64,
}

impl Staged {
    fn key(&self) -> (u8, Reverse<DateTime<Utc>>, Reverse<u64>) {
        (
            self.job.priority.rank(),
            Reverse(self.job.created_at),
            Reverse(self.seq),
        )
    }
}

impl PartialEq for Staged {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Staged {}

impl PartialOrd for Staged {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Staged {
    // Max-heap: higher priority first, then older, then earlier arrival.
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<Staged>,
    resident: HashSet<JobId>,
    next_seq: u64,
}

/// Priority queue of jobs waiting for an executor slot.
///
/// Capacity is fixed at construction (the watermark). The length never
/// exceeds it.
pub struct MemoryQueue {
    watermark: usize,
    inner: Mutex<Inner>,
}

impl MemoryQueue {
    pub fn new(watermark: usize) -> Self {
        Self {
            watermark,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stage a job.
    ///
    /// Returns `Ok(false)` when the job is already resident, and
    /// `CapacityExceeded` when the queue is at its watermark.
    pub fn enqueue(&self, job: Job) -> Result<bool, QueueError> {
        let mut inner = self.lock();
        if inner.resident.contains(&job.id) {
            return Ok(false);
        }
        if inner.heap.len() >= self.watermark {
            return Err(QueueError::CapacityExceeded {
                watermark: self.watermark,
            });
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.resident.insert(job.id);
        inner.heap.push(Staged { job, seq });
        Ok(true)
    }

    /// Remove the highest-priority, oldest job.
    pub fn dequeue(&self) -> Option<Job> {
        let mut inner = self.lock();
        let staged = inner.heap.pop()?;
        inner.resident.remove(&staged.job.id);
        Some(staged.job)
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().heap.is_empty()
    }

    pub fn watermark(&self) -> usize {
        self.watermark
    }

    /// Free slots left before the watermark is reached.
    pub fn remaining_water_mark(&self) -> usize {
        self.watermark.saturating_sub(self.len())
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.lock().resident.contains(id)
    }

    /// Drop every staged job. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut inner = self.lock();
        let dropped = inner.heap.len();
        inner.heap.clear();
        inner.resident.clear();
        dropped
    }
}
