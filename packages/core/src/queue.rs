//! Queue configuration and derived statistics.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Exponential retry backoff with a cap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay after the first failed attempt (milliseconds).
    pub initial_delay_ms: u64,
    /// Growth factor applied per additional failed attempt.
    pub multiplier: f64,
    /// Upper bound for any single delay (milliseconds).
    pub max_delay_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 300_000,
        }
    }
}

impl BackoffPolicy {
    /// No delay between attempts.
    pub fn immediate() -> Self {
        Self {
            initial_delay_ms: 0,
            multiplier: 1.0,
            max_delay_ms: 0,
        }
    }

    /// Delay before the next attempt, given the number of attempts already made (1-based).
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(63) as i32;
        let delay = self.initial_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = delay.min(self.max_delay_ms as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

/// Configuration for one queue instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Name of the queue this instance consumes.
    pub queue_name: String,
    /// Maximum number of jobs staged in memory at once.
    pub watermark: usize,
    /// Maximum number of jobs dispatched and unsettled at once.
    pub max_concurrency: usize,
    /// Page size used when streaming eligible jobs from the store.
    pub batch_size: usize,
    /// Interval of the monitor that polls for deferred work (milliseconds).
    pub poll_interval_ms: u64,
    /// Backoff applied when a failed job is requeued.
    pub retry_backoff: BackoffPolicy,
    /// Interval of the group statistics sync (milliseconds).
    pub group_sync_interval_ms: u64,
    /// Interval of the empty-group cleanup (milliseconds).
    pub group_cleanup_interval_ms: u64,
    /// How long an empty group is kept before cleanup removes it (milliseconds).
    pub group_retention_ms: u64,
    /// How long a job may stay running without an owner in this process before
    /// the monitor takes it back (milliseconds).
    pub stale_job_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_name: "default".to_string(),
            watermark: 1_000,
            max_concurrency: 4,
            batch_size: 100,
            poll_interval_ms: 5_000,
            retry_backoff: BackoffPolicy::default(),
            group_sync_interval_ms: 60_000,
            group_cleanup_interval_ms: 3_600_000,
            group_retention_ms: 86_400_000,
            stale_job_timeout_ms: 300_000,
        }
    }
}

impl QueueConfig {
    /// Create a config for the named queue with default settings.
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            ..Default::default()
        }
    }

    pub fn with_watermark(mut self, watermark: usize) -> Self {
        self.watermark = watermark;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_group_intervals(mut self, sync: Duration, cleanup: Duration) -> Self {
        self.group_sync_interval_ms = sync.as_millis() as u64;
        self.group_cleanup_interval_ms = cleanup.as_millis() as u64;
        self
    }

    pub fn with_group_retention(mut self, retention: Duration) -> Self {
        self.group_retention_ms = retention.as_millis() as u64;
        self
    }

    pub fn with_stale_job_timeout(mut self, timeout: Duration) -> Self {
        self.stale_job_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn group_sync_interval(&self) -> Duration {
        Duration::from_millis(self.group_sync_interval_ms)
    }

    pub fn group_cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.group_cleanup_interval_ms)
    }

    pub fn group_retention(&self) -> Duration {
        Duration::from_millis(self.group_retention_ms)
    }

    pub fn stale_job_timeout(&self) -> Duration {
        Duration::from_millis(self.stale_job_timeout_ms)
    }

    /// Check the settings that must be non-zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.watermark == 0 {
            return Err(ConfigError::MustBePositive("watermark"));
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::MustBePositive("max_concurrency"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::MustBePositive("batch_size"));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::MustBePositive("poll_interval_ms"));
        }
        Ok(())
    }

    /// Load the config from `QUEUE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load the config from an arbitrary key lookup, falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(name) = lookup("QUEUE_NAME") {
            config.queue_name = name;
        }
        set_parsed(&lookup, "QUEUE_WATERMARK", &mut config.watermark)?;
        set_parsed(&lookup, "QUEUE_MAX_CONCURRENCY", &mut config.max_concurrency)?;
        set_parsed(&lookup, "QUEUE_BATCH_SIZE", &mut config.batch_size)?;
        set_parsed(&lookup, "QUEUE_POLL_INTERVAL_MS", &mut config.poll_interval_ms)?;
        set_parsed(
            &lookup,
            "QUEUE_RETRY_INITIAL_DELAY_MS",
            &mut config.retry_backoff.initial_delay_ms,
        )?;
        set_parsed(
            &lookup,
            "QUEUE_RETRY_MAX_DELAY_MS",
            &mut config.retry_backoff.max_delay_ms,
        )?;
        set_parsed(
            &lookup,
            "QUEUE_RETRY_MULTIPLIER",
            &mut config.retry_backoff.multiplier,
        )?;
        set_parsed(
            &lookup,
            "QUEUE_GROUP_SYNC_INTERVAL_MS",
            &mut config.group_sync_interval_ms,
        )?;
        set_parsed(
            &lookup,
            "QUEUE_GROUP_CLEANUP_INTERVAL_MS",
            &mut config.group_cleanup_interval_ms,
        )?;
        set_parsed(&lookup, "QUEUE_GROUP_RETENTION_MS", &mut config.group_retention_ms)?;
        set_parsed(
            &lookup,
            "QUEUE_STALE_JOB_TIMEOUT_MS",
            &mut config.stale_job_timeout_ms,
        )?;

        config.validate()?;
        Ok(config)
    }
}

fn set_parsed<F, T>(lookup: &F, key: &str, target: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        *target = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.clone(),
        })?;
    }
    Ok(())
}

/// Counters of the job execution service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionStatistics {
    pub active_jobs_count: u64,
    pub total_processed: u64,
    pub total_successful: u64,
    pub total_failed: u64,
    pub is_processing_loop: bool,
}

impl ExecutionStatistics {
    /// Fraction of processed jobs that succeeded.
    pub fn success_rate(&self) -> f64 {
        self.total_successful as f64 / self.total_processed.max(1) as f64
    }
}

/// Snapshot of a queue instance's in-memory state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueStatistics {
    pub queue_name: String,
    pub memory_queue_length: usize,
    pub watermark: usize,
    pub remaining_water_mark: usize,
    pub total_batch_loads: u64,
    pub execution: ExecutionStatistics,
}

impl QueueStatistics {
    pub fn active_jobs(&self) -> u64 {
        self.execution.active_jobs_count
    }

    pub fn success_rate(&self) -> f64 {
        self.execution.success_rate()
    }

    /// Nothing staged, nothing running and no loop draining.
    pub fn is_idle(&self) -> bool {
        self.memory_queue_length == 0
            && self.execution.active_jobs_count == 0
            && !self.execution.is_processing_loop
    }
}

/// Bucket used for failed jobs that belong to no group.
pub const UNGROUPED: &str = "ungrouped";

/// Breakdown of failed jobs in a queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailedTaskStats {
    pub total: u64,
    pub by_executor: BTreeMap<String, u64>,
    pub by_group: BTreeMap<String, u64>,
}
