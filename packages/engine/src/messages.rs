//! Message types for actor communication.

/// Messages for the execution actor.
#[derive(Debug)]
pub(crate) enum ExecutionMessage {
    /// Drain the memory queue until it is empty and nothing is in flight.
    StartProcessingLoop,
}

/// Messages for the group maintenance actor.
#[derive(Debug)]
pub(crate) enum GroupMaintenanceMessage {
    /// Recompute the counters of every group of the queue.
    SyncStatistics,

    /// Remove empty groups past the retention window.
    CleanupEmptyGroups,
}
