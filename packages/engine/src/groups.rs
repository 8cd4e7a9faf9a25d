//! Group management: pause/resume, statistics and cleanup.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use queue_core::{Group, GroupId, QueueError, QueueEvent, QueueStore};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use ulid::Ulid;

use crate::events::EventBus;
use crate::messages::GroupMaintenanceMessage;

/// Outcome of a pause or resume request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupOperationResult {
    pub success: bool,
    /// Waiting jobs of the group at the time of the operation.
    pub affected_jobs: u64,
    pub message: String,
}

/// Periodic schedules run by the maintenance actor.
#[derive(Debug, Clone, Copy)]
struct MaintenanceSchedule {
    sync_interval: Duration,
    cleanup_interval: Duration,
    retention: Duration,
}

/// Service over the group store.
pub struct GroupManagementService<S> {
    store: Arc<S>,
    events: EventBus,
    schedule: MaintenanceSchedule,
    maintenance: Arc<Mutex<Option<(ActorRef<GroupMaintenanceMessage>, JoinHandle<()>)>>>,
}

impl<S> Clone for GroupManagementService<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            events: self.events.clone(),
            schedule: self.schedule,
            maintenance: self.maintenance.clone(),
        }
    }
}

impl<S: QueueStore> GroupManagementService<S> {
    pub fn new(
        store: Arc<S>,
        events: EventBus,
        sync_interval: Duration,
        cleanup_interval: Duration,
        retention: Duration,
    ) -> Self {
        Self {
            store,
            events,
            schedule: MaintenanceSchedule {
                sync_interval,
                cleanup_interval,
                retention,
            },
            maintenance: Arc::new(Mutex::new(None)),
        }
    }

    /// Exclude the group's waiting jobs from future batch loads.
    pub async fn pause_group(
        &self,
        queue_name: &str,
        group_id: &GroupId,
        reason: &str,
    ) -> GroupOperationResult {
        match self.store.pause_group(queue_name, group_id, reason).await {
            Ok(affected_jobs) => {
                tracing::info!(
                    "Paused group {} in queue {} ({} waiting jobs): {}",
                    group_id,
                    queue_name,
                    affected_jobs,
                    reason
                );
                self.events.publish(QueueEvent::GroupPaused {
                    queue_name: queue_name.to_string(),
                    group_id: group_id.clone(),
                    reason: reason.to_string(),
                    affected_jobs,
                    timestamp: Utc::now(),
                });
                GroupOperationResult {
                    success: true,
                    affected_jobs,
                    message: format!("Group {} paused", group_id),
                }
            }
            Err(e) => {
                tracing::error!(
                    "Failed to pause group {} in queue {}: {}",
                    group_id,
                    queue_name,
                    e
                );
                GroupOperationResult {
                    success: false,
                    affected_jobs: 0,
                    message: format!("Failed to pause group {}: {}", group_id, e),
                }
            }
        }
    }

    /// Make the group's waiting jobs loadable again.
    pub async fn resume_group(
        &self,
        queue_name: &str,
        group_id: &GroupId,
        reason: &str,
    ) -> GroupOperationResult {
        match self.store.resume_group(queue_name, group_id).await {
            Ok(affected_jobs) => {
                tracing::info!(
                    "Resumed group {} in queue {} ({} waiting jobs): {}",
                    group_id,
                    queue_name,
                    affected_jobs,
                    reason
                );
                self.events.publish(QueueEvent::GroupResumed {
                    queue_name: queue_name.to_string(),
                    group_id: group_id.clone(),
                    reason: reason.to_string(),
                    affected_jobs,
                    timestamp: Utc::now(),
                });
                GroupOperationResult {
                    success: true,
                    affected_jobs,
                    message: format!("Group {} resumed", group_id),
                }
            }
            Err(e) => {
                tracing::error!(
                    "Failed to resume group {} in queue {}: {}",
                    group_id,
                    queue_name,
                    e
                );
                GroupOperationResult {
                    success: false,
                    affected_jobs: 0,
                    message: format!("Failed to resume group {}: {}", group_id, e),
                }
            }
        }
    }

    /// Get the group, creating it when absent.
    pub async fn upsert_group(&self, queue_name: &str, group_id: &GroupId) -> Result<Group, QueueError> {
        let (group, created) = self.store.upsert_group(queue_name, group_id).await?;
        if created {
            tracing::debug!("Created group {} in queue {}", group_id, queue_name);
            self.events.publish(QueueEvent::GroupCreated {
                group: group.clone(),
                timestamp: Utc::now(),
            });
        }
        Ok(group)
    }

    pub async fn get_group(&self, queue_name: &str, group_id: &GroupId) -> Result<Option<Group>, QueueError> {
        Ok(self.store.find_group(queue_name, group_id).await?)
    }

    /// Groups of one queue, or of every queue.
    pub async fn get_queue_groups(&self, queue_name: Option<&str>) -> Result<Vec<Group>, QueueError> {
        Ok(self.store.find_groups_by_queue(queue_name).await?)
    }

    pub async fn get_paused_group_ids(&self, queue_name: &str) -> Result<Vec<GroupId>, QueueError> {
        Ok(self.store.paused_group_ids(queue_name).await?)
    }

    /// Recompute group counters from the job store.
    ///
    /// With a group id only that group is synced, otherwise every group of
    /// the queue. Without a queue name nothing is done.
    pub async fn sync_group_statistics(
        &self,
        queue_name: Option<&str>,
        group_id: Option<&GroupId>,
    ) -> Result<Vec<Group>, QueueError> {
        let Some(queue_name) = queue_name else {
            tracing::warn!("Group statistics sync requested without a queue name");
            return Ok(Vec::new());
        };

        let group_ids = match group_id {
            Some(group_id) => vec![group_id.clone()],
            None => self
                .store
                .find_groups_by_queue(Some(queue_name))
                .await?
                .into_iter()
                .map(|g| g.id)
                .collect(),
        };

        let mut synced = Vec::with_capacity(group_ids.len());
        for group_id in group_ids {
            let counts = self.store.count_group_jobs(queue_name, &group_id).await?;
            let group = self
                .store
                .save_group_statistics(queue_name, &group_id, &counts)
                .await?;
            self.events.publish(QueueEvent::GroupStatisticsUpdated {
                group: group.clone(),
                timestamp: Utc::now(),
            });
            synced.push(group);
        }

        tracing::debug!("Synced statistics of {} groups in queue {}", synced.len(), queue_name);
        Ok(synced)
    }

    /// Remove groups without jobs that have not changed within the retention window.
    pub async fn cleanup_empty_groups(&self, queue_name: Option<&str>) -> Result<u64, QueueError> {
        let retention = chrono::Duration::from_std(self.schedule.retention)
            .unwrap_or(chrono::Duration::MAX);
        let older_than = Utc::now()
            .checked_sub_signed(retention)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

        let removed = self.store.cleanup_empty_groups(queue_name, older_than).await?;
        if removed > 0 {
            tracing::info!(
                "Removed {} empty groups from {}",
                removed,
                queue_name.unwrap_or("all queues")
            );
        }
        self.events.publish(QueueEvent::GroupCleanupCompleted {
            queue_name: queue_name.map(str::to_string),
            removed,
            timestamp: Utc::now(),
        });
        Ok(removed)
    }

    /// Start the periodic statistics sync and cleanup for a queue.
    pub async fn start(&self, queue_name: &str) -> Result<(), QueueError> {
        let mut maintenance = self.maintenance.lock().await;
        if maintenance.is_some() {
            return Ok(());
        }

        let args = MaintenanceArgs {
            service: self.clone(),
            queue_name: queue_name.to_string(),
        };
        let name = format!("group-maintenance-{}-{}", queue_name, Ulid::new());
        let spawned = Actor::spawn(Some(name), GroupMaintenanceActor::new(), args)
            .await
            .map_err(|e| QueueError::Actor(format!("Failed to spawn group maintenance: {}", e)))?;

        *maintenance = Some(spawned);
        Ok(())
    }

    /// Cancel the periodic schedules.
    pub async fn stop(&self) -> Result<(), QueueError> {
        let Some((actor, handle)) = self.maintenance.lock().await.take() else {
            return Ok(());
        };
        actor.stop(None);
        handle
            .await
            .map_err(|e| QueueError::Actor(format!("Group maintenance did not stop cleanly: {}", e)))
    }

    pub async fn is_running(&self) -> bool {
        self.maintenance.lock().await.is_some()
    }
}

/// Arguments for the maintenance actor.
pub(crate) struct MaintenanceArgs<S> {
    service: GroupManagementService<S>,
    queue_name: String,
}

/// State for the maintenance actor.
pub(crate) struct MaintenanceState<S> {
    service: GroupManagementService<S>,
    queue_name: String,
    tickers: Vec<JoinHandle<()>>,
}

/// Actor running the group maintenance schedules.
pub(crate) struct GroupMaintenanceActor<S>(PhantomData<fn() -> S>);

impl<S> GroupMaintenanceActor<S> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<S> Default for GroupMaintenanceActor<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// Send `message` to the actor every `period`, starting one period from now.
fn spawn_ticker(
    actor: ActorRef<GroupMaintenanceMessage>,
    period: Duration,
    message: fn() -> GroupMaintenanceMessage,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = period.max(Duration::from_millis(1));
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if actor.send_message(message()).is_err() {
                break;
            }
        }
    })
}

impl<S: QueueStore> Actor for GroupMaintenanceActor<S> {
    type Msg = GroupMaintenanceMessage;
    type State = MaintenanceState<S>;
    type Arguments = MaintenanceArgs<S>;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting group maintenance for queue {}", args.queue_name);

        let schedule = args.service.schedule;
        let tickers = vec![
            spawn_ticker(myself.clone(), schedule.sync_interval, || {
                GroupMaintenanceMessage::SyncStatistics
            }),
            spawn_ticker(myself, schedule.cleanup_interval, || {
                GroupMaintenanceMessage::CleanupEmptyGroups
            }),
        ];

        Ok(MaintenanceState {
            service: args.service,
            queue_name: args.queue_name,
            tickers,
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            GroupMaintenanceMessage::SyncStatistics => {
                if let Err(e) = state
                    .service
                    .sync_group_statistics(Some(&state.queue_name), None)
                    .await
                {
                    tracing::warn!(
                        "Scheduled group statistics sync for queue {} failed: {}",
                        state.queue_name,
                        e
                    );
                }
            }

            GroupMaintenanceMessage::CleanupEmptyGroups => {
                if let Err(e) = state
                    .service
                    .cleanup_empty_groups(Some(&state.queue_name))
                    .await
                {
                    tracing::warn!(
                        "Scheduled group cleanup for queue {} failed: {}",
                        state.queue_name,
                        e
                    );
                }
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        for ticker in state.tickers.drain(..) {
            ticker.abort();
        }
        tracing::info!("Group maintenance for queue {} stopped", state.queue_name);
        Ok(())
    }
}
