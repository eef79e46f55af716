//! The broker facade: the enqueue/cancel/inspect API handed to the REST
//! surface, the CLI, and the federation client.
//!
//! Mutations go through the store's tagged outcomes; the facade adds event
//! publication, worker notification on cancel, and the dispatcher wakeup.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use mnemo_db::models::Task;

use crate::events::{EventBus, channels};
use crate::health::Readiness;
use crate::hub::WorkerHub;
use crate::protocol::BrokerMessage;
use crate::store::{
    CancelOutcome, NewTask, StatusCounts, StoreUnavailable, TaskFilter, TaskStore,
};

/// Enqueue failure.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// Admission is closed (store not open) or the store itself failed.
    #[error("broker is not accepting work: {0}")]
    Unavailable(String),
}

impl From<StoreUnavailable> for EnqueueError {
    fn from(e: StoreUnavailable) -> Self {
        Self::Unavailable(e.0)
    }
}

/// Result of a cancel request, as surfaced to API callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelResult {
    Cancelled,
    NotFound,
    AlreadyTerminal,
}

/// Shared handle over the store, hub, and bus.
pub struct Broker {
    store: Arc<dyn TaskStore>,
    hub: Arc<WorkerHub>,
    bus: Arc<EventBus>,
    readiness: Arc<Readiness>,
    /// Wakes the dispatcher when new work lands.
    dispatch_wakeup: Arc<Notify>,
}

impl Broker {
    pub fn new(
        store: Arc<dyn TaskStore>,
        hub: Arc<WorkerHub>,
        bus: Arc<EventBus>,
        readiness: Arc<Readiness>,
        dispatch_wakeup: Arc<Notify>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            hub,
            bus,
            readiness,
            dispatch_wakeup,
        })
    }

    pub fn hub(&self) -> &Arc<WorkerHub> {
        &self.hub
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn readiness(&self) -> &Arc<Readiness> {
        &self.readiness
    }

    /// Persist a new task and wake the dispatcher.
    pub async fn enqueue(&self, new_task: NewTask) -> Result<Task, EnqueueError> {
        if !self.readiness.accepting_work() {
            return Err(EnqueueError::Unavailable("store is not open".into()));
        }

        let task = self.store.enqueue(new_task).await?;
        debug!(task_id = %task.id, kind = %task.kind, "task enqueued");
        self.bus.publish(
            channels::TASK_QUEUED,
            serde_json::json!({
                "task_id": task.id,
                "kind": task.kind,
                "capability": task.required_capability,
                "priority": task.priority,
                "retry_count": task.retry_count,
            }),
        );
        self.dispatch_wakeup.notify_one();
        Ok(task)
    }

    /// Cancel a task. If a worker currently holds it, a `task:cancel` frame
    /// is sent; whatever the worker reports afterwards cannot unwind the
    /// terminal status.
    pub async fn cancel(&self, id: Uuid, reason: &str) -> Result<CancelResult, StoreUnavailable> {
        match self.store.cancel(id, reason).await? {
            CancelOutcome::Cancelled { prior_worker } => {
                if let Some(worker_id) = prior_worker {
                    if let Some(session) = self.hub.get(&worker_id) {
                        session.untrack(id);
                        let _ = session.try_send(BrokerMessage::TaskCancel {
                            task_id: id,
                            reason: Some(reason.to_owned()),
                        });
                    }
                }
                self.bus.publish(
                    channels::TASK_CANCELLED,
                    serde_json::json!({ "task_id": id, "reason": reason }),
                );
                Ok(CancelResult::Cancelled)
            }
            CancelOutcome::AlreadyTerminal => Ok(CancelResult::AlreadyTerminal),
            CancelOutcome::NotFound => Ok(CancelResult::NotFound),
        }
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Task>, StoreUnavailable> {
        self.store.get(id).await
    }

    pub async fn list(
        &self,
        filter: &TaskFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Task>, StoreUnavailable> {
        self.store.list(filter, limit, offset).await
    }

    pub async fn count_by_status(&self) -> Result<StatusCounts, StoreUnavailable> {
        self.store.count_by_status().await
    }
}
