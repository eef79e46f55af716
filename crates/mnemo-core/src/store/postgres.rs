//! PostgreSQL implementation of the [`TaskStore`] contract, delegating to
//! the guarded-UPDATE queries in `mnemo-db`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use mnemo_db::models::{Task, TaskStatus};
use mnemo_db::queries::tasks as db;

use super::{
    CancelOutcome, FailOutcome, MutateOutcome, NewTask, StatusCounts, StoreUnavailable, TaskFilter,
    TaskStore,
};

/// The production store.
pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Classify a zero-rows guarded update by re-reading the row.
    async fn classify_miss(&self, id: Uuid) -> Result<MutateOutcome, StoreUnavailable> {
        match db::get_task(&self.pool, id).await.map_err(unavailable)? {
            None => Ok(MutateOutcome::NotFound),
            Some(t) if t.status.is_terminal() => Ok(MutateOutcome::AlreadyTerminal),
            Some(_) => Ok(MutateOutcome::Conflict),
        }
    }

    /// Shared body of [`TaskStore::fail`] and [`TaskStore::release`]; the
    /// two differ only in the terminal status they land on when the retry
    /// budget is spent.
    async fn fail_with_terminal_status(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &str,
        retryable: bool,
        retry_after: DateTime<Utc>,
        exhausted_status: TaskStatus,
    ) -> Result<FailOutcome, StoreUnavailable> {
        let Some(task) = db::get_task(&self.pool, id).await.map_err(unavailable)? else {
            return Ok(FailOutcome::NotFound);
        };
        if task.status.is_terminal() {
            return Ok(FailOutcome::AlreadyTerminal);
        }

        if retryable && task.retry_count < task.max_retries {
            let rows = db::fail_task_retry(
                &self.pool,
                id,
                worker_id,
                task.retry_count,
                retry_after,
            )
            .await
            .map_err(unavailable)?;
            if rows == 0 {
                return Ok(FailOutcome::Conflict);
            }
            return Ok(FailOutcome::Retried {
                retry_count: task.retry_count + 1,
                retry_after,
            });
        }

        let status = if retryable {
            exhausted_status
        } else {
            TaskStatus::Failed
        };
        let rows = db::fail_task_terminal(&self.pool, id, worker_id, status, error)
            .await
            .map_err(unavailable)?;
        if rows == 0 {
            return Ok(FailOutcome::Conflict);
        }
        Ok(FailOutcome::Terminal { status })
    }
}

fn unavailable(e: anyhow::Error) -> StoreUnavailable {
    StoreUnavailable(format!("{e:#}"))
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn enqueue(&self, new_task: NewTask) -> Result<Task, StoreUnavailable> {
        db::insert_task(
            &self.pool,
            Uuid::new_v4(),
            new_task.kind,
            &new_task.required_capability,
            &new_task.fallback_capabilities,
            new_task.priority,
            &new_task.payload,
            new_task.max_retries,
        )
        .await
        .map_err(unavailable)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Task>, StoreUnavailable> {
        db::get_task(&self.pool, id).await.map_err(unavailable)
    }

    async fn next_eligible(
        &self,
        capabilities: &[String],
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreUnavailable> {
        db::next_eligible_task(&self.pool, capabilities, now)
            .await
            .map_err(unavailable)
    }

    async fn claim(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreUnavailable> {
        db::claim_task(&self.pool, id, worker_id, now)
            .await
            .map_err(unavailable)
    }

    async fn begin_processing(
        &self,
        id: Uuid,
        worker_id: &str,
    ) -> Result<MutateOutcome, StoreUnavailable> {
        let rows = db::begin_processing(&self.pool, id, worker_id)
            .await
            .map_err(unavailable)?;
        if rows > 0 {
            return Ok(MutateOutcome::Applied);
        }
        self.classify_miss(id).await
    }

    async fn complete(
        &self,
        id: Uuid,
        worker_id: &str,
        result: &[u8],
    ) -> Result<MutateOutcome, StoreUnavailable> {
        let rows = db::complete_task(&self.pool, id, worker_id, result)
            .await
            .map_err(unavailable)?;
        if rows > 0 {
            return Ok(MutateOutcome::Applied);
        }
        self.classify_miss(id).await
    }

    async fn fail(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &str,
        retryable: bool,
        retry_after: DateTime<Utc>,
    ) -> Result<FailOutcome, StoreUnavailable> {
        self.fail_with_terminal_status(id, worker_id, error, retryable, retry_after, TaskStatus::Failed)
            .await
    }

    async fn release(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &str,
        retry_after: DateTime<Utc>,
    ) -> Result<FailOutcome, StoreUnavailable> {
        // Releases are always "retryable"; exhaustion is a timeout, not a
        // worker-reported failure.
        self.fail_with_terminal_status(id, worker_id, error, true, retry_after, TaskStatus::Timeout)
            .await
    }

    async fn requeue(&self, id: Uuid, worker_id: &str) -> Result<MutateOutcome, StoreUnavailable> {
        let rows = db::requeue_task(&self.pool, id, worker_id)
            .await
            .map_err(unavailable)?;
        if rows > 0 {
            return Ok(MutateOutcome::Applied);
        }
        self.classify_miss(id).await
    }

    async fn cancel(&self, id: Uuid, reason: &str) -> Result<CancelOutcome, StoreUnavailable> {
        match db::cancel_task(&self.pool, id, reason)
            .await
            .map_err(unavailable)?
        {
            Some(prior) => Ok(CancelOutcome::Cancelled {
                prior_worker: prior.assigned_worker_id,
            }),
            None => match db::get_task(&self.pool, id).await.map_err(unavailable)? {
                None => Ok(CancelOutcome::NotFound),
                Some(_) => Ok(CancelOutcome::AlreadyTerminal),
            },
        }
    }

    async fn list(
        &self,
        filter: &TaskFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Task>, StoreUnavailable> {
        db::list_tasks(&self.pool, filter, limit, offset)
            .await
            .map_err(unavailable)
    }

    async fn count_by_status(&self) -> Result<StatusCounts, StoreUnavailable> {
        db::count_by_status(&self.pool).await.map_err(unavailable)
    }

    async fn stale_assignments(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Task>, StoreUnavailable> {
        db::stale_assignments(&self.pool, cutoff)
            .await
            .map_err(unavailable)
    }

    async fn sweep(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreUnavailable> {
        db::sweep_terminal(&self.pool, cutoff)
            .await
            .map_err(unavailable)
    }
}
