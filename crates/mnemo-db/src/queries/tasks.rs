//! Database query functions for the `tasks` table.
//!
//! Every status mutation is a guarded UPDATE whose WHERE clause pins the
//! expected current state (status, owning worker, retry counter), so a
//! transition is applied at most once no matter how many callers race.
//! `rows_affected == 0` means the guard did not match.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Task, TaskKind, TaskStatus};

/// Insert a new pending task. Returns the inserted row with
/// server-generated defaults (`created_at`, `retry_count = 0`).
#[allow(clippy::too_many_arguments)]
pub async fn insert_task(
    pool: &PgPool,
    id: Uuid,
    kind: TaskKind,
    required_capability: &str,
    fallback_capabilities: &[String],
    priority: i32,
    payload: &[u8],
    max_retries: i32,
) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (id, kind, required_capability, fallback_capabilities, priority, payload, max_retries) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         RETURNING *",
    )
    .bind(id)
    .bind(kind)
    .bind(required_capability)
    .bind(fallback_capabilities)
    .bind(priority)
    .bind(payload)
    .bind(max_retries)
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

// -----------------------------------------------------------------------
// Eligibility and claiming
// -----------------------------------------------------------------------

/// Return the next eligible pending task for the given capability set, or
/// `None`. Eligible means: `pending`, past its `retry_after` (if any), and
/// matching the capabilities through either the primary key or a fallback.
/// Tie-break: `priority DESC, created_at ASC`.
///
/// Read-only; pair with [`claim_task`] which re-checks the guard.
pub async fn next_eligible_task(
    pool: &PgPool,
    capabilities: &[String],
    now: DateTime<Utc>,
) -> Result<Option<Task>> {
    if capabilities.is_empty() {
        return Ok(None);
    }

    let task = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE status = 'pending' \
           AND (retry_after IS NULL OR retry_after <= $2) \
           AND (required_capability = ANY($1) OR fallback_capabilities && $1) \
         ORDER BY priority DESC, created_at ASC \
         LIMIT 1",
    )
    .bind(capabilities)
    .bind(now)
    .fetch_optional(pool)
    .await
    .context("failed to scan for eligible task")?;

    Ok(task)
}

/// Atomically claim a specific pending task for a worker:
/// `pending -> assigned`, recording the owner and `assigned_at`.
///
/// The guard re-checks status and retry-eligibility, so concurrent claims
/// of the same row succeed for exactly one caller. Returns the updated row,
/// or `None` when the guard did not match (raced or no longer eligible).
pub async fn claim_task(
    pool: &PgPool,
    id: Uuid,
    worker_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET status = 'assigned', assigned_worker_id = $2, assigned_at = $3 \
         WHERE id = $1 \
           AND status = 'pending' \
           AND (retry_after IS NULL OR retry_after <= $3) \
         RETURNING *",
    )
    .bind(id)
    .bind(worker_id)
    .bind(now)
    .fetch_optional(pool)
    .await
    .context("failed to claim task")?;

    Ok(task)
}

// -----------------------------------------------------------------------
// Owned transitions
// -----------------------------------------------------------------------

/// Transition `assigned -> processing` for the owning worker.
/// Returns the number of rows affected (0 = guard mismatch).
pub async fn begin_processing(pool: &PgPool, id: Uuid, worker_id: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'processing' \
         WHERE id = $1 AND status = 'assigned' AND assigned_worker_id = $2",
    )
    .bind(id)
    .bind(worker_id)
    .execute(pool)
    .await
    .context("failed to begin processing")?;

    Ok(result.rows_affected())
}

/// Terminal success: store the result, clear the owner, set `completed_at`.
pub async fn complete_task(
    pool: &PgPool,
    id: Uuid,
    worker_id: &str,
    result_bytes: &[u8],
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'completed', result = $3, error = NULL, \
             assigned_worker_id = NULL, completed_at = NOW() \
         WHERE id = $1 \
           AND status IN ('assigned', 'processing') \
           AND assigned_worker_id = $2",
    )
    .bind(id)
    .bind(worker_id)
    .bind(result_bytes)
    .execute(pool)
    .await
    .context("failed to complete task")?;

    Ok(result.rows_affected())
}

/// Retryable failure: back to `pending`, increment the retry counter, clear
/// the owner, and schedule `retry_after`. Uses optimistic locking on the
/// current retry counter so a race never double-increments.
pub async fn fail_task_retry(
    pool: &PgPool,
    id: Uuid,
    worker_id: &str,
    current_retry_count: i32,
    retry_after: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'pending', retry_count = retry_count + 1, \
             assigned_worker_id = NULL, assigned_at = NULL, \
             error = NULL, retry_after = $4 \
         WHERE id = $1 \
           AND status IN ('assigned', 'processing') \
           AND assigned_worker_id = $2 \
           AND retry_count = $3",
    )
    .bind(id)
    .bind(worker_id)
    .bind(current_retry_count)
    .bind(retry_after)
    .execute(pool)
    .await
    .context("failed to requeue task for retry")?;

    Ok(result.rows_affected())
}

/// Terminal failure for the owning worker. `status` must be `failed` or
/// `timeout`.
pub async fn fail_task_terminal(
    pool: &PgPool,
    id: Uuid,
    worker_id: &str,
    status: TaskStatus,
    error: &str,
) -> Result<u64> {
    debug_assert!(matches!(status, TaskStatus::Failed | TaskStatus::Timeout));

    let result = sqlx::query(
        "UPDATE tasks \
         SET status = $3, error = $4, \
             assigned_worker_id = NULL, completed_at = NOW() \
         WHERE id = $1 \
           AND status IN ('assigned', 'processing') \
           AND assigned_worker_id = $2",
    )
    .bind(id)
    .bind(worker_id)
    .bind(status)
    .bind(error)
    .execute(pool)
    .await
    .context("failed to fail task")?;

    Ok(result.rows_affected())
}

/// Undo a claim that was never delivered: `assigned -> pending` for the
/// owning worker, without touching the retry counter or `retry_after`.
pub async fn requeue_task(pool: &PgPool, id: Uuid, worker_id: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'pending', assigned_worker_id = NULL, assigned_at = NULL \
         WHERE id = $1 AND status = 'assigned' AND assigned_worker_id = $2",
    )
    .bind(id)
    .bind(worker_id)
    .execute(pool)
    .await
    .context("failed to requeue task")?;

    Ok(result.rows_affected())
}

/// Cancel any non-terminal task: terminal `failed` with the given reason.
/// Returns the previous row when the cancel applied (so the caller can see
/// which worker, if any, held the task), `None` when no non-terminal row
/// matched.
pub async fn cancel_task(pool: &PgPool, id: Uuid, reason: &str) -> Result<Option<Task>> {
    // RETURNING yields the updated row; the prior owner is captured inside
    // the CTE before the UPDATE clears it.
    let task = sqlx::query_as::<_, Task>(
        "WITH prior AS ( \
             SELECT id, assigned_worker_id FROM tasks \
             WHERE id = $1 AND status IN ('pending', 'assigned', 'processing') \
             FOR UPDATE \
         ) \
         UPDATE tasks t \
         SET status = 'failed', error = $2, \
             assigned_worker_id = NULL, completed_at = NOW() \
         FROM prior \
         WHERE t.id = prior.id \
         RETURNING t.id, t.kind, t.status, t.required_capability, \
                   t.fallback_capabilities, t.priority, t.payload, t.result, \
                   t.error, t.retry_count, t.max_retries, \
                   prior.assigned_worker_id, t.retry_after, t.created_at, \
                   t.assigned_at, t.completed_at",
    )
    .bind(id)
    .bind(reason)
    .fetch_optional(pool)
    .await
    .context("failed to cancel task")?;

    Ok(task)
}

// -----------------------------------------------------------------------
// Observation
// -----------------------------------------------------------------------

/// Counts of tasks per status.
#[derive(Debug, Clone, Default)]
pub struct StatusCounts {
    pub pending: i64,
    pub assigned: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub timeout: i64,
    pub total: i64,
}

/// Count tasks grouped by status.
pub async fn count_by_status(pool: &PgPool) -> Result<StatusCounts> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status::text, COUNT(*) as cnt FROM tasks GROUP BY status")
            .fetch_all(pool)
            .await
            .context("failed to count tasks by status")?;

    let mut counts = StatusCounts::default();
    for (status, count) in &rows {
        match status.as_str() {
            "pending" => counts.pending = *count,
            "assigned" => counts.assigned = *count,
            "processing" => counts.processing = *count,
            "completed" => counts.completed = *count,
            "failed" => counts.failed = *count,
            "timeout" => counts.timeout = *count,
            _ => {}
        }
        counts.total += count;
    }
    Ok(counts)
}

/// Filters for [`list_tasks`]. `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub kind: Option<TaskKind>,
}

/// List tasks, newest first, with optional status/kind filters and paging.
pub async fn list_tasks(
    pool: &PgPool,
    filter: &TaskFilter,
    limit: i64,
    offset: i64,
) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE ($1::text IS NULL OR status = $1) \
           AND ($2::text IS NULL OR kind = $2) \
         ORDER BY created_at DESC \
         LIMIT $3 OFFSET $4",
    )
    .bind(filter.status.map(|s| s.to_string()))
    .bind(filter.kind.map(|k| k.to_string()))
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
    .context("failed to list tasks")?;

    Ok(tasks)
}

/// Tasks stuck in `assigned` or `processing` whose assignment is older than
/// the cutoff. The reaper releases these when their worker is gone.
pub async fn stale_assignments(pool: &PgPool, cutoff: DateTime<Utc>) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE status IN ('assigned', 'processing') AND assigned_at < $1 \
         ORDER BY assigned_at ASC",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .context("failed to scan stale assignments")?;

    Ok(tasks)
}

/// Delete terminal tasks completed before the cutoff. Returns the number of
/// rows removed.
pub async fn sweep_terminal(pool: &PgPool, cutoff: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM tasks \
         WHERE status IN ('completed', 'failed', 'timeout') AND completed_at < $1",
    )
    .bind(cutoff)
    .execute(pool)
    .await
    .context("failed to sweep terminal tasks")?;

    Ok(result.rows_affected())
}
