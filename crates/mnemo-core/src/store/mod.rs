//! The task repository contract.
//!
//! One contract, one production implementation ([`postgres::PgTaskStore`]).
//! All status mutations return tagged outcomes instead of errors: an
//! impossible transition is a `Conflict` or `AlreadyTerminal` result the
//! dispatcher can log and drop, never a panic or a thrown error. The only
//! error kind is `Unavailable` (the backing store itself failed).

pub mod postgres;

pub use postgres::PgTaskStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

pub use mnemo_db::queries::tasks::{StatusCounts, TaskFilter};
use mnemo_db::models::{Task, TaskKind, TaskStatus};

/// The store itself failed (connection refused, transaction aborted, ...).
/// Distinguished so admission can reject new work while the dispatcher
/// backs off.
#[derive(Debug, Error)]
#[error("task store unavailable: {0}")]
pub struct StoreUnavailable(pub String);

/// Parameters for a new task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub kind: TaskKind,
    pub required_capability: String,
    pub fallback_capabilities: Vec<String>,
    pub priority: i32,
    pub payload: Vec<u8>,
    pub max_retries: i32,
}

impl NewTask {
    /// A task with defaults: no fallbacks, priority 0, three retries.
    pub fn new(kind: TaskKind, required_capability: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            kind,
            required_capability: required_capability.into(),
            fallback_capabilities: Vec::new(),
            priority: 0,
            payload,
            max_retries: 3,
        }
    }
}

/// Outcome of an owned transition (`begin_processing`, `complete`, `requeue`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutateOutcome {
    Applied,
    /// The row exists but the guard did not match (wrong worker or wrong
    /// non-terminal status).
    Conflict,
    /// The row is already terminal; per I4 it stays untouched.
    AlreadyTerminal,
    NotFound,
}

/// Outcome of a failure or release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Re-queued for retry: the counter after increment and the instant the
    /// task becomes eligible again.
    Retried {
        retry_count: i32,
        retry_after: DateTime<Utc>,
    },
    /// Retry budget exhausted (or the error was not retryable): terminal.
    Terminal { status: TaskStatus },
    Conflict,
    AlreadyTerminal,
    NotFound,
}

/// Outcome of a cancellation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Cancelled; carries the worker that held the task, if any, so the
    /// caller can notify it.
    Cancelled { prior_worker: Option<String> },
    AlreadyTerminal,
    NotFound,
}

/// Durable task repository.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new `pending` task.
    async fn enqueue(&self, new_task: NewTask) -> Result<Task, StoreUnavailable>;

    async fn get(&self, id: Uuid) -> Result<Option<Task>, StoreUnavailable>;

    /// The next eligible pending task for the capability set, if any.
    /// Read-only; pair with [`TaskStore::claim`].
    async fn next_eligible(
        &self,
        capabilities: &[String],
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreUnavailable>;

    /// Atomically claim a pending task for a worker (`pending -> assigned`).
    /// Returns `None` when the claim raced and the row is no longer
    /// eligible; at most one concurrent caller wins a given row.
    async fn claim(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreUnavailable>;

    /// `assigned -> processing`, owner-guarded.
    async fn begin_processing(
        &self,
        id: Uuid,
        worker_id: &str,
    ) -> Result<MutateOutcome, StoreUnavailable>;

    /// Terminal success, owner-guarded.
    async fn complete(
        &self,
        id: Uuid,
        worker_id: &str,
        result: &[u8],
    ) -> Result<MutateOutcome, StoreUnavailable>;

    /// Worker-reported failure. Retryable failures below the retry budget
    /// go back to `pending` with `retry_after`; everything else is terminal
    /// `failed`.
    async fn fail(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &str,
        retryable: bool,
        retry_after: DateTime<Utc>,
    ) -> Result<FailOutcome, StoreUnavailable>;

    /// Release after session loss or a stale assignment. Accounting matches
    /// a retryable failure, except exhaustion lands on terminal `timeout`.
    async fn release(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &str,
        retry_after: DateTime<Utc>,
    ) -> Result<FailOutcome, StoreUnavailable>;

    /// Undo a claim whose assignment was never delivered:
    /// `assigned -> pending` without touching the retry counter.
    async fn requeue(&self, id: Uuid, worker_id: &str) -> Result<MutateOutcome, StoreUnavailable>;

    /// Cancel any non-terminal task: terminal `failed` with the reason.
    async fn cancel(&self, id: Uuid, reason: &str) -> Result<CancelOutcome, StoreUnavailable>;

    async fn list(
        &self,
        filter: &TaskFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Task>, StoreUnavailable>;

    async fn count_by_status(&self) -> Result<StatusCounts, StoreUnavailable>;

    /// Tasks in `assigned`/`processing` whose assignment predates the cutoff.
    async fn stale_assignments(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Task>, StoreUnavailable>;

    /// Delete terminal tasks completed before the cutoff; returns the count.
    async fn sweep(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreUnavailable>;
}
