//! The dispatcher: joins the task store, the worker hub, and the event bus.
//!
//! A single reactor wakes on session traffic, enqueue notifications, and a
//! tick timer; it claims eligible tasks for capable workers, applies
//! completion and failure transitions, releases work lost to dead sessions,
//! and sweeps terminal rows past retention. The dispatcher never propagates
//! errors to callers: every failure becomes a state transition, a log line,
//! or a drop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::{EventBus, channels};
use crate::health::Readiness;
use crate::hub::WorkerHub;
use crate::protocol::{BrokerMessage, TaskAssignment, WorkerMessage};
use crate::retry::RetryPolicy;
use crate::session::SessionEvent;
use crate::store::{FailOutcome, MutateOutcome, TaskStore};

/// Dispatcher timing knobs.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Fallback wakeup when no event arrives.
    pub tick_interval: Duration,
    /// Cadence of the stale-assignment reaper.
    pub reaper_interval: Duration,
    /// Age after which an `assigned`/`processing` row without a live owner
    /// is released.
    pub stale_assigned: Duration,
    /// Cadence of the terminal-retention sweeper.
    pub sweep_interval: Duration,
    /// How long terminal rows are kept.
    pub retention: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(250),
            reaper_interval: Duration::from_secs(10),
            stale_assigned: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(3600),
            retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

pub struct Dispatcher {
    store: Arc<dyn TaskStore>,
    hub: Arc<WorkerHub>,
    bus: Arc<EventBus>,
    retry: RetryPolicy,
    config: DispatcherConfig,
    /// Signalled by the broker facade on enqueue.
    wakeup: Arc<Notify>,
    readiness: Arc<Readiness>,
    rng: StdRng,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn TaskStore>,
        hub: Arc<WorkerHub>,
        bus: Arc<EventBus>,
        retry: RetryPolicy,
        config: DispatcherConfig,
        wakeup: Arc<Notify>,
        readiness: Arc<Readiness>,
    ) -> Self {
        Self {
            store,
            hub,
            bus,
            retry,
            config,
            wakeup,
            readiness,
            rng: StdRng::from_os_rng(),
        }
    }

    /// Run until cancelled. Consumes the session event stream produced by
    /// the hub's reactors.
    pub async fn run(
        mut self,
        mut events_rx: mpsc::Receiver<SessionEvent>,
        cancel: CancellationToken,
    ) {
        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut reap = tokio::time::interval(self.config.reaper_interval);
        reap.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        self.readiness.set_dispatcher_running(true);
        info!("dispatcher running");

        let wakeup = Arc::clone(&self.wakeup);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                event = events_rx.recv() => {
                    match event {
                        Some(event) => {
                            self.handle_session_event(event).await;
                            self.assign_ready().await;
                        }
                        // All hub senders dropped; nothing left to dispatch for.
                        None => break,
                    }
                }

                _ = wakeup.notified() => self.assign_ready().await,

                _ = tick.tick() => self.assign_ready().await,

                _ = reap.tick() => self.reap_stale().await,

                _ = sweep.tick() => self.sweep_terminal().await,
            }
        }

        self.readiness.set_dispatcher_running(false);
        info!("dispatcher stopped");
    }

    // -------------------------------------------------------------------
    // Assignment
    // -------------------------------------------------------------------

    /// Claim-and-assign until either no task is eligible or no worker has
    /// capacity. Claims are per-task and guarded, so concurrent brokers on
    /// the same database never double-assign (I6').
    async fn assign_ready(&mut self) {
        loop {
            let capabilities = self.hub.available_capabilities();
            if capabilities.is_empty() {
                return;
            }

            let now = Utc::now();
            let task = match self.store.next_eligible(&capabilities, now).await {
                Ok(Some(task)) => task,
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "eligibility scan failed");
                    return;
                }
            };

            let wanted = task.capability_preference();
            let Some((session, matched_capability)) = self.hub.pick(&wanted) else {
                // The capable worker vanished between the scan and the pick;
                // the task stays pending and the next wakeup retries.
                debug!(task_id = %task.id, "no capable session, deferring");
                return;
            };

            let claimed = match self.store.claim(task.id, session.worker_id(), now).await {
                Ok(Some(claimed)) => claimed,
                Ok(None) => {
                    // Lost the claim race; rescan.
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, task_id = %task.id, "claim failed");
                    return;
                }
            };

            let assignment = TaskAssignment::from_task(&claimed, &matched_capability);
            if session
                .try_send(BrokerMessage::TaskAssign { task: assignment })
                .is_err()
            {
                // Never delivered: put it back untouched (no retry penalty).
                match self.store.requeue(claimed.id, session.worker_id()).await {
                    Ok(MutateOutcome::Applied) => {}
                    Ok(outcome) => {
                        warn!(task_id = %claimed.id, ?outcome, "requeue after send failure")
                    }
                    Err(e) => warn!(task_id = %claimed.id, error = %e, "requeue failed"),
                }
                continue;
            }

            session.track(claimed.id);
            debug!(
                task_id = %claimed.id,
                worker_id = %session.worker_id(),
                capability = %matched_capability,
                "task assigned"
            );
            self.bus.publish(
                channels::TASK_ASSIGNED,
                serde_json::json!({
                    "task_id": claimed.id,
                    "worker_id": session.worker_id(),
                    "kind": claimed.kind,
                    "capability": matched_capability,
                }),
            );
        }
    }

    // -------------------------------------------------------------------
    // Session traffic
    // -------------------------------------------------------------------

    async fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Registered { worker_id } => {
                debug!(worker_id = %worker_id, "worker ready for assignments");
            }
            SessionEvent::Message { worker_id, message } => {
                self.handle_worker_message(&worker_id, message).await
            }
            SessionEvent::Disconnected {
                worker_id,
                in_flight,
            } => self.handle_disconnect(&worker_id, in_flight).await,
        }
    }

    async fn handle_worker_message(&mut self, worker_id: &str, message: WorkerMessage) {
        match message {
            WorkerMessage::Heartbeat { in_flight } => {
                // A heartbeat naming an assigned task is the worker's first
                // acknowledgement that it picked the task up.
                for task_id in in_flight {
                    self.mark_processing(task_id, worker_id).await;
                }
            }

            WorkerMessage::TaskProgress {
                task_id,
                fraction,
                note,
            } => {
                self.mark_processing(task_id, worker_id).await;
                self.bus.publish(
                    channels::TASK_PROGRESS,
                    serde_json::json!({
                        "task_id": task_id,
                        "worker_id": worker_id,
                        "fraction": fraction,
                        "note": note,
                    }),
                );
            }

            WorkerMessage::TaskComplete {
                task_id,
                result,
                elapsed_ms,
            } => {
                match self.store.complete(task_id, worker_id, &result).await {
                    Ok(MutateOutcome::Applied) => {
                        self.untrack(worker_id, task_id);
                        self.bus.publish(
                            channels::TASK_COMPLETED,
                            serde_json::json!({
                                "task_id": task_id,
                                "worker_id": worker_id,
                                "elapsed_ms": elapsed_ms,
                            }),
                        );
                    }
                    // Late completion after cancel or a duplicate report:
                    // the terminal status stands (I4).
                    Ok(MutateOutcome::AlreadyTerminal) => {
                        self.untrack(worker_id, task_id);
                        debug!(task_id = %task_id, worker_id = %worker_id, "late completion ignored");
                    }
                    Ok(MutateOutcome::Conflict) => {
                        warn!(task_id = %task_id, worker_id = %worker_id, "completion from non-owner");
                    }
                    Ok(MutateOutcome::NotFound) => {
                        warn!(task_id = %task_id, worker_id = %worker_id, "completion for unknown task");
                    }
                    Err(e) => warn!(task_id = %task_id, error = %e, "completion failed"),
                }
            }

            WorkerMessage::TaskError {
                task_id,
                error,
                retryable,
            } => {
                self.fail_task(task_id, worker_id, &error, retryable).await;
            }

            WorkerMessage::Shutdown { reason } => {
                info!(worker_id = %worker_id, reason = %reason, "worker draining");
            }

            // Handshake frames never reach the dispatcher.
            WorkerMessage::Auth { .. } | WorkerMessage::Register { .. } => {
                debug!(worker_id = %worker_id, "ignoring handshake frame");
            }
        }
    }

    async fn handle_disconnect(&mut self, worker_id: &str, in_flight: Vec<Uuid>) {
        self.hub.remove(worker_id);
        info!(
            worker_id = %worker_id,
            abandoned = in_flight.len(),
            "worker disconnected"
        );

        for task_id in in_flight {
            self.release_task(task_id, worker_id, "worker disconnected")
                .await;
        }

        self.bus.publish(
            channels::WORKER_DISCONNECTED,
            serde_json::json!({ "worker_id": worker_id }),
        );
    }

    async fn mark_processing(&mut self, task_id: Uuid, worker_id: &str) {
        match self.store.begin_processing(task_id, worker_id).await {
            // Repeat signals and late frames are expected; only real store
            // failures are worth a log line.
            Ok(_) => {}
            Err(e) => warn!(task_id = %task_id, error = %e, "begin_processing failed"),
        }
    }

    /// Apply a worker-reported failure, scheduling a retry when eligible.
    async fn fail_task(&mut self, task_id: Uuid, worker_id: &str, error: &str, retryable: bool) {
        let task = match self.store.get(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                warn!(task_id = %task_id, "failure report for unknown task");
                return;
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "failure lookup failed");
                return;
            }
        };

        let backoff = self
            .retry
            .backoff(task.kind, task.retry_count as u32, &mut self.rng);
        let retry_after = Utc::now() + chrono::Duration::from_std(backoff).unwrap_or_default();

        match self
            .store
            .fail(task_id, worker_id, error, retryable, retry_after)
            .await
        {
            Ok(outcome) => {
                self.untrack(worker_id, task_id);
                self.publish_fail_outcome(task_id, error, retryable, outcome);
            }
            Err(e) => warn!(task_id = %task_id, error = %e, "failure transition failed"),
        }
    }

    /// Release a task whose owner is gone (disconnect or reaper). Counts as
    /// a retry attempt; exhaustion lands on terminal `timeout`.
    async fn release_task(&mut self, task_id: Uuid, worker_id: &str, error: &str) {
        let task = match self.store.get(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => return,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "release lookup failed");
                return;
            }
        };
        if task.status.is_terminal() {
            return;
        }

        let backoff = self
            .retry
            .backoff(task.kind, task.retry_count as u32, &mut self.rng);
        let retry_after = Utc::now() + chrono::Duration::from_std(backoff).unwrap_or_default();

        match self.store.release(task_id, worker_id, error, retry_after).await {
            Ok(outcome) => self.publish_fail_outcome(task_id, error, true, outcome),
            Err(e) => warn!(task_id = %task_id, error = %e, "release failed"),
        }
    }

    fn publish_fail_outcome(
        &self,
        task_id: Uuid,
        error: &str,
        retryable: bool,
        outcome: FailOutcome,
    ) {
        match outcome {
            FailOutcome::Retried {
                retry_count,
                retry_after,
            } => {
                self.bus.publish(
                    channels::TASK_QUEUED,
                    serde_json::json!({
                        "task_id": task_id,
                        "retry_count": retry_count,
                        "retry_after": retry_after,
                        "error": error,
                    }),
                );
            }
            FailOutcome::Terminal { status } => {
                self.bus.publish(
                    channels::TASK_FAILED,
                    serde_json::json!({
                        "task_id": task_id,
                        "status": status,
                        "error": error,
                        "retryable": retryable,
                    }),
                );
            }
            FailOutcome::Conflict => {
                warn!(task_id = %task_id, "failure transition raced, dropped");
            }
            FailOutcome::AlreadyTerminal => {
                debug!(task_id = %task_id, "failure for terminal task ignored");
            }
            FailOutcome::NotFound => {
                warn!(task_id = %task_id, "failure for unknown task");
            }
        }
    }

    fn untrack(&self, worker_id: &str, task_id: Uuid) {
        if let Some(session) = self.hub.get(worker_id) {
            session.untrack(task_id);
        }
    }

    // -------------------------------------------------------------------
    // Background maintenance
    // -------------------------------------------------------------------

    /// Release `assigned`/`processing` rows older than the stale threshold
    /// whose owner is no longer in the hub (crash between claim and
    /// delivery, lost disconnect events, broker restart).
    async fn reap_stale(&mut self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.stale_assigned).unwrap_or_default();
        let stale = match self.store.stale_assignments(cutoff).await {
            Ok(stale) => stale,
            Err(e) => {
                warn!(error = %e, "stale scan failed");
                return;
            }
        };

        for task in stale {
            let Some(owner) = task.assigned_worker_id.clone() else {
                continue;
            };
            // A live session that still tracks the task keeps it.
            if let Some(session) = self.hub.get(&owner) {
                if session.holds_task(task.id) {
                    continue;
                }
            }
            info!(task_id = %task.id, worker_id = %owner, "reaping stale assignment");
            self.release_task(task.id, &owner, "assignment became stale")
                .await;
        }
    }

    /// Delete terminal rows past retention.
    async fn sweep_terminal(&mut self) {
        let cutoff =
            Utc::now() - chrono::Duration::from_std(self.config.retention).unwrap_or_default();
        match self.store.sweep(cutoff).await {
            Ok(0) => {}
            Ok(n) => info!(swept = n, "terminal tasks swept"),
            Err(e) => warn!(error = %e, "sweep failed"),
        }
    }
}
