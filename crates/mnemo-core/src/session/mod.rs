//! Broker-side worker sessions.
//!
//! One session per worker transport lifetime. After the hub's handshake
//! admits a worker, a single reactor task owns the transport: it writes
//! queued outbound frames, parses inbound frames, refreshes liveness, and
//! forwards task traffic to the dispatcher. The session handle is the
//! shared view the hub and dispatcher operate on.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::{BrokerMessage, WorkerMessage};
use crate::transport::Transport;

/// Session tuning knobs, shared by the hub and the federation client.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Expected worker heartbeat cadence.
    pub heartbeat_interval: Duration,
    /// Missed-heartbeat multiplier before the session is closed.
    pub heartbeat_miss: u32,
    /// Outbound frame queue bound; overflow closes the session.
    pub outbound_buffer: usize,
    /// How long a draining session may finish its in-flight tasks.
    pub drain_timeout: Duration,
    /// Handshake deadline (auth + register).
    pub handshake_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_miss: 3,
            outbound_buffer: 256,
            drain_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Session lifecycle state. `Authenticating` covers the handshake window
/// before the hub admits the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Authenticating,
    Running,
    Draining,
    Closed,
}

/// Events the session reactor forwards to the dispatcher.
#[derive(Debug)]
pub enum SessionEvent {
    /// A worker finished the handshake and is ready for assignments.
    Registered { worker_id: String },
    /// An inbound task-traffic frame from a running worker.
    Message {
        worker_id: String,
        message: WorkerMessage,
    },
    /// The session ended; carries the task ids it still held.
    Disconnected {
        worker_id: String,
        in_flight: Vec<Uuid>,
    },
}

/// The outbound queue rejected a frame.
#[derive(Debug, thiserror::Error)]
#[error("worker session outbound queue unavailable")]
pub struct SendRejected;

/// Shared handle to one connected worker.
pub struct WorkerSession {
    worker_id: String,
    capabilities: Vec<String>,
    capability_set: HashSet<String>,
    metadata: serde_json::Map<String, serde_json::Value>,
    connected_at: DateTime<Utc>,
    max_in_flight: usize,
    state: Mutex<SessionState>,
    last_heartbeat: Mutex<DateTime<Utc>>,
    in_flight: Mutex<HashSet<Uuid>>,
    outbound: mpsc::Sender<BrokerMessage>,
    /// Cancelling tears down the reactor (and therefore the transport).
    closer: CancellationToken,
}

impl WorkerSession {
    pub(crate) fn new(
        worker_id: String,
        capabilities: Vec<String>,
        metadata: serde_json::Map<String, serde_json::Value>,
        max_in_flight: usize,
        outbound: mpsc::Sender<BrokerMessage>,
    ) -> Arc<Self> {
        let capability_set = capabilities.iter().cloned().collect();
        Arc::new(Self {
            worker_id,
            capabilities,
            capability_set,
            metadata,
            connected_at: Utc::now(),
            max_in_flight,
            state: Mutex::new(SessionState::Running),
            last_heartbeat: Mutex::new(Utc::now()),
            in_flight: Mutex::new(HashSet::new()),
            outbound,
            closer: CancellationToken::new(),
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capability_set.contains(capability)
    }

    pub fn metadata(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.metadata
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().expect("session state lock")
    }

    pub fn is_running(&self) -> bool {
        self.state() == SessionState::Running
    }

    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        *self.last_heartbeat.lock().expect("session heartbeat lock")
    }

    pub fn touch_heartbeat(&self) {
        *self.last_heartbeat.lock().expect("session heartbeat lock") = Utc::now();
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.lock().expect("session in_flight lock").len()
    }

    pub fn in_flight_ids(&self) -> Vec<Uuid> {
        self.in_flight
            .lock()
            .expect("session in_flight lock")
            .iter()
            .copied()
            .collect()
    }

    pub fn holds_task(&self, id: Uuid) -> bool {
        self.in_flight
            .lock()
            .expect("session in_flight lock")
            .contains(&id)
    }

    /// Record an assignment. Returns false when the id was already tracked.
    pub fn track(&self, id: Uuid) -> bool {
        self.in_flight
            .lock()
            .expect("session in_flight lock")
            .insert(id)
    }

    /// Forget an assignment. Returns false when the id was not tracked.
    pub fn untrack(&self, id: Uuid) -> bool {
        self.in_flight
            .lock()
            .expect("session in_flight lock")
            .remove(&id)
    }

    /// Room for another assignment?
    pub fn has_capacity(&self) -> bool {
        self.is_running() && self.in_flight_len() < self.max_in_flight
    }

    /// Queue an outbound frame. A full queue means the worker stopped
    /// reading: the session is torn down and the frame rejected.
    pub fn try_send(&self, message: BrokerMessage) -> Result<(), SendRejected> {
        match self.outbound.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    worker_id = %self.worker_id,
                    "outbound queue overflow, dropping session"
                );
                self.closer.cancel();
                Err(SendRejected)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendRejected),
        }
    }

    /// Move to `draining`: no further assignments are offered, in-flight
    /// tasks may finish until the drain timeout. The caller decides whether
    /// a `server:shutdown` frame accompanies the transition (the hub sends
    /// one on broadcast; a worker-requested drain needs none).
    pub fn begin_drain(&self) {
        let mut state = self.state.lock().expect("session state lock");
        if matches!(*state, SessionState::Running) {
            *state = SessionState::Draining;
        }
    }

    /// Force-close the session (reactor teardown).
    pub fn close(&self) {
        self.closer.cancel();
    }

    fn set_state(&self, new: SessionState) {
        *self.state.lock().expect("session state lock") = new;
    }

    fn closed_token(&self) -> CancellationToken {
        self.closer.clone()
    }
}

impl std::fmt::Debug for WorkerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSession")
            .field("worker_id", &self.worker_id)
            .field("capabilities", &self.capabilities)
            .field("state", &self.state())
            .field("in_flight", &self.in_flight_len())
            .finish()
    }
}

/// The session reactor: owns the transport until the session dies.
///
/// Exits on transport close, protocol violation, heartbeat starvation,
/// drain completion/timeout, or an external [`WorkerSession::close`]. On
/// exit it reports `Disconnected` with whatever was still in flight.
pub(crate) async fn run_session(
    session: Arc<WorkerSession>,
    mut transport: Box<dyn Transport>,
    mut outbound_rx: mpsc::Receiver<BrokerMessage>,
    events_tx: mpsc::Sender<SessionEvent>,
    config: SessionConfig,
) {
    let worker_id = session.worker_id().to_owned();
    let closed = session.closed_token();
    let liveness_cutoff =
        chrono::Duration::from_std(config.heartbeat_interval * config.heartbeat_miss)
            .unwrap_or_else(|_| chrono::Duration::seconds(45));

    // Drain progress and liveness share one housekeeping tick.
    let mut housekeeping = tokio::time::interval(Duration::from_millis(500));
    housekeeping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut drain_deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = closed.cancelled() => {
                debug!(worker_id = %worker_id, "session close requested");
                break;
            }

            outbound = outbound_rx.recv() => {
                let Some(message) = outbound else { break };
                let frame = match serde_json::to_string(&message) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(worker_id = %worker_id, error = %e, "failed to encode frame");
                        continue;
                    }
                };
                if let Err(e) = transport.send(frame).await {
                    debug!(worker_id = %worker_id, error = %e, "transport write failed");
                    break;
                }
            }

            inbound = transport.recv() => {
                match inbound {
                    None => {
                        debug!(worker_id = %worker_id, "transport closed by peer");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(worker_id = %worker_id, error = %e, "transport read failed");
                        break;
                    }
                    Some(Ok(frame)) => {
                        session.touch_heartbeat();
                        let message = match serde_json::from_str::<WorkerMessage>(&frame) {
                            Ok(message) => message,
                            Err(e) => {
                                warn!(worker_id = %worker_id, error = %e, "unparseable frame");
                                send_error(&mut transport, "unparseable frame").await;
                                break;
                            }
                        };
                        match handle_inbound(&session, &mut transport, &events_tx, message).await {
                            InboundFlow::Continue => {}
                            InboundFlow::Close => break,
                        }
                    }
                }
            }

            _ = housekeeping.tick() => {
                let now = Utc::now();
                if session.last_heartbeat() + liveness_cutoff < now {
                    warn!(worker_id = %worker_id, "heartbeat starvation, closing session");
                    send_error(&mut transport, "heartbeat starvation").await;
                    break;
                }
                if session.state() == SessionState::Draining {
                    let deadline =
                        *drain_deadline.get_or_insert_with(|| Instant::now() + config.drain_timeout);
                    if session.in_flight_len() == 0 {
                        info!(worker_id = %worker_id, "drain complete");
                        break;
                    }
                    if Instant::now() >= deadline {
                        warn!(
                            worker_id = %worker_id,
                            remaining = session.in_flight_len(),
                            "drain timeout expired"
                        );
                        break;
                    }
                }
            }
        }
    }

    session.set_state(SessionState::Closed);
    transport.close().await;

    let in_flight = session.in_flight_ids();
    let _ = events_tx
        .send(SessionEvent::Disconnected {
            worker_id,
            in_flight,
        })
        .await;
}

enum InboundFlow {
    Continue,
    Close,
}

async fn handle_inbound(
    session: &Arc<WorkerSession>,
    transport: &mut Box<dyn Transport>,
    events_tx: &mpsc::Sender<SessionEvent>,
    message: WorkerMessage,
) -> InboundFlow {
    match &message {
        // Handshake frames are illegal once the session is running.
        WorkerMessage::Auth { .. } | WorkerMessage::Register { .. } => {
            warn!(worker_id = %session.worker_id(), "handshake frame after registration");
            send_error(transport, "unexpected handshake frame").await;
            return InboundFlow::Close;
        }
        WorkerMessage::Heartbeat { .. } => {
            // Ack directly; the dispatcher still sees the frame for
            // processing-state bookkeeping.
            let ack = serde_json::to_string(&BrokerMessage::HeartbeatAck)
                .expect("heartbeat ack serializes");
            if transport.send(ack).await.is_err() {
                return InboundFlow::Close;
            }
        }
        WorkerMessage::Shutdown { reason } => {
            info!(worker_id = %session.worker_id(), reason = %reason, "worker requested shutdown");
            session.begin_drain();
        }
        WorkerMessage::TaskProgress { .. }
        | WorkerMessage::TaskComplete { .. }
        | WorkerMessage::TaskError { .. } => {}
    }

    let forwarded = events_tx
        .send(SessionEvent::Message {
            worker_id: session.worker_id().to_owned(),
            message,
        })
        .await;
    if forwarded.is_err() {
        // Dispatcher is gone; the broker is shutting down.
        return InboundFlow::Close;
    }
    InboundFlow::Continue
}

async fn send_error(transport: &mut Box<dyn Transport>, message: &str) {
    let frame = BrokerMessage::Error {
        message: message.to_owned(),
    };
    if let Ok(frame) = serde_json::to_string(&frame) {
        let _ = transport.send(frame).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_respects_state_and_limit() {
        let (tx, _rx) = mpsc::channel(4);
        let session = WorkerSession::new(
            "worker-a".into(),
            vec!["observation".into()],
            serde_json::Map::new(),
            2,
            tx,
        );
        assert!(session.has_capacity());
        session.track(Uuid::new_v4());
        assert!(session.has_capacity());
        session.track(Uuid::new_v4());
        assert!(!session.has_capacity());

        session.untrack(session.in_flight_ids()[0]);
        assert!(session.has_capacity());
        session.begin_drain();
        assert!(!session.has_capacity());
        assert_eq!(session.state(), SessionState::Draining);
    }

    #[test]
    fn track_untrack_are_set_semantics() {
        let (tx, _rx) = mpsc::channel(4);
        let session = WorkerSession::new(
            "worker-b".into(),
            vec!["embedding".into()],
            serde_json::Map::new(),
            4,
            tx,
        );
        let id = Uuid::new_v4();
        assert!(session.track(id));
        assert!(!session.track(id));
        assert!(session.holds_task(id));
        assert!(session.untrack(id));
        assert!(!session.untrack(id));
    }

    #[test]
    fn outbound_overflow_rejects_and_closes() {
        let (tx, _rx) = mpsc::channel(1);
        let session = WorkerSession::new(
            "worker-c".into(),
            vec!["observation".into()],
            serde_json::Map::new(),
            4,
            tx,
        );
        assert!(session.try_send(BrokerMessage::HeartbeatAck).is_ok());
        assert!(session.try_send(BrokerMessage::HeartbeatAck).is_err());
        assert!(session.closed_token().is_cancelled());
    }
}
