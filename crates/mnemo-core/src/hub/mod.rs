//! The worker hub: the set of live worker sessions.
//!
//! Owns admission (handshake, auth, quotas), the worker-id-keyed session
//! table, and worker selection for the dispatcher. All membership changes
//! and picks take one mutex briefly; session I/O happens in the per-session
//! reactors, never under the lock.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::{EventBus, channels};
use crate::protocol::{BrokerMessage, WorkerMessage};
use crate::session::{
    SessionConfig, SessionEvent, SessionState, WorkerSession, run_session,
};
use crate::transport::Transport;

/// Hub-level limits and auth.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Upper bound on concurrently connected sessions.
    pub max_workers: usize,
    /// Upper bound on in-flight assignments per session.
    pub per_worker_concurrency: usize,
    /// Shared secret workers must present; `None` disables auth.
    pub auth_token: Option<String>,
    pub session: SessionConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_workers: 256,
            per_worker_concurrency: 4,
            auth_token: None,
            session: SessionConfig::default(),
        }
    }
}

/// Counts reported by [`WorkerHub::stats`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct HubStats {
    pub running: usize,
    pub draining: usize,
    pub total_in_flight: usize,
    /// Running-session count per capability.
    pub by_capability: HashMap<String, usize>,
}

struct HubInner {
    sessions: HashMap<String, Arc<WorkerSession>>,
    /// Round-robin cursor per capability.
    rr: HashMap<String, usize>,
}

/// The session table.
pub struct WorkerHub {
    inner: Mutex<HubInner>,
    config: HubConfig,
    bus: Arc<EventBus>,
    events_tx: mpsc::Sender<SessionEvent>,
}

impl WorkerHub {
    pub fn new(
        config: HubConfig,
        bus: Arc<EventBus>,
        events_tx: mpsc::Sender<SessionEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HubInner {
                sessions: HashMap::new(),
                rr: HashMap::new(),
            }),
            config,
            bus,
            events_tx,
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Run the handshake on a fresh transport and, on success, admit the
    /// session and spawn its reactor.
    ///
    /// Handshake: `connection:pending` → (`auth` if a token is configured)
    /// → `register{capabilities, metadata}` → `registered{worker_id}`.
    pub async fn accept(self: &Arc<Self>, mut transport: Box<dyn Transport>) -> Result<Arc<WorkerSession>> {
        match self.handshake(&mut transport).await {
            Ok(session) => Ok(session),
            Err(e) => {
                transport.close().await;
                Err(e)
            }
        }
    }

    async fn handshake(
        self: &Arc<Self>,
        transport: &mut Box<dyn Transport>,
    ) -> Result<Arc<WorkerSession>> {
        let deadline = self.config.session.handshake_timeout;

        send_frame(transport, &BrokerMessage::ConnectionPending).await?;

        let mut first = recv_frame(transport, deadline)
            .await
            .context("worker hung up during handshake")?;

        if let Some(expected) = &self.config.auth_token {
            let WorkerMessage::Auth { token } = first else {
                send_frame(
                    transport,
                    &BrokerMessage::AuthFailed {
                        reason: "auth required".into(),
                    },
                )
                .await?;
                bail!("worker skipped auth");
            };
            if &token != expected {
                send_frame(
                    transport,
                    &BrokerMessage::AuthFailed {
                        reason: "invalid token".into(),
                    },
                )
                .await?;
                bail!("worker presented an invalid token");
            }
            send_frame(transport, &BrokerMessage::AuthSuccess).await?;
            first = recv_frame(transport, deadline)
                .await
                .context("worker hung up after auth")?;
        } else if matches!(first, WorkerMessage::Auth { .. }) {
            // No auth configured; accept the frame and move on.
            send_frame(transport, &BrokerMessage::AuthSuccess).await?;
            first = recv_frame(transport, deadline)
                .await
                .context("worker hung up after auth")?;
        }

        let WorkerMessage::Register {
            capabilities,
            metadata,
        } = first
        else {
            send_frame(
                transport,
                &BrokerMessage::Error {
                    message: "expected register".into(),
                },
            )
            .await?;
            bail!("worker sent an out-of-order frame during handshake");
        };

        if capabilities.is_empty() {
            send_frame(
                transport,
                &BrokerMessage::Error {
                    message: "register requires at least one capability".into(),
                },
            )
            .await?;
            bail!("worker registered with no capabilities");
        }

        let worker_id = format!("worker-{}", Uuid::new_v4().simple());
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.session.outbound_buffer);
        let session = WorkerSession::new(
            worker_id.clone(),
            capabilities.clone(),
            metadata,
            self.config.per_worker_concurrency,
            outbound_tx,
        );

        let limit_reached = {
            let mut inner = self.inner.lock().expect("hub lock poisoned");
            if inner.sessions.len() >= self.config.max_workers {
                true
            } else {
                inner.sessions.insert(worker_id.clone(), Arc::clone(&session));
                false
            }
        };
        if limit_reached {
            send_frame(
                transport,
                &BrokerMessage::Error {
                    message: "worker limit reached".into(),
                },
            )
            .await?;
            bail!("worker limit reached ({})", self.config.max_workers);
        }

        send_frame(transport, &BrokerMessage::Registered {
            worker_id: worker_id.clone(),
        })
        .await?;

        info!(
            worker_id = %worker_id,
            capabilities = ?capabilities,
            "worker registered"
        );
        self.bus.publish(
            channels::WORKER_CONNECTED,
            serde_json::json!({
                "worker_id": worker_id,
                "capabilities": capabilities,
            }),
        );

        let reactor_session = Arc::clone(&session);
        let reactor_transport = std::mem::replace(
            transport,
            Box::new(ClosedTransport) as Box<dyn Transport>,
        );
        let events_tx = self.events_tx.clone();
        let session_config = self.config.session.clone();
        tokio::spawn(run_session(
            reactor_session,
            reactor_transport,
            outbound_rx,
            events_tx,
            session_config,
        ));

        // Nudge the dispatcher so waiting work is assigned right away.
        let _ = self.events_tx.try_send(SessionEvent::Registered {
            worker_id: worker_id.clone(),
        });

        Ok(session)
    }

    pub fn get(&self, worker_id: &str) -> Option<Arc<WorkerSession>> {
        self.inner
            .lock()
            .expect("hub lock poisoned")
            .sessions
            .get(worker_id)
            .cloned()
    }

    /// Remove a session from the table (it keeps running until its reactor
    /// exits; removal only stops new assignments and lookups).
    pub fn remove(&self, worker_id: &str) -> Option<Arc<WorkerSession>> {
        let removed = self
            .inner
            .lock()
            .expect("hub lock poisoned")
            .sessions
            .remove(worker_id);
        if removed.is_some() {
            debug!(worker_id = %worker_id, "session removed from hub");
        }
        removed
    }

    pub fn worker_count(&self) -> usize {
        self.inner.lock().expect("hub lock poisoned").sessions.len()
    }

    /// Pick a session for an assignment, trying each wanted capability in
    /// order. Only running sessions with spare capacity are eligible;
    /// among them, a per-capability round-robin cursor distributes load.
    /// Returns the session together with the capability that matched.
    pub fn pick(&self, wanted: &[&str]) -> Option<(Arc<WorkerSession>, String)> {
        let mut inner = self.inner.lock().expect("hub lock poisoned");
        for capability in wanted {
            let mut eligible: Vec<Arc<WorkerSession>> = inner
                .sessions
                .values()
                .filter(|s| s.has_capability(capability) && s.has_capacity())
                .cloned()
                .collect();
            if eligible.is_empty() {
                continue;
            }
            // Stable order so the cursor actually rotates.
            eligible.sort_by(|a, b| a.worker_id().cmp(b.worker_id()));
            let cursor = inner.rr.entry((*capability).to_owned()).or_insert(0);
            let chosen = Arc::clone(&eligible[*cursor % eligible.len()]);
            *cursor = cursor.wrapping_add(1);
            return Some((chosen, (*capability).to_owned()));
        }
        None
    }

    /// Union of capabilities across running sessions with spare capacity.
    /// This is the dispatcher's eligibility set.
    pub fn available_capabilities(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("hub lock poisoned");
        let mut caps = BTreeSet::new();
        for session in inner.sessions.values() {
            if session.has_capacity() {
                caps.extend(session.capabilities().iter().cloned());
            }
        }
        caps.into_iter().collect()
    }

    /// Union of capabilities across all running sessions, regardless of
    /// momentary capacity. This is what federation advertises upstream.
    pub fn capability_union(&self) -> BTreeSet<String> {
        let inner = self.inner.lock().expect("hub lock poisoned");
        let mut caps = BTreeSet::new();
        for session in inner.sessions.values() {
            if session.is_running() {
                caps.extend(session.capabilities().iter().cloned());
            }
        }
        caps
    }

    /// Move every session to `draining`.
    pub fn broadcast_shutdown(&self) {
        let sessions: Vec<Arc<WorkerSession>> = self
            .inner
            .lock()
            .expect("hub lock poisoned")
            .sessions
            .values()
            .cloned()
            .collect();
        info!(count = sessions.len(), "broadcasting shutdown to workers");
        for session in sessions {
            if session.is_running() {
                let _ = session.try_send(BrokerMessage::ServerShutdown);
            }
            session.begin_drain();
        }
    }

    pub fn stats(&self) -> HubStats {
        let inner = self.inner.lock().expect("hub lock poisoned");
        let mut stats = HubStats::default();
        for session in inner.sessions.values() {
            match session.state() {
                SessionState::Running => stats.running += 1,
                SessionState::Draining => stats.draining += 1,
                SessionState::Authenticating | SessionState::Closed => {}
            }
            stats.total_in_flight += session.in_flight_len();
            if session.is_running() {
                for capability in session.capabilities() {
                    *stats.by_capability.entry(capability.clone()).or_insert(0) += 1;
                }
            }
        }
        stats
    }

    /// Snapshot of all sessions, for the workers API.
    pub fn sessions(&self) -> Vec<Arc<WorkerSession>> {
        self.inner
            .lock()
            .expect("hub lock poisoned")
            .sessions
            .values()
            .cloned()
            .collect()
    }
}

/// Placeholder left behind once a transport moves into a reactor.
struct ClosedTransport;

#[async_trait::async_trait]
impl Transport for ClosedTransport {
    async fn send(&mut self, _frame: String) -> Result<(), crate::transport::TransportError> {
        Err(crate::transport::TransportError::Closed)
    }

    async fn recv(&mut self) -> Option<Result<String, crate::transport::TransportError>> {
        None
    }

    async fn close(&mut self) {}
}

async fn send_frame(transport: &mut Box<dyn Transport>, message: &BrokerMessage) -> Result<()> {
    let frame = serde_json::to_string(message).context("failed to encode handshake frame")?;
    transport
        .send(frame)
        .await
        .context("failed to send handshake frame")?;
    Ok(())
}

async fn recv_frame(
    transport: &mut Box<dyn Transport>,
    deadline: std::time::Duration,
) -> Result<WorkerMessage> {
    let frame = timeout(deadline, transport.recv())
        .await
        .context("handshake timed out")?
        .context("transport closed during handshake")?
        .map_err(|e| anyhow::anyhow!("transport error during handshake: {e}"))?;
    let message =
        serde_json::from_str::<WorkerMessage>(&frame).context("unparseable handshake frame")?;
    warn_if_task_frame(&message);
    Ok(message)
}

fn warn_if_task_frame(message: &WorkerMessage) {
    if matches!(
        message,
        WorkerMessage::TaskProgress { .. }
            | WorkerMessage::TaskComplete { .. }
            | WorkerMessage::TaskError { .. }
    ) {
        warn!("task frame received during handshake");
    }
}
