//! Federation: this broker acting as a worker toward an upstream broker.
//!
//! The client dials the upstream hub over WebSocket and runs the same
//! handshake a worker would, advertising the union of capabilities of the
//! locally connected workers. Upstream assignments are bridged into the
//! local queue (upstream id mapped to a local id) and terminal outcomes are
//! relayed back. On disconnect it backs off with the `vector-sync` retry
//! curve; when the local capability union changes it reconnects so the
//! upstream sees a fresh register.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use futures::{SinkExt, StreamExt};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use mnemo_db::models::TaskKind;

use crate::broker::Broker;
use crate::events::channels;
use crate::protocol::{BrokerMessage, WorkerMessage};
use crate::retry::RetryPolicy;
use crate::store::NewTask;

type Upstream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Federation settings.
#[derive(Debug, Clone)]
pub struct FederationConfig {
    /// Upstream hub endpoint, e.g. `ws://broker.example:8750/ws/worker`.
    pub upstream_url: String,
    /// Token for the upstream's worker auth, if it requires one.
    pub auth_token: Option<String>,
    pub heartbeat_interval: Duration,
}

impl FederationConfig {
    pub fn new(upstream_url: impl Into<String>) -> Self {
        Self {
            upstream_url: upstream_url.into(),
            auth_token: None,
            heartbeat_interval: Duration::from_secs(15),
        }
    }
}

/// Why one upstream session ended.
enum ExitReason {
    /// Local shutdown; do not reconnect.
    Shutdown,
    /// Local capability union changed; reconnect immediately with a fresh
    /// register.
    CapabilityChange,
    /// The upstream went away; reconnect with backoff.
    UpstreamClosed,
}

pub struct FederationClient {
    broker: Arc<Broker>,
    retry: RetryPolicy,
    config: FederationConfig,
}

impl FederationClient {
    pub fn new(broker: Arc<Broker>, retry: RetryPolicy, config: FederationConfig) -> Self {
        Self {
            broker,
            retry,
            config,
        }
    }

    /// Reconnect loop. Runs until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut rng = StdRng::from_os_rng();
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return;
            }

            match self.connect_and_serve(&cancel).await {
                Ok(ExitReason::Shutdown) => return,
                Ok(ExitReason::CapabilityChange) => {
                    info!("local capability set changed, re-registering upstream");
                    attempt = 0;
                    continue;
                }
                Ok(ExitReason::UpstreamClosed) => {
                    warn!("upstream closed the federation session");
                }
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "federation session failed");
                }
            }

            let backoff = self
                .retry
                .backoff(TaskKind::VectorSync, attempt.min(16), &mut rng);
            attempt = attempt.saturating_add(1);
            debug!(delay_ms = backoff.as_millis() as u64, "federation reconnect backoff");
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = cancel.cancelled() => return,
            }
        }
    }

    async fn connect_and_serve(&self, cancel: &CancellationToken) -> Result<ExitReason> {
        let advertised = self.broker.hub().capability_union();
        if advertised.is_empty() {
            bail!("no local workers connected, nothing to advertise");
        }

        let (mut upstream, _) = connect_async(self.config.upstream_url.as_str())
            .await
            .with_context(|| format!("failed to dial upstream {}", self.config.upstream_url))?;

        self.handshake(&mut upstream, &advertised).await?;
        info!(
            upstream = %self.config.upstream_url,
            capabilities = advertised.len(),
            "federated with upstream broker"
        );

        // Watch local task outcomes and worker churn while serving.
        let mut events = self
            .broker
            .bus()
            .subscribe(vec!["task:*".into(), "worker:*".into()]);

        // local task id -> upstream task id
        let mut bridged: HashMap<Uuid, Uuid> = HashMap::new();
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = send_msg(&mut upstream, &WorkerMessage::Shutdown {
                        reason: "hub shutting down".into(),
                    })
                    .await;
                    let _ = upstream.close(None).await;
                    return Ok(ExitReason::Shutdown);
                }

                frame = upstream.next() => {
                    let Some(frame) = frame else {
                        return Ok(ExitReason::UpstreamClosed);
                    };
                    let text = match frame.context("upstream read failed")? {
                        WsMessage::Text(text) => text,
                        WsMessage::Close(_) => return Ok(ExitReason::UpstreamClosed),
                        _ => continue,
                    };
                    let message: BrokerMessage = serde_json::from_str(&text)
                        .context("unparseable upstream frame")?;
                    match self.handle_upstream(&mut upstream, message, &mut bridged).await? {
                        Some(reason) => return Ok(reason),
                        None => {}
                    }
                }

                event = events.recv() => {
                    let Some(event) = event else {
                        return Ok(ExitReason::Shutdown);
                    };
                    if let Some(reason) = self
                        .handle_local_event(&mut upstream, &event, &advertised, &mut bridged)
                        .await?
                    {
                        return Ok(reason);
                    }
                }

                _ = heartbeat.tick() => {
                    let in_flight: Vec<Uuid> = bridged.values().copied().collect();
                    send_msg(&mut upstream, &WorkerMessage::Heartbeat { in_flight }).await?;
                }
            }
        }
    }

    async fn handshake(&self, upstream: &mut Upstream, advertised: &BTreeSet<String>) -> Result<()> {
        match recv_msg(upstream).await? {
            BrokerMessage::ConnectionPending => {}
            other => bail!("expected connection:pending, got {other:?}"),
        }

        if let Some(token) = &self.config.auth_token {
            send_msg(upstream, &WorkerMessage::Auth {
                token: token.clone(),
            })
            .await?;
            match recv_msg(upstream).await? {
                BrokerMessage::AuthSuccess => {}
                BrokerMessage::AuthFailed { reason } => {
                    bail!("upstream rejected auth: {reason}")
                }
                other => bail!("expected auth result, got {other:?}"),
            }
        }

        let mut metadata = serde_json::Map::new();
        metadata.insert("federation".into(), serde_json::Value::Bool(true));
        metadata.insert(
            "local_workers".into(),
            serde_json::Value::from(self.broker.hub().worker_count()),
        );
        send_msg(upstream, &WorkerMessage::Register {
            capabilities: advertised.iter().cloned().collect(),
            metadata,
        })
        .await?;

        match recv_msg(upstream).await? {
            BrokerMessage::Registered { worker_id } => {
                debug!(upstream_worker_id = %worker_id, "registered with upstream");
                Ok(())
            }
            BrokerMessage::AuthFailed { reason } => bail!("upstream rejected auth: {reason}"),
            other => bail!("expected registered, got {other:?}"),
        }
    }

    async fn handle_upstream(
        &self,
        upstream: &mut Upstream,
        message: BrokerMessage,
        bridged: &mut HashMap<Uuid, Uuid>,
    ) -> Result<Option<ExitReason>> {
        match message {
            BrokerMessage::TaskAssign { task } => {
                // Bridge with a zero local retry budget: the upstream owns
                // retry accounting, so any local failure reports upstream
                // immediately.
                let new_task = NewTask {
                    kind: task.kind,
                    required_capability: task.required_capability.clone(),
                    fallback_capabilities: task.fallback_capabilities.clone(),
                    priority: task.priority,
                    payload: task.payload.clone(),
                    max_retries: 0,
                };
                match self.broker.enqueue(new_task).await {
                    Ok(local) => {
                        debug!(
                            upstream_task = %task.task_id,
                            local_task = %local.id,
                            "bridged upstream assignment"
                        );
                        bridged.insert(local.id, task.task_id);
                    }
                    Err(e) => {
                        warn!(upstream_task = %task.task_id, error = %e, "bridge enqueue failed");
                        send_msg(upstream, &WorkerMessage::TaskError {
                            task_id: task.task_id,
                            error: format!("satellite enqueue failed: {e}"),
                            retryable: true,
                        })
                        .await?;
                    }
                }
            }
            BrokerMessage::TaskCancel { task_id, reason } => {
                let local = bridged
                    .iter()
                    .find(|(_, up)| **up == task_id)
                    .map(|(local, _)| *local);
                if let Some(local) = local {
                    bridged.remove(&local);
                    let reason = reason.unwrap_or_else(|| "cancelled upstream".into());
                    if let Err(e) = self.broker.cancel(local, &reason).await {
                        warn!(task_id = %local, error = %e, "bridged cancel failed");
                    }
                }
            }
            BrokerMessage::ServerShutdown => return Ok(Some(ExitReason::UpstreamClosed)),
            BrokerMessage::Error { message } => {
                warn!(message = %message, "error frame from upstream");
            }
            BrokerMessage::HeartbeatAck
            | BrokerMessage::ConnectionPending
            | BrokerMessage::AuthSuccess
            | BrokerMessage::Registered { .. } => {}
            BrokerMessage::AuthFailed { reason } => {
                bail!("upstream revoked auth: {reason}")
            }
        }
        Ok(None)
    }

    async fn handle_local_event(
        &self,
        upstream: &mut Upstream,
        event: &crate::events::Event,
        advertised: &BTreeSet<String>,
        bridged: &mut HashMap<Uuid, Uuid>,
    ) -> Result<Option<ExitReason>> {
        match event.channel.as_str() {
            channels::WORKER_CONNECTED | channels::WORKER_DISCONNECTED => {
                let current = self.broker.hub().capability_union();
                if current != *advertised {
                    return Ok(Some(ExitReason::CapabilityChange));
                }
            }

            channels::TASK_PROGRESS => {
                let Some(local_id) = event_task_id(event) else {
                    return Ok(None);
                };
                let Some(upstream_id) = bridged.get(&local_id).copied() else {
                    return Ok(None);
                };
                let fraction = event
                    .payload
                    .get("fraction")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.0);
                let note = event
                    .payload
                    .get("note")
                    .and_then(|v| v.as_str())
                    .map(str::to_owned);
                send_msg(upstream, &WorkerMessage::TaskProgress {
                    task_id: upstream_id,
                    fraction,
                    note,
                })
                .await?;
            }

            channels::TASK_COMPLETED => {
                let Some(local_id) = event_task_id(event) else {
                    return Ok(None);
                };
                let Some(upstream_id) = bridged.remove(&local_id) else {
                    return Ok(None);
                };
                let task = self.broker.get(local_id).await.ok().flatten();
                let (result, elapsed_ms) = match task {
                    Some(t) => {
                        let elapsed = match (t.assigned_at, t.completed_at) {
                            (Some(a), Some(c)) => (c - a).num_milliseconds().max(0) as u64,
                            _ => 0,
                        };
                        (t.result.unwrap_or_default(), elapsed)
                    }
                    None => (Vec::new(), 0),
                };
                send_msg(upstream, &WorkerMessage::TaskComplete {
                    task_id: upstream_id,
                    result,
                    elapsed_ms,
                })
                .await?;
            }

            channels::TASK_FAILED | channels::TASK_CANCELLED => {
                let Some(local_id) = event_task_id(event) else {
                    return Ok(None);
                };
                let Some(upstream_id) = bridged.remove(&local_id) else {
                    return Ok(None);
                };
                let error = event
                    .payload
                    .get("error")
                    .or_else(|| event.payload.get("reason"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("task failed")
                    .to_owned();
                let retryable = event
                    .payload
                    .get("retryable")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                send_msg(upstream, &WorkerMessage::TaskError {
                    task_id: upstream_id,
                    error,
                    retryable,
                })
                .await?;
            }

            _ => {}
        }
        Ok(None)
    }
}

fn event_task_id(event: &crate::events::Event) -> Option<Uuid> {
    event
        .payload
        .get("task_id")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
}

async fn send_msg(upstream: &mut Upstream, message: &WorkerMessage) -> Result<()> {
    let frame = serde_json::to_string(message).context("failed to encode frame")?;
    upstream
        .send(WsMessage::Text(frame.into()))
        .await
        .context("upstream write failed")?;
    Ok(())
}

async fn recv_msg(upstream: &mut Upstream) -> Result<BrokerMessage> {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(10), upstream.next())
            .await
            .context("upstream handshake timed out")?
            .context("upstream closed during handshake")?
            .context("upstream read failed")?;
        match frame {
            WsMessage::Text(text) => {
                return serde_json::from_str(&text).context("unparseable upstream frame");
            }
            WsMessage::Close(_) => bail!("upstream closed during handshake"),
            _ => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_task_id_parses_uuid_payloads() {
        let id = Uuid::new_v4();
        let event = crate::events::Event {
            channel: "task:completed".into(),
            payload: json!({ "task_id": id }),
            timestamp: chrono::Utc::now(),
            seq: 0,
        };
        assert_eq!(event_task_id(&event), Some(id));

        let event = crate::events::Event {
            channel: "task:completed".into(),
            payload: json!({ "task_id": "not-a-uuid" }),
            timestamp: chrono::Utc::now(),
            seq: 1,
        };
        assert_eq!(event_task_id(&event), None);
    }
}
