//! The `mnemo serve` command: run the broker.
//!
//! Wires the Postgres store, worker hub, dispatcher, event bus, and the
//! optional federation client, then serves the HTTP surface:
//!
//! - `GET  /ws/worker`            worker WebSocket endpoint
//! - `GET  /events`               SSE event stream (`?patterns=task:*,...`)
//! - `POST /api/tasks`            enqueue
//! - `GET  /api/tasks`            list (`?status=&kind=&limit=&offset=`)
//! - `GET  /api/tasks/{id}`       inspect
//! - `POST /api/tasks/{id}/cancel`
//! - `GET  /api/stats`            task counts + hub stats
//! - `GET  /api/workers`          connected sessions
//! - `GET  /healthz`, `GET /readyz`

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderName, StatusCode, header};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, mpsc};
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

use mnemo_core::broker::{Broker, CancelResult, EnqueueError};
use mnemo_core::dispatcher::Dispatcher;
use mnemo_core::events::EventBus;
use mnemo_core::federation::FederationClient;
use mnemo_core::health::Readiness;
use mnemo_core::hub::{HubStats, WorkerHub};
use mnemo_core::session::SessionState;
use mnemo_core::store::{NewTask, PgTaskStore, TaskFilter, TaskStore};
use mnemo_core::transport::WsTransport;
use mnemo_db::models::{Task, TaskKind, TaskStatus};
use mnemo_db::pool;

use crate::config::MnemoConfig;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: msg.into(),
        }
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: msg.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

impl From<mnemo_core::store::StoreUnavailable> for AppError {
    fn from(e: mnemo_core::store::StoreUnavailable) -> Self {
        Self::unavailable(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

/// API view of a task row; byte fields travel hex-encoded, like the wire.
#[derive(Debug, Serialize)]
pub struct TaskView {
    pub id: Uuid,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub required_capability: String,
    pub fallback_capabilities: Vec<String>,
    pub priority: i32,
    pub payload: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_worker_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<Task> for TaskView {
    fn from(t: Task) -> Self {
        Self {
            id: t.id,
            kind: t.kind,
            status: t.status,
            required_capability: t.required_capability,
            fallback_capabilities: t.fallback_capabilities,
            priority: t.priority,
            payload: hex::encode(&t.payload),
            result: t.result.map(hex::encode),
            error: t.error,
            retry_count: t.retry_count,
            max_retries: t.max_retries,
            assigned_worker_id: t.assigned_worker_id,
            retry_after: t.retry_after,
            created_at: t.created_at,
            assigned_at: t.assigned_at,
            completed_at: t.completed_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WorkerView {
    pub worker_id: String,
    pub capabilities: Vec<String>,
    pub state: String,
    pub in_flight: usize,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub tasks: TaskCountsView,
    pub workers: HubStats,
}

#[derive(Debug, Serialize)]
pub struct TaskCountsView {
    pub pending: i64,
    pub assigned: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub timeout: i64,
    pub total: i64,
}

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub kind: TaskKind,
    /// Defaults to the kind name (the abstract capability).
    pub required_capability: Option<String>,
    #[serde(default)]
    pub fallback_capabilities: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    /// Hex-encoded opaque payload bytes.
    pub payload: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
}

fn default_max_retries() -> i32 {
    3
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub status: Option<TaskStatus>,
    pub kind: Option<TaskKind>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    /// Comma-separated subscription patterns; defaults to `*`.
    pub patterns: Option<String>,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct AppState {
    broker: Arc<Broker>,
    hub: Arc<WorkerHub>,
    bus: Arc<EventBus>,
    readiness: Arc<Readiness>,
    /// A stream write blocked past this closes the endpoint.
    stream_write_timeout: Duration,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run the broker until ctrl-c.
pub async fn run(config: MnemoConfig) -> Result<()> {
    let pg_pool = pool::create_pool(&config.db_config).await?;
    pool::run_migrations(&pg_pool, pool::default_migrations_path()).await?;

    let readiness = Readiness::new();
    let bus = EventBus::new(config.event_bus_inbox);
    let (events_tx, events_rx) = mpsc::channel(1024);
    let hub = WorkerHub::new(config.hub.clone(), Arc::clone(&bus), events_tx);
    let store: Arc<dyn TaskStore> = Arc::new(PgTaskStore::new(pg_pool.clone()));
    readiness.set_store_open(true);

    let wakeup = Arc::new(Notify::new());
    let broker = Broker::new(
        Arc::clone(&store),
        Arc::clone(&hub),
        Arc::clone(&bus),
        Arc::clone(&readiness),
        Arc::clone(&wakeup),
    );

    let cancel = CancellationToken::new();
    let dispatcher = Dispatcher::new(
        Arc::clone(&store),
        Arc::clone(&hub),
        Arc::clone(&bus),
        config.retry.clone(),
        config.dispatcher.clone(),
        Arc::clone(&wakeup),
        Arc::clone(&readiness),
    );
    let dispatcher_handle = tokio::spawn(dispatcher.run(events_rx, cancel.clone()));

    let federation_handle = config.federation.clone().map(|federation_config| {
        info!(upstream = %federation_config.upstream_url, "federation enabled");
        let client = FederationClient::new(
            Arc::clone(&broker),
            config.retry.clone(),
            federation_config,
        );
        tokio::spawn(client.run(cancel.clone()))
    });

    let state = AppState {
        broker,
        hub: Arc::clone(&hub),
        bus,
        readiness: Arc::clone(&readiness),
        stream_write_timeout: config.stream_write_timeout,
    };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/ws/worker", get(worker_ws))
        .route("/events", get(events_stream))
        .route("/api/tasks", post(enqueue_task).get(list_tasks))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/cancel", post(cancel_task))
        .route("/api/stats", get(stats))
        .route("/api/workers", get(workers))
        .with_state(state)
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    readiness.set_hub_listening(true);
    info!(addr = %config.bind_addr, "mnemo broker listening");

    let drain_hub = Arc::clone(&hub);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received, draining workers");
            drain_hub.broadcast_shutdown();
        })
        .await
        .context("server failed")?;

    // Worker sockets have drained (or timed out) once serve returns; stop
    // the background tasks.
    readiness.set_hub_listening(false);
    cancel.cancel();
    let _ = dispatcher_handle.await;
    if let Some(handle) = federation_handle {
        let _ = handle.await;
    }
    readiness.set_store_open(false);
    pg_pool.close().await;
    info!("broker stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Probes
// ---------------------------------------------------------------------------

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.readiness.report())
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.readiness.report();
    let status = if report.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

// ---------------------------------------------------------------------------
// Worker endpoint
// ---------------------------------------------------------------------------

async fn worker_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let transport = Box::new(WsTransport::new(socket));
        if let Err(e) = state.hub.accept(transport).await {
            warn!(error = %format!("{e:#}"), "worker handshake rejected");
        }
    })
}

// ---------------------------------------------------------------------------
// Event stream
// ---------------------------------------------------------------------------

async fn events_stream(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    let patterns: Vec<String> = query
        .patterns
        .as_deref()
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .filter(|patterns: &Vec<String>| !patterns.is_empty())
        .unwrap_or_else(|| vec!["*".to_owned()]);

    let mut subscription = state.bus.subscribe(patterns);
    let client_id = Uuid::new_v4();
    let write_timeout = state.stream_write_timeout;

    // Write-through with a bound: the forwarder hands frames to the
    // response over a one-slot channel, so it stalls exactly when the HTTP
    // stack has stopped writing. A handoff blocked past the write timeout
    // closes the endpoint, and dropping the subscription detaches it from
    // the bus.
    let (frames_tx, frames_rx) = mpsc::channel::<SseEvent>(1);
    tokio::spawn(async move {
        let hello = serde_json::json!({
            "channel": "connected",
            "payload": { "client_id": client_id },
            "timestamp": Utc::now(),
        });
        let hello = SseEvent::default().data(hello.to_string());
        if !forward_frame(&frames_tx, hello, write_timeout, client_id).await {
            return;
        }

        while let Some(event) = subscription.recv().await {
            let frame = match serde_json::to_string(&event) {
                Ok(data) => SseEvent::default().data(data),
                Err(e) => {
                    warn!(error = %e, channel = %event.channel, "unserializable event");
                    continue;
                }
            };
            if !forward_frame(&frames_tx, frame, write_timeout, client_id).await {
                return;
            }
        }
        // Subscription closed; the stream ends and the client reconnects.
    });

    let stream = ReceiverStream::new(frames_rx).map(Ok::<_, Infallible>);
    let sse = Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text("keepalive"),
    );

    // Intermediaries must not buffer the stream.
    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        sse,
    )
}

/// Hand one frame to the response stream, bounded by the write timeout.
/// Returns false when the endpoint is done: the client disconnected, or it
/// stopped reading and the frame could not be written through in time.
async fn forward_frame(
    frames_tx: &mpsc::Sender<SseEvent>,
    frame: SseEvent,
    write_timeout: Duration,
    client_id: Uuid,
) -> bool {
    match timeout(write_timeout, frames_tx.send(frame)).await {
        Ok(Ok(())) => true,
        // Receiver gone: the client hung up.
        Ok(Err(_)) => false,
        Err(_) => {
            warn!(client_id = %client_id, "event stream write blocked, closing endpoint");
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Task API
// ---------------------------------------------------------------------------

async fn enqueue_task(
    State(state): State<AppState>,
    Json(request): Json<EnqueueRequest>,
) -> Result<impl IntoResponse, AppError> {
    let payload = hex::decode(&request.payload)
        .map_err(|e| AppError::bad_request(format!("payload is not valid hex: {e}")))?;
    if request.max_retries < 0 {
        return Err(AppError::bad_request("max_retries must be non-negative"));
    }

    let required_capability = request
        .required_capability
        .unwrap_or_else(|| request.kind.to_string());

    let new_task = NewTask {
        kind: request.kind,
        required_capability,
        fallback_capabilities: request.fallback_capabilities,
        priority: request.priority,
        payload,
        max_retries: request.max_retries,
    };

    let task = state.broker.enqueue(new_task).await.map_err(|e| match e {
        EnqueueError::Unavailable(msg) => AppError::unavailable(msg),
    })?;

    Ok((StatusCode::ACCEPTED, Json(TaskView::from(task))))
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskView>, AppError> {
    let task = state
        .broker
        .get(id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("task {id} not found")))?;
    Ok(Json(TaskView::from(task)))
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<TaskView>>, AppError> {
    let filter = TaskFilter {
        status: query.status,
        kind: query.kind,
    };
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    let offset = query.offset.unwrap_or(0).max(0);
    let tasks = state.broker.list(&filter, limit, offset).await?;
    Ok(Json(tasks.into_iter().map(TaskView::from).collect()))
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<CancelRequest>>,
) -> Result<impl IntoResponse, AppError> {
    let reason = body
        .and_then(|Json(request)| request.reason)
        .unwrap_or_else(|| "cancelled by operator".to_owned());

    match state.broker.cancel(id, &reason).await? {
        CancelResult::Cancelled => Ok(Json(serde_json::json!({ "cancelled": id }))),
        CancelResult::NotFound => Err(AppError::not_found(format!("task {id} not found"))),
        CancelResult::AlreadyTerminal => {
            Err(AppError::conflict(format!("task {id} is already terminal")))
        }
    }
}

async fn stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, AppError> {
    let counts = state.broker.count_by_status().await?;
    Ok(Json(StatsResponse {
        tasks: TaskCountsView {
            pending: counts.pending,
            assigned: counts.assigned,
            processing: counts.processing,
            completed: counts.completed,
            failed: counts.failed,
            timeout: counts.timeout,
            total: counts.total,
        },
        workers: state.hub.stats(),
    }))
}

async fn workers(State(state): State<AppState>) -> Json<Vec<WorkerView>> {
    let views = state
        .hub
        .sessions()
        .into_iter()
        .map(|session| WorkerView {
            worker_id: session.worker_id().to_owned(),
            capabilities: session.capabilities().to_vec(),
            state: match session.state() {
                SessionState::Authenticating => "authenticating",
                SessionState::Running => "running",
                SessionState::Draining => "draining",
                SessionState::Closed => "closed",
            }
            .to_owned(),
            in_flight: session.in_flight_len(),
            connected_at: session.connected_at(),
            last_heartbeat: session.last_heartbeat(),
        })
        .collect();
    Json(views)
}
