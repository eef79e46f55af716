//! Federation test: a scripted upstream broker over a real WebSocket, a
//! local broker with one worker, and the federation client bridging the
//! two.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use mnemo_core::broker::Broker;
use mnemo_core::dispatcher::{Dispatcher, DispatcherConfig};
use mnemo_core::events::EventBus;
use mnemo_core::federation::{FederationClient, FederationConfig};
use mnemo_core::health::Readiness;
use mnemo_core::hub::{HubConfig, WorkerHub};
use mnemo_core::protocol::{BrokerMessage, TaskAssignment, WorkerMessage};
use mnemo_core::retry::{BackoffParams, RetryPolicy};
use mnemo_core::store::{PgTaskStore, TaskStore};
use mnemo_core::transport::{Transport, duplex};
use mnemo_db::models::TaskKind;
use mnemo_test_utils::{create_test_db, drop_test_db};

const WAIT: Duration = Duration::from_secs(10);

fn fast_retry() -> RetryPolicy {
    let mut policy = RetryPolicy::default();
    for kind in TaskKind::ALL {
        policy = policy.with_override(kind, BackoffParams {
            base_ms: 30,
            max_ms: 200,
            multiplier: 2.0,
            jitter: 0.0,
        });
    }
    policy
}

async fn upstream_send(ws: &mut WebSocketStream<TcpStream>, message: &BrokerMessage) {
    let frame = serde_json::to_string(message).expect("encode");
    ws.send(WsMessage::Text(frame.into())).await.expect("send");
}

/// Receive the next worker frame, skipping heartbeats.
async fn upstream_recv(ws: &mut WebSocketStream<TcpStream>) -> WorkerMessage {
    timeout(WAIT, async {
        loop {
            let frame = ws.next().await.expect("open").expect("ok");
            if let WsMessage::Text(text) = frame {
                let message: WorkerMessage = serde_json::from_str(&text).expect("decode");
                if matches!(message, WorkerMessage::Heartbeat { .. }) {
                    continue;
                }
                return message;
            }
        }
    })
    .await
    .expect("no upstream frame")
}

#[tokio::test]
async fn upstream_assignment_is_bridged_and_result_relayed() {
    let (pool, db_name) = create_test_db().await;

    // Local broker wiring.
    let readiness = Readiness::new();
    let bus = EventBus::new(256);
    let (events_tx, events_rx) = mpsc::channel(256);
    let hub = WorkerHub::new(HubConfig::default(), Arc::clone(&bus), events_tx);
    let store: Arc<dyn TaskStore> = Arc::new(PgTaskStore::new(pool));
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
        fast_retry(),
        DispatcherConfig {
            tick_interval: Duration::from_millis(50),
            ..DispatcherConfig::default()
        },
        Arc::clone(&wakeup),
        readiness,
    );
    let dispatcher_handle = tokio::spawn(dispatcher.run(events_rx, cancel.clone()));

    // A local worker so the hub has something to advertise.
    let (mut worker, server) = duplex(64);
    let accept_hub = Arc::clone(&hub);
    let accept = tokio::spawn(async move { accept_hub.accept(Box::new(server)).await });
    let frame = timeout(WAIT, worker.recv()).await.unwrap().unwrap().unwrap();
    assert!(frame.contains("connection:pending"));
    worker
        .send(
            serde_json::to_string(&WorkerMessage::Register {
                capabilities: vec!["observation".into()],
                metadata: serde_json::Map::new(),
            })
            .unwrap(),
        )
        .await
        .unwrap();
    let frame = timeout(WAIT, worker.recv()).await.unwrap().unwrap().unwrap();
    assert!(frame.contains("registered"));
    accept.await.unwrap().expect("local worker handshake");

    // Scripted upstream broker.
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let upstream_addr = listener.local_addr().expect("addr");
    let upstream_task = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = tokio_tungstenite::accept_async(stream).await.expect("ws");

        upstream_send(&mut ws, &BrokerMessage::ConnectionPending).await;
        let registered = upstream_recv(&mut ws).await;
        let WorkerMessage::Register {
            capabilities,
            metadata,
        } = registered
        else {
            panic!("expected register, got {registered:?}");
        };
        assert_eq!(capabilities, vec!["observation".to_owned()]);
        assert_eq!(metadata.get("federation"), Some(&serde_json::Value::Bool(true)));
        upstream_send(&mut ws, &BrokerMessage::Registered {
            worker_id: "satellite-1".into(),
        })
        .await;

        // Hand down one assignment.
        let upstream_task_id = Uuid::new_v4();
        upstream_send(&mut ws, &BrokerMessage::TaskAssign {
            task: TaskAssignment {
                task_id: upstream_task_id,
                kind: TaskKind::Observation,
                required_capability: "observation".into(),
                fallback_capabilities: vec![],
                matched_capability: "observation".into(),
                priority: 0,
                payload: b"fed-payload".to_vec(),
                retry_count: 0,
                max_retries: 3,
                created_at: chrono::Utc::now(),
            },
        })
        .await;

        // Expect the relayed completion.
        let completed = upstream_recv(&mut ws).await;
        match completed {
            WorkerMessage::TaskComplete {
                task_id, result, ..
            } => {
                assert_eq!(task_id, upstream_task_id);
                assert_eq!(result, b"fed-result".to_vec());
            }
            other => panic!("expected task:complete, got {other:?}"),
        }
    });

    // Federation client under test.
    let federation = FederationClient::new(
        Arc::clone(&broker),
        fast_retry(),
        FederationConfig::new(format!("ws://{upstream_addr}/ws/worker")),
    );
    let federation_cancel = CancellationToken::new();
    let federation_handle = tokio::spawn(federation.run(federation_cancel.clone()));

    // The bridged assignment reaches the local worker.
    let assignment: TaskAssignment = timeout(WAIT, async {
        loop {
            let frame = worker.recv().await.expect("open").expect("ok");
            let message: BrokerMessage = serde_json::from_str(&frame).expect("decode");
            if let BrokerMessage::TaskAssign { task } = message {
                return task;
            }
        }
    })
    .await
    .expect("no bridged assignment");
    assert_eq!(assignment.payload, b"fed-payload");
    // Bridged tasks carry no local retry budget.
    assert_eq!(assignment.max_retries, 0);

    // Local worker completes; the upstream assertion closes the loop.
    worker
        .send(
            serde_json::to_string(&WorkerMessage::TaskComplete {
                task_id: assignment.task_id,
                result: b"fed-result".to_vec(),
                elapsed_ms: 7,
            })
            .unwrap(),
        )
        .await
        .unwrap();

    timeout(WAIT, upstream_task)
        .await
        .expect("upstream script timed out")
        .expect("upstream script panicked");

    federation_cancel.cancel();
    let _ = federation_handle.await;
    cancel.cancel();
    let _ = dispatcher_handle.await;
    drop_test_db(&db_name).await;
}

/// The federation client needs tokio-tungstenite's client handshake; make
/// sure a refused upstream only produces backoff, not a crash.
#[tokio::test]
async fn unreachable_upstream_backs_off_quietly() {
    let (pool, db_name) = create_test_db().await;

    let readiness = Readiness::new();
    let bus = EventBus::new(64);
    let (events_tx, _events_rx) = mpsc::channel(64);
    let hub = WorkerHub::new(HubConfig::default(), Arc::clone(&bus), events_tx);
    let store: Arc<dyn TaskStore> = Arc::new(PgTaskStore::new(pool));
    readiness.set_store_open(true);
    let wakeup = Arc::new(Notify::new());
    let broker = Broker::new(store, hub, bus, readiness, wakeup);

    let federation = FederationClient::new(
        broker,
        fast_retry(),
        // Port 9 (discard) is not listening.
        FederationConfig::new("ws://127.0.0.1:9/ws/worker"),
    );
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(federation.run(cancel.clone()));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!handle.is_finished(), "client must keep retrying");

    cancel.cancel();
    timeout(WAIT, handle)
        .await
        .expect("client did not stop on cancel")
        .expect("client panicked");

    drop_test_db(&db_name).await;
}
