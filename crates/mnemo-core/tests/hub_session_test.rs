//! Hub admission and session lifecycle tests over in-memory transports:
//! auth flows, quotas, round-robin pick, drain, and liveness.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

use mnemo_core::events::EventBus;
use mnemo_core::hub::{HubConfig, WorkerHub};
use mnemo_core::protocol::{BrokerMessage, WorkerMessage};
use mnemo_core::session::{SessionConfig, SessionEvent, SessionState, WorkerSession};
use mnemo_core::transport::{ChannelTransport, Transport, duplex};

const WAIT: Duration = Duration::from_secs(5);

struct TestHub {
    hub: Arc<WorkerHub>,
    events_rx: mpsc::Receiver<SessionEvent>,
}

fn test_hub(config: HubConfig) -> TestHub {
    let bus = EventBus::new(64);
    let (events_tx, events_rx) = mpsc::channel(64);
    let hub = WorkerHub::new(config, bus, events_tx);
    TestHub { hub, events_rx }
}

async fn send(transport: &mut ChannelTransport, message: &WorkerMessage) {
    let frame = serde_json::to_string(message).expect("encode");
    transport.send(frame).await.expect("send");
}

async fn recv(transport: &mut ChannelTransport) -> BrokerMessage {
    let frame = timeout(WAIT, transport.recv())
        .await
        .expect("no frame")
        .expect("open")
        .expect("ok");
    serde_json::from_str(&frame).expect("decode")
}

/// Drive the worker side of a successful handshake.
async fn register(
    hub: &Arc<WorkerHub>,
    capabilities: &[&str],
    token: Option<&str>,
) -> (ChannelTransport, Arc<WorkerSession>) {
    let (mut client, server) = duplex(64);
    let hub = Arc::clone(hub);
    let accept = tokio::spawn(async move { hub.accept(Box::new(server)).await });

    assert!(matches!(recv(&mut client).await, BrokerMessage::ConnectionPending));
    if let Some(token) = token {
        send(&mut client, &WorkerMessage::Auth {
            token: token.to_owned(),
        })
        .await;
        assert!(matches!(recv(&mut client).await, BrokerMessage::AuthSuccess));
    }
    send(&mut client, &WorkerMessage::Register {
        capabilities: capabilities.iter().map(|s| s.to_string()).collect(),
        metadata: serde_json::Map::new(),
    })
    .await;
    assert!(matches!(recv(&mut client).await, BrokerMessage::Registered { .. }));

    let session = accept.await.expect("join").expect("handshake");
    (client, session)
}

// ===========================================================================
// Handshake & admission
// ===========================================================================

#[tokio::test]
async fn register_without_auth_when_no_token_configured() {
    let harness = test_hub(HubConfig::default());
    let (_client, session) = register(&harness.hub, &["observation"], None).await;

    assert_eq!(session.state(), SessionState::Running);
    assert_eq!(session.capabilities(), &["observation".to_owned()]);
    assert_eq!(harness.hub.worker_count(), 1);
    assert!(harness.hub.get(session.worker_id()).is_some());
}

#[tokio::test]
async fn auth_required_and_validated() {
    let config = HubConfig {
        auth_token: Some("s3cret".into()),
        ..HubConfig::default()
    };
    let harness = test_hub(config);

    // Wrong token: auth:failed, not admitted.
    let (mut client, server) = duplex(64);
    let hub = Arc::clone(&harness.hub);
    let accept = tokio::spawn(async move { hub.accept(Box::new(server)).await });
    assert!(matches!(recv(&mut client).await, BrokerMessage::ConnectionPending));
    send(&mut client, &WorkerMessage::Auth {
        token: "wrong".into(),
    })
    .await;
    match recv(&mut client).await {
        BrokerMessage::AuthFailed { reason } => assert_eq!(reason, "invalid token"),
        other => panic!("expected auth:failed, got {other:?}"),
    }
    assert!(accept.await.expect("join").is_err());
    assert_eq!(harness.hub.worker_count(), 0);

    // Skipping auth entirely is also rejected.
    let (mut client, server) = duplex(64);
    let hub = Arc::clone(&harness.hub);
    let accept = tokio::spawn(async move { hub.accept(Box::new(server)).await });
    assert!(matches!(recv(&mut client).await, BrokerMessage::ConnectionPending));
    send(&mut client, &WorkerMessage::Register {
        capabilities: vec!["observation".into()],
        metadata: serde_json::Map::new(),
    })
    .await;
    assert!(matches!(recv(&mut client).await, BrokerMessage::AuthFailed { .. }));
    assert!(accept.await.expect("join").is_err());

    // The real token works.
    let (_client, session) = register(&harness.hub, &["observation"], Some("s3cret")).await;
    assert_eq!(session.state(), SessionState::Running);
}

#[tokio::test]
async fn empty_capability_registration_is_rejected() {
    let harness = test_hub(HubConfig::default());

    let (mut client, server) = duplex(64);
    let hub = Arc::clone(&harness.hub);
    let accept = tokio::spawn(async move { hub.accept(Box::new(server)).await });
    assert!(matches!(recv(&mut client).await, BrokerMessage::ConnectionPending));
    send(&mut client, &WorkerMessage::Register {
        capabilities: vec![],
        metadata: serde_json::Map::new(),
    })
    .await;
    assert!(matches!(recv(&mut client).await, BrokerMessage::Error { .. }));
    assert!(accept.await.expect("join").is_err());
    assert_eq!(harness.hub.worker_count(), 0);
}

#[tokio::test]
async fn worker_limit_applies() {
    let config = HubConfig {
        max_workers: 1,
        ..HubConfig::default()
    };
    let harness = test_hub(config);

    let (_first, _session) = register(&harness.hub, &["observation"], None).await;

    let (mut client, server) = duplex(64);
    let hub = Arc::clone(&harness.hub);
    let accept = tokio::spawn(async move { hub.accept(Box::new(server)).await });
    assert!(matches!(recv(&mut client).await, BrokerMessage::ConnectionPending));
    send(&mut client, &WorkerMessage::Register {
        capabilities: vec!["observation".into()],
        metadata: serde_json::Map::new(),
    })
    .await;
    match recv(&mut client).await {
        BrokerMessage::Error { message } => assert!(message.contains("limit")),
        other => panic!("expected error frame, got {other:?}"),
    }
    assert!(accept.await.expect("join").is_err());
    assert_eq!(harness.hub.worker_count(), 1);
}

#[tokio::test]
async fn worker_ids_are_unique() {
    let harness = test_hub(HubConfig::default());
    let (_c1, s1) = register(&harness.hub, &["observation"], None).await;
    let (_c2, s2) = register(&harness.hub, &["observation"], None).await;
    assert_ne!(s1.worker_id(), s2.worker_id());
}

// ===========================================================================
// Pick
// ===========================================================================

#[tokio::test]
async fn pick_round_robins_within_a_capability() {
    let harness = test_hub(HubConfig::default());
    let (_c1, s1) = register(&harness.hub, &["observation"], None).await;
    let (_c2, s2) = register(&harness.hub, &["observation"], None).await;

    let mut counts = std::collections::HashMap::new();
    for _ in 0..6 {
        let (picked, capability) = harness.hub.pick(&["observation"]).expect("pick");
        assert_eq!(capability, "observation");
        *counts.entry(picked.worker_id().to_owned()).or_insert(0) += 1;
    }
    assert_eq!(counts.get(s1.worker_id()), Some(&3));
    assert_eq!(counts.get(s2.worker_id()), Some(&3));
}

#[tokio::test]
async fn pick_honors_capability_preference_order() {
    let harness = test_hub(HubConfig::default());
    let (_c1, primary) = register(&harness.hub, &["observation:x"], None).await;
    let (_c2, fallback) = register(&harness.hub, &["observation:y"], None).await;

    // Primary capability available: the fallback is not considered.
    let (picked, capability) = harness
        .hub
        .pick(&["observation:x", "observation:y"])
        .expect("pick");
    assert_eq!(picked.worker_id(), primary.worker_id());
    assert_eq!(capability, "observation:x");

    // Saturate the primary worker; the fallback takes over.
    for _ in 0..harness.hub.config().per_worker_concurrency {
        primary.track(Uuid::new_v4());
    }
    let (picked, capability) = harness
        .hub
        .pick(&["observation:x", "observation:y"])
        .expect("pick");
    assert_eq!(picked.worker_id(), fallback.worker_id());
    assert_eq!(capability, "observation:y");
}

#[tokio::test]
async fn pick_skips_draining_and_saturated_sessions() {
    let harness = test_hub(HubConfig::default());
    let (_c1, s1) = register(&harness.hub, &["observation"], None).await;
    let (_c2, s2) = register(&harness.hub, &["observation"], None).await;

    s1.begin_drain();
    for _ in 0..4 {
        let (picked, _) = harness.hub.pick(&["observation"]).expect("pick");
        assert_eq!(picked.worker_id(), s2.worker_id(), "draining session picked");
    }

    for _ in 0..harness.hub.config().per_worker_concurrency {
        s2.track(Uuid::new_v4());
    }
    assert!(harness.hub.pick(&["observation"]).is_none());

    // Capability union reflects capacity the same way.
    assert!(harness.hub.available_capabilities().is_empty());
}

// ===========================================================================
// Session lifecycle
// ===========================================================================

#[tokio::test]
async fn heartbeat_is_acked_and_refreshes_liveness() {
    let harness = test_hub(HubConfig::default());
    let (mut client, session) = register(&harness.hub, &["observation"], None).await;

    let before = session.last_heartbeat();
    tokio::time::sleep(Duration::from_millis(20)).await;
    send(&mut client, &WorkerMessage::Heartbeat { in_flight: vec![] }).await;
    assert!(matches!(recv(&mut client).await, BrokerMessage::HeartbeatAck));
    assert!(session.last_heartbeat() > before);
}

#[tokio::test]
async fn unparseable_frame_closes_the_session_with_an_error() {
    let harness = test_hub(HubConfig::default());
    let (mut client, _session) = register(&harness.hub, &["observation"], None).await;

    client.send("{not json".into()).await.expect("send");
    assert!(matches!(recv(&mut client).await, BrokerMessage::Error { .. }));
    // Transport closes after the error frame.
    assert!(timeout(WAIT, client.recv()).await.expect("eof").is_none());
}

#[tokio::test]
async fn handshake_frames_after_running_are_protocol_violations() {
    let harness = test_hub(HubConfig::default());
    let (mut client, _session) = register(&harness.hub, &["observation"], None).await;

    send(&mut client, &WorkerMessage::Register {
        capabilities: vec!["embedding".into()],
        metadata: serde_json::Map::new(),
    })
    .await;
    assert!(matches!(recv(&mut client).await, BrokerMessage::Error { .. }));
    assert!(timeout(WAIT, client.recv()).await.expect("eof").is_none());
}

#[tokio::test]
async fn disconnect_reports_in_flight_tasks() {
    let harness = test_hub(HubConfig::default());
    let mut events_rx = harness.events_rx;
    let (mut client, session) = register(&harness.hub, &["observation"], None).await;

    let abandoned = Uuid::new_v4();
    session.track(abandoned);
    client.close().await;

    let disconnected = timeout(WAIT, async {
        loop {
            match events_rx.recv().await.expect("events channel open") {
                SessionEvent::Disconnected {
                    worker_id,
                    in_flight,
                } => return (worker_id, in_flight),
                _ => continue,
            }
        }
    })
    .await
    .expect("no disconnect event");

    assert_eq!(disconnected.0, session.worker_id());
    assert_eq!(disconnected.1, vec![abandoned]);
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn drain_closes_once_in_flight_empties() {
    let config = HubConfig {
        session: SessionConfig {
            drain_timeout: Duration::from_secs(10),
            ..SessionConfig::default()
        },
        ..HubConfig::default()
    };
    let harness = test_hub(config);
    let (mut client, session) = register(&harness.hub, &["observation"], None).await;

    let in_flight = Uuid::new_v4();
    session.track(in_flight);
    harness.hub.broadcast_shutdown();

    assert!(matches!(recv(&mut client).await, BrokerMessage::ServerShutdown));
    assert_eq!(session.state(), SessionState::Draining);

    // Still open while work is in flight.
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(session.state(), SessionState::Draining);

    // Work finishes; the session closes.
    session.untrack(in_flight);
    assert!(timeout(WAIT, client.recv()).await.expect("eof").is_none());
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn drain_timeout_forces_the_session_closed() {
    let config = HubConfig {
        session: SessionConfig {
            drain_timeout: Duration::from_millis(600),
            ..SessionConfig::default()
        },
        ..HubConfig::default()
    };
    let harness = test_hub(config);
    let (mut client, session) = register(&harness.hub, &["observation"], None).await;

    session.track(Uuid::new_v4());
    harness.hub.broadcast_shutdown();

    assert!(matches!(recv(&mut client).await, BrokerMessage::ServerShutdown));
    // The in-flight task never finishes; the deadline closes the session.
    assert!(timeout(WAIT, client.recv()).await.expect("eof").is_none());
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn heartbeat_starvation_closes_the_session() {
    let config = HubConfig {
        session: SessionConfig {
            heartbeat_interval: Duration::from_millis(100),
            heartbeat_miss: 2,
            ..SessionConfig::default()
        },
        ..HubConfig::default()
    };
    let harness = test_hub(config);
    let (mut client, _session) = register(&harness.hub, &["observation"], None).await;

    // Never heartbeat; the housekeeping tick closes the session with an
    // error frame once the cutoff passes.
    match timeout(WAIT, client.recv()).await.expect("frame") {
        Some(Ok(frame)) => {
            let message: BrokerMessage = serde_json::from_str(&frame).expect("decode");
            assert!(matches!(message, BrokerMessage::Error { .. }));
        }
        other => panic!("expected error frame, got {other:?}"),
    }
    assert!(timeout(WAIT, client.recv()).await.expect("eof").is_none());
}

#[tokio::test]
async fn stats_count_states_and_capabilities() {
    let harness = test_hub(HubConfig::default());
    let (_c1, s1) = register(&harness.hub, &["observation", "embedding"], None).await;
    let (_c2, _s2) = register(&harness.hub, &["observation"], None).await;

    s1.track(Uuid::new_v4());

    let stats = harness.hub.stats();
    assert_eq!(stats.running, 2);
    assert_eq!(stats.draining, 0);
    assert_eq!(stats.total_in_flight, 1);
    assert_eq!(stats.by_capability.get("observation"), Some(&2));
    assert_eq!(stats.by_capability.get("embedding"), Some(&1));
}
