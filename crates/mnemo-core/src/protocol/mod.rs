//! The worker wire protocol.
//!
//! Each frame is one JSON object with a `type` discriminator. The same
//! grammar is spoken on both the hub's WebSocket endpoint and the outbound
//! federation connection (roles inverted). Byte fields (`payload`,
//! `result`) travel hex-encoded, since JSON cannot carry raw bytes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use mnemo_db::models::{Task, TaskKind};

/// Frames sent by a worker to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerMessage {
    #[serde(rename = "auth")]
    Auth { token: String },
    #[serde(rename = "register")]
    Register {
        capabilities: Vec<String>,
        #[serde(default)]
        metadata: serde_json::Map<String, serde_json::Value>,
    },
    #[serde(rename = "heartbeat")]
    Heartbeat {
        #[serde(default)]
        in_flight: Vec<Uuid>,
    },
    #[serde(rename = "task:progress")]
    TaskProgress {
        task_id: Uuid,
        fraction: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    #[serde(rename = "task:complete")]
    TaskComplete {
        task_id: Uuid,
        #[serde(with = "hex_bytes")]
        result: Vec<u8>,
        elapsed_ms: u64,
    },
    #[serde(rename = "task:error")]
    TaskError {
        task_id: Uuid,
        error: String,
        retryable: bool,
    },
    #[serde(rename = "shutdown")]
    Shutdown { reason: String },
}

/// Frames sent by the broker to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BrokerMessage {
    #[serde(rename = "connection:pending")]
    ConnectionPending,
    #[serde(rename = "auth:success")]
    AuthSuccess,
    #[serde(rename = "auth:failed")]
    AuthFailed { reason: String },
    #[serde(rename = "registered")]
    Registered { worker_id: String },
    #[serde(rename = "heartbeat:ack")]
    HeartbeatAck,
    #[serde(rename = "task:assign")]
    TaskAssign { task: TaskAssignment },
    #[serde(rename = "task:cancel")]
    TaskCancel {
        task_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename = "server:shutdown")]
    ServerShutdown,
    #[serde(rename = "error")]
    Error { message: String },
}

/// The task material a worker needs to execute an assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task_id: Uuid,
    pub kind: TaskKind,
    pub required_capability: String,
    #[serde(default)]
    pub fallback_capabilities: Vec<String>,
    /// The capability this assignment actually matched on (primary or one
    /// of the fallbacks).
    pub matched_capability: String,
    pub priority: i32,
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub created_at: DateTime<Utc>,
}

impl TaskAssignment {
    /// Build the assignment frame for a claimed task.
    pub fn from_task(task: &Task, matched_capability: &str) -> Self {
        Self {
            task_id: task.id,
            kind: task.kind,
            required_capability: task.required_capability.clone(),
            fallback_capabilities: task.fallback_capabilities.clone(),
            matched_capability: matched_capability.to_owned(),
            priority: task.priority,
            payload: task.payload.clone(),
            retry_count: task.retry_count,
            max_retries: task.max_retries,
            created_at: task.created_at,
        }
    }
}

/// Hex transport encoding for opaque byte fields.
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_message_wire_names() {
        let cases: Vec<(WorkerMessage, &str)> = vec![
            (
                WorkerMessage::Auth {
                    token: "s3cret".into(),
                },
                "auth",
            ),
            (
                WorkerMessage::Register {
                    capabilities: vec!["observation".into()],
                    metadata: serde_json::Map::new(),
                },
                "register",
            ),
            (
                WorkerMessage::Heartbeat { in_flight: vec![] },
                "heartbeat",
            ),
            (
                WorkerMessage::TaskProgress {
                    task_id: Uuid::new_v4(),
                    fraction: 0.5,
                    note: None,
                },
                "task:progress",
            ),
            (
                WorkerMessage::TaskComplete {
                    task_id: Uuid::new_v4(),
                    result: b"done".to_vec(),
                    elapsed_ms: 12,
                },
                "task:complete",
            ),
            (
                WorkerMessage::TaskError {
                    task_id: Uuid::new_v4(),
                    error: "boom".into(),
                    retryable: true,
                },
                "task:error",
            ),
            (
                WorkerMessage::Shutdown {
                    reason: "deploy".into(),
                },
                "shutdown",
            ),
        ];
        for (msg, tag) in cases {
            let json: serde_json::Value =
                serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
            assert_eq!(json["type"], tag);
            let back: WorkerMessage = serde_json::from_value(json).unwrap();
            assert_eq!(back, msg);
        }
    }

    #[test]
    fn broker_message_wire_names() {
        let cases: Vec<(BrokerMessage, &str)> = vec![
            (BrokerMessage::ConnectionPending, "connection:pending"),
            (BrokerMessage::AuthSuccess, "auth:success"),
            (
                BrokerMessage::AuthFailed {
                    reason: "bad token".into(),
                },
                "auth:failed",
            ),
            (
                BrokerMessage::Registered {
                    worker_id: "worker-1".into(),
                },
                "registered",
            ),
            (BrokerMessage::HeartbeatAck, "heartbeat:ack"),
            (
                BrokerMessage::TaskCancel {
                    task_id: Uuid::new_v4(),
                    reason: Some("superseded".into()),
                },
                "task:cancel",
            ),
            (BrokerMessage::ServerShutdown, "server:shutdown"),
            (
                BrokerMessage::Error {
                    message: "protocol violation".into(),
                },
                "error",
            ),
        ];
        for (msg, tag) in cases {
            let json: serde_json::Value =
                serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
            assert_eq!(json["type"], tag);
            let back: BrokerMessage = serde_json::from_value(json).unwrap();
            assert_eq!(back, msg);
        }
    }

    #[test]
    fn payload_bytes_travel_as_hex() {
        let msg = WorkerMessage::TaskComplete {
            task_id: Uuid::new_v4(),
            result: vec![0x00, 0xff, 0x10],
            elapsed_ms: 1,
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(json["result"], "00ff10");
    }

    #[test]
    fn unknown_frame_type_is_rejected() {
        let err = serde_json::from_str::<WorkerMessage>(r#"{"type":"mystery"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn assignment_round_trips_through_frame() {
        let assignment = TaskAssignment {
            task_id: Uuid::new_v4(),
            kind: TaskKind::Embedding,
            required_capability: "embedding:voyage".into(),
            fallback_capabilities: vec!["embedding".into()],
            matched_capability: "embedding".into(),
            priority: 5,
            payload: b"\x01\x02".to_vec(),
            retry_count: 1,
            max_retries: 3,
            created_at: Utc::now(),
        };
        let frame = BrokerMessage::TaskAssign {
            task: assignment.clone(),
        };
        let back: BrokerMessage =
            serde_json::from_str(&serde_json::to_string(&frame).unwrap()).unwrap();
        match back {
            BrokerMessage::TaskAssign { task } => assert_eq!(task, assignment),
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
