use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Kind of work a task carries. The broker never interprets the payload;
/// the kind selects the retry policy and is echoed to workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    Observation,
    Summarize,
    Embedding,
    VectorSync,
    ContextGen,
    DocGen,
    SemanticSearch,
    Compression,
}

impl TaskKind {
    /// All kinds, in declaration order.
    pub const ALL: [TaskKind; 8] = [
        TaskKind::Observation,
        TaskKind::Summarize,
        TaskKind::Embedding,
        TaskKind::VectorSync,
        TaskKind::ContextGen,
        TaskKind::DocGen,
        TaskKind::SemanticSearch,
        TaskKind::Compression,
    ];
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Observation => "observation",
            Self::Summarize => "summarize",
            Self::Embedding => "embedding",
            Self::VectorSync => "vector-sync",
            Self::ContextGen => "context-gen",
            Self::DocGen => "doc-gen",
            Self::SemanticSearch => "semantic-search",
            Self::Compression => "compression",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskKind {
    type Err = TaskKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "observation" => Ok(Self::Observation),
            "summarize" => Ok(Self::Summarize),
            "embedding" => Ok(Self::Embedding),
            "vector-sync" => Ok(Self::VectorSync),
            "context-gen" => Ok(Self::ContextGen),
            "doc-gen" => Ok(Self::DocGen),
            "semantic-search" => Ok(Self::SemanticSearch),
            "compression" => Ok(Self::Compression),
            other => Err(TaskKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskKind`] string.
#[derive(Debug, Clone)]
pub struct TaskKindParseError(pub String);

impl fmt::Display for TaskKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task kind: {:?}", self.0)
    }
}

impl std::error::Error for TaskKindParseError {}

// ---------------------------------------------------------------------------

/// Status of a task.
///
/// `completed`, `failed`, and `timeout` are terminal and never unwound.
/// `timeout` is the terminal form of a release (worker lost or assignment
/// stale) that found the retry budget exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Processing,
    Completed,
    Failed,
    Timeout,
}

impl TaskStatus {
    /// Whether this status is terminal (no further mutation is legal).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Timeout)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "assigned" => Ok(Self::Assigned),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A task row -- one unit of broker-managed work.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub kind: TaskKind,
    pub status: TaskStatus,
    /// Exact-match capability key, e.g. `observation:<provider>` or the
    /// abstract `observation`.
    pub required_capability: String,
    /// Tried in order when no idle worker holds the primary capability.
    pub fallback_capabilities: Vec<String>,
    /// Higher first; ties broken by `created_at` ascending.
    pub priority: i32,
    /// Opaque bytes, interpreted only by the worker.
    pub payload: Vec<u8>,
    /// Present iff `status == completed`.
    pub result: Option<Vec<u8>>,
    /// Present iff `status` is `failed` or `timeout`.
    pub error: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    /// Non-null iff `status` is `assigned` or `processing`.
    pub assigned_worker_id: Option<String>,
    /// Tasks are invisible to the dispatcher before this instant.
    pub retry_after: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// The capability list the dispatcher matches against, primary first.
    pub fn capability_preference(&self) -> Vec<&str> {
        let mut caps = Vec::with_capacity(1 + self.fallback_capabilities.len());
        caps.push(self.required_capability.as_str());
        caps.extend(self.fallback_capabilities.iter().map(String::as_str));
        caps
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_kind_display_roundtrip() {
        for v in &TaskKind::ALL {
            let s = v.to_string();
            let parsed: TaskKind = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_kind_invalid() {
        let result = "teleport".parse::<TaskKind>();
        assert!(result.is_err());
    }

    #[test]
    fn task_kind_serde_uses_kebab_case() {
        let json = serde_json::to_string(&TaskKind::VectorSync).unwrap();
        assert_eq!(json, "\"vector-sync\"");
        let parsed: TaskKind = serde_json::from_str("\"semantic-search\"").unwrap();
        assert_eq!(parsed, TaskKind::SemanticSearch);
    }

    #[test]
    fn task_status_display_roundtrip() {
        let variants = [
            TaskStatus::Pending,
            TaskStatus::Assigned,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Timeout,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_status_invalid() {
        let result = "nope".parse::<TaskStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Timeout.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Assigned.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
    }

    #[test]
    fn capability_preference_orders_primary_first() {
        let task = Task {
            id: Uuid::new_v4(),
            kind: TaskKind::Observation,
            status: TaskStatus::Pending,
            required_capability: "observation:anthropic".into(),
            fallback_capabilities: vec!["observation".into()],
            priority: 0,
            payload: vec![],
            result: None,
            error: None,
            retry_count: 0,
            max_retries: 3,
            assigned_worker_id: None,
            retry_after: None,
            created_at: Utc::now(),
            assigned_at: None,
            completed_at: None,
        };
        assert_eq!(
            task.capability_preference(),
            vec!["observation:anthropic", "observation"]
        );
    }
}
