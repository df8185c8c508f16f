//! Dispatch data model — tasks, worker status, snapshots, and observability events.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a connected worker.
pub type WorkerId = Uuid;

/// Identifier of a submitted task.
pub type TaskId = Uuid;

/// Lifecycle status of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Connected, waiting for its `register` message.
    Connecting,
    /// Registered and free to take a task.
    Idle,
    /// Executing exactly one task.
    Busy,
    /// Reported an error or could not be sent to; excluded from matching.
    Errored,
    /// Removed from the registry.
    Disconnected,
}

impl WorkerStatus {
    /// Idle and Busy workers are probed by the liveness monitor.
    pub fn is_alive(&self) -> bool {
        matches!(self, Self::Idle | Self::Busy)
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Errored => "errored",
            Self::Disconnected => "disconnected",
        };
        write!(f, "{s}")
    }
}

/// A unit of work with required capabilities and an opaque payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub required_capabilities: BTreeSet<String>,
    pub payload: serde_json::Value,
    pub submitted_at: DateTime<Utc>,
}

impl Task {
    /// Create a new task with a fresh id.
    pub fn new<I, S>(required_capabilities: I, payload: serde_json::Value) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: Uuid::new_v4(),
            required_capabilities: required_capabilities.into_iter().map(Into::into).collect(),
            payload,
            submitted_at: Utc::now(),
        }
    }
}

/// Descriptive metadata reported by a worker at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerMetadata {
    pub name: String,
    pub version: String,
    pub platform: String,
    /// Remote address of the connection, when the transport knows it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    pub connected_at: DateTime<Utc>,
}

/// Serializable view of a registered worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub status: WorkerStatus,
    pub capabilities: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<TaskId>,
    /// Milliseconds since the last heartbeat was observed.
    pub heartbeat_age_ms: u64,
    pub metadata: WorkerMetadata,
}

/// Aggregate counters for callers and dashboards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchStats {
    pub total_workers: usize,
    pub connecting: usize,
    pub idle: usize,
    pub busy: usize,
    pub errored: usize,
    pub queued_tasks: usize,
    pub in_flight_tasks: usize,
    pub uptime_secs: u64,
    pub timestamp: DateTime<Utc>,
}

/// Why a worker left the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemovalCause {
    /// The transport closed, with the close code and reason when known.
    Closed { code: Option<u16>, reason: String },
    /// No heartbeat within the configured timeout.
    TimedOut { elapsed_ms: u64 },
    /// The dispatcher is shutting down.
    Shutdown,
}

/// Events published on the dispatcher's broadcast channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum DispatchEvent {
    WorkerConnected {
        worker_id: WorkerId,
    },
    WorkerRegistered {
        worker_id: WorkerId,
        name: String,
        capabilities: BTreeSet<String>,
    },
    WorkerErrored {
        worker_id: WorkerId,
        message: String,
    },
    WorkerRemoved {
        worker_id: WorkerId,
        cause: RemovalCause,
    },
    TaskQueued {
        task_id: TaskId,
        queue_len: usize,
    },
    TaskAssigned {
        task_id: TaskId,
        worker_id: WorkerId,
    },
    TaskProgress {
        task_id: TaskId,
        worker_id: WorkerId,
        progress: f32,
        timestamp: DateTime<Utc>,
    },
    TaskCompleted {
        task_id: TaskId,
        worker_id: WorkerId,
    },
    TaskFailed {
        task_id: TaskId,
        error: String,
    },
    /// Initial snapshot sent to event subscribers over the wire.
    Stats {
        stats: DispatchStats,
    },
}
