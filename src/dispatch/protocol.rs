//! Worker wire protocol — JSON frames exchanged over the worker channel.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::model::{Task, TaskId};
use crate::error::ProtocolError;

/// Messages sent by a worker to the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum WorkerMessage {
    /// Declare capabilities and metadata; completes registration.
    Register {
        #[serde(default)]
        capabilities: Option<Vec<String>>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        version: Option<String>,
        #[serde(default)]
        platform: Option<String>,
    },
    /// The assigned task finished.
    TaskComplete {
        task_id: TaskId,
        #[serde(default)]
        response: serde_json::Value,
    },
    /// Progress report for the assigned task, 0–100.
    TaskProgress { task_id: TaskId, progress: f32 },
    /// Liveness signal.
    Heartbeat,
    /// The worker hit an error; fails its current task.
    Error { error: String },
    /// Replace the declared capability set.
    Capabilities { capabilities: Vec<String> },
    /// Any other `type` value.
    #[serde(other)]
    Unknown,
}

impl WorkerMessage {
    /// Wire name of this message, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::TaskComplete { .. } => "taskComplete",
            Self::TaskProgress { .. } => "taskProgress",
            Self::Heartbeat => "heartbeat",
            Self::Error { .. } => "error",
            Self::Capabilities { .. } => "capabilities",
            Self::Unknown => "unknown",
        }
    }
}

/// Task body carried by `executeTask`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    pub id: TaskId,
    pub required_capabilities: BTreeSet<String>,
    pub payload: serde_json::Value,
}

impl From<&Task> for TaskSpec {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            required_capabilities: task.required_capabilities.clone(),
            payload: task.payload.clone(),
        }
    }
}

/// Messages sent by the dispatcher to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Ask a freshly connected worker to register.
    Identify { message: String },
    /// Registration accepted.
    Registered {
        agent_id: Uuid,
        message: String,
        server_time: DateTime<Utc>,
    },
    /// Run a task.
    ExecuteTask {
        task: TaskSpec,
        timestamp: DateTime<Utc>,
    },
    /// The dispatcher is stopping.
    Shutdown { message: String },
}

/// Decode one inbound text frame.
///
/// Unknown `type` values decode to [`WorkerMessage::Unknown`]; everything
/// else that fails to parse is a [`ProtocolError`].
pub fn decode(text: &str) -> Result<WorkerMessage, ProtocolError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or(ProtocolError::MissingType)?
        .to_string();

    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed {
        kind,
        reason: e.to_string(),
    })
}
