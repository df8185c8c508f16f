//! Error types for the dispatcher.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for starting and running the server.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Task- and worker-level failures.
///
/// Every variant that reaches a `TaskHandle` fails only that one task.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error("Connection to worker {worker_id} closed: {reason}")]
    Connection { worker_id: Uuid, reason: String },

    #[error("Malformed registration from worker {worker_id}: {reason}")]
    Registration { worker_id: Uuid, reason: String },

    #[error("Failed to send task {task_id} to worker {worker_id}")]
    SendFailure { task_id: Uuid, worker_id: Uuid },

    #[error("Worker {worker_id} missed heartbeats for {elapsed:?}")]
    WorkerTimeout { worker_id: Uuid, elapsed: Duration },

    #[error("Worker {worker_id} reported error: {message}")]
    WorkerReported { worker_id: Uuid, message: String },

    #[error("Task {task_id} was cancelled")]
    Cancelled { task_id: Uuid },

    #[error("Dispatcher is shutting down")]
    Shutdown,
}

/// Wire-level decode errors for inbound worker frames.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Message is missing the \"type\" field")]
    MissingType,

    #[error("Malformed {kind} message: {reason}")]
    Malformed { kind: String, reason: String },
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
