//! Connection registry — authoritative list of connected workers and their state.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::{TaskId, WorkerId, WorkerInfo, WorkerMetadata, WorkerStatus};
use super::protocol::ServerMessage;
use crate::error::DispatchError;

/// Frames queued for a worker's transport task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// A JSON protocol message.
    Message(ServerMessage),
    /// Transport-level liveness probe.
    Ping,
    /// Close the channel with a code and reason.
    Close { code: u16, reason: String },
}

/// Opaque handle used to push frames to one worker.
///
/// Sends never block; a failed send means the transport side is gone.
#[derive(Debug, Clone)]
pub struct WorkerConnection {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl WorkerConnection {
    /// Create a connection handle and the receiver the transport drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a protocol message. Returns false if the transport is gone.
    pub fn send(&self, message: ServerMessage) -> bool {
        self.tx.send(Outbound::Message(message)).is_ok()
    }

    /// Queue a liveness probe.
    pub fn ping(&self) -> bool {
        self.tx.send(Outbound::Ping).is_ok()
    }

    /// Ask the transport to close the channel.
    pub fn close(&self, code: u16, reason: impl Into<String>) -> bool {
        self.tx
            .send(Outbound::Close {
                code,
                reason: reason.into(),
            })
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A connected worker.
#[derive(Debug)]
pub struct Worker {
    pub id: WorkerId,
    pub connection: WorkerConnection,
    pub status: WorkerStatus,
    pub capabilities: BTreeSet<String>,
    /// Set if and only if `status == Busy`.
    pub current_task_id: Option<TaskId>,
    pub last_heartbeat: Instant,
    pub metadata: WorkerMetadata,
}

impl Worker {
    /// Whether this worker may take a task with the given requirements right now.
    pub fn can_take(&self, required: &BTreeSet<String>) -> bool {
        self.status == WorkerStatus::Idle && required.is_subset(&self.capabilities)
    }

    pub fn heartbeat_age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_heartbeat)
    }

    /// Serializable snapshot.
    pub fn info(&self, now: Instant) -> WorkerInfo {
        WorkerInfo {
            id: self.id,
            status: self.status,
            capabilities: self.capabilities.clone(),
            current_task_id: self.current_task_id,
            heartbeat_age_ms: self.heartbeat_age(now).as_millis() as u64,
            metadata: self.metadata.clone(),
        }
    }
}

/// Fields a worker may send in its `register` message.
#[derive(Debug, Clone, Default)]
pub struct RegistrationInfo {
    pub capabilities: Option<Vec<String>>,
    pub name: Option<String>,
    pub version: Option<String>,
    pub platform: Option<String>,
}

/// Workers in registration order.
pub struct Registry {
    workers: Vec<Worker>,
    default_capability: String,
}

impl Registry {
    pub fn new(default_capability: impl Into<String>) -> Self {
        Self {
            workers: Vec::new(),
            default_capability: default_capability.into(),
        }
    }

    /// Add a freshly connected worker in the `Connecting` state.
    pub fn register(&mut self, connection: WorkerConnection, origin: Option<String>) -> &Worker {
        let id = Uuid::new_v4();
        let short: String = id.to_string().chars().take(8).collect();

        info!(worker_id = %id, origin = ?origin, "Worker connected");

        self.workers.push(Worker {
            id,
            connection,
            status: WorkerStatus::Connecting,
            capabilities: BTreeSet::new(),
            current_task_id: None,
            last_heartbeat: Instant::now(),
            metadata: WorkerMetadata {
                name: format!("Agent-{short}"),
                version: "unknown".to_string(),
                platform: "unknown".to_string(),
                origin,
                connected_at: Utc::now(),
            },
        });

        &self.workers[self.workers.len() - 1]
    }

    /// Apply a `register` message.
    ///
    /// Returns `Ok(None)` if the worker is no longer registered. Connecting and
    /// Errored workers become Idle; a Busy worker keeps its task.
    pub fn apply_registration(
        &mut self,
        worker_id: WorkerId,
        registration: RegistrationInfo,
    ) -> Result<Option<&Worker>, DispatchError> {
        let default_capability = self.default_capability.clone();

        let Some(worker) = self.get_mut(worker_id) else {
            warn!(worker_id = %worker_id, "Registration for unknown worker ignored");
            return Ok(None);
        };

        let capabilities = match registration.capabilities {
            Some(declared) => normalize_capabilities(worker_id, declared)?,
            None => BTreeSet::from([default_capability]),
        };

        worker.capabilities = capabilities;
        if let Some(name) = registration.name {
            worker.metadata.name = name;
        }
        if let Some(version) = registration.version {
            worker.metadata.version = version;
        }
        if let Some(platform) = registration.platform {
            worker.metadata.platform = platform;
        }

        match worker.status {
            WorkerStatus::Busy => {
                debug!(worker_id = %worker_id, "Busy worker re-registered, keeping its task");
            }
            previous => {
                worker.status = WorkerStatus::Idle;
                worker.current_task_id = None;
                if previous == WorkerStatus::Errored {
                    info!(worker_id = %worker_id, "Errored worker recovered by re-registering");
                }
            }
        }

        info!(
            worker_id = %worker_id,
            name = %worker.metadata.name,
            capabilities = ?worker.capabilities,
            "Worker registered"
        );

        Ok(Some(&*worker))
    }

    /// Replace a worker's capability set. Returns `Ok(false)` for unknown workers.
    pub fn update_capabilities(
        &mut self,
        worker_id: WorkerId,
        capabilities: Vec<String>,
    ) -> Result<bool, DispatchError> {
        let Some(worker) = self.get_mut(worker_id) else {
            warn!(worker_id = %worker_id, "Capability update for unknown worker ignored");
            return Ok(false);
        };

        worker.capabilities = normalize_capabilities(worker_id, capabilities)?;
        info!(worker_id = %worker_id, capabilities = ?worker.capabilities, "Worker capabilities updated");
        Ok(true)
    }

    /// Advance a worker's heartbeat. Never moves it backwards.
    pub fn heartbeat(&mut self, worker_id: WorkerId, now: Instant) -> bool {
        match self.get_mut(worker_id) {
            Some(worker) => {
                worker.last_heartbeat = worker.last_heartbeat.max(now);
                true
            }
            None => false,
        }
    }

    /// Remove a worker and hand it back to the caller.
    pub fn remove(&mut self, worker_id: WorkerId) -> Option<Worker> {
        let index = self.workers.iter().position(|w| w.id == worker_id)?;
        let mut worker = self.workers.remove(index);
        worker.status = WorkerStatus::Disconnected;
        Some(worker)
    }

    /// All idle workers whose capabilities cover `required`, in registration order.
    pub fn list_idle(&self, required: &BTreeSet<String>) -> Vec<&Worker> {
        self.workers.iter().filter(|w| w.can_take(required)).collect()
    }

    /// First idle worker whose capabilities cover `required`.
    pub fn find_idle(&self, required: &BTreeSet<String>) -> Option<WorkerId> {
        self.workers.iter().find(|w| w.can_take(required)).map(|w| w.id)
    }

    /// Workers whose heartbeat is older than `timeout`, with their heartbeat age.
    pub fn stale(&self, now: Instant, timeout: Duration) -> Vec<(WorkerId, Duration)> {
        self.workers
            .iter()
            .map(|w| (w.id, w.heartbeat_age(now)))
            .filter(|(_, age)| *age > timeout)
            .collect()
    }

    pub fn get(&self, worker_id: WorkerId) -> Option<&Worker> {
        self.workers.iter().find(|w| w.id == worker_id)
    }

    pub fn get_mut(&mut self, worker_id: WorkerId) -> Option<&mut Worker> {
        self.workers.iter_mut().find(|w| w.id == worker_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Worker> {
        self.workers.iter()
    }

    pub fn count(&self, status: WorkerStatus) -> usize {
        self.workers.iter().filter(|w| w.status == status).count()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

fn normalize_capabilities(
    worker_id: WorkerId,
    declared: Vec<String>,
) -> Result<BTreeSet<String>, DispatchError> {
    let mut capabilities = BTreeSet::new();
    for capability in declared {
        let trimmed = capability.trim();
        if trimmed.is_empty() {
            return Err(DispatchError::Registration {
                worker_id,
                reason: "capability names must not be blank".to_string(),
            });
        }
        capabilities.insert(trimmed.to_string());
    }
    Ok(capabilities)
}
