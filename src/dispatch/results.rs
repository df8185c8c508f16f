//! Result channel — one pending oneshot sender per in-flight task.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use super::model::{TaskId, WorkerId};
use crate::error::DispatchError;

/// Outcome delivered to the submitter of a task.
pub type TaskResult = Result<serde_json::Value, DispatchError>;

/// Sending half of a task's result.
pub type ResultSender = oneshot::Sender<TaskResult>;

/// Future returned by `submit`; resolves once the task reaches a terminal state.
#[derive(Debug)]
pub struct TaskHandle {
    task_id: TaskId,
    rx: oneshot::Receiver<TaskResult>,
}

impl TaskHandle {
    /// Create a handle and the sender that completes it.
    pub fn pair(task_id: TaskId) -> (ResultSender, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { task_id, rx })
    }

    /// A handle that is already failed.
    pub fn rejected(task_id: TaskId, error: DispatchError) -> Self {
        let (tx, handle) = Self::pair(task_id);
        let _ = tx.send(Err(error));
        handle
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }
}

impl Future for TaskHandle {
    type Output = TaskResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped sender means the dispatcher itself went away.
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(DispatchError::Shutdown)))
    }
}

/// Bookkeeping for one assigned task.
#[derive(Debug)]
struct PendingResult {
    worker_id: WorkerId,
    reply: ResultSender,
    cancelled: bool,
    assigned_at: Instant,
}

/// Map of in-flight task ids to their pending results.
#[derive(Debug, Default)]
pub struct ResultChannel {
    pending: HashMap<TaskId, PendingResult>,
}

impl ResultChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, task_id: TaskId, worker_id: WorkerId, reply: ResultSender) {
        self.pending.insert(
            task_id,
            PendingResult {
                worker_id,
                reply,
                cancelled: false,
                assigned_at: Instant::now(),
            },
        );
    }

    /// Deliver a successful response. A cancelled task is rejected instead.
    /// Returns false if no entry exists.
    pub fn resolve(&mut self, task_id: TaskId, response: serde_json::Value) -> bool {
        let Some(pending) = self.pending.remove(&task_id) else {
            return false;
        };

        debug!(
            task_id = %task_id,
            worker_id = %pending.worker_id,
            elapsed_ms = pending.assigned_at.elapsed().as_millis() as u64,
            "Resolving task"
        );

        let outcome = if pending.cancelled {
            Err(DispatchError::Cancelled { task_id })
        } else {
            Ok(response)
        };
        // The submitter may have dropped its handle.
        let _ = pending.reply.send(outcome);
        true
    }

    /// Fail a task. Returns false if no entry exists.
    pub fn reject(&mut self, task_id: TaskId, error: DispatchError) -> bool {
        let Some(pending) = self.pending.remove(&task_id) else {
            return false;
        };
        let _ = pending.reply.send(Err(error));
        true
    }

    /// Mark an in-flight task so its completion rejects with `Cancelled`.
    pub fn mark_cancelled(&mut self, task_id: TaskId) -> bool {
        match self.pending.get_mut(&task_id) {
            Some(pending) => {
                pending.cancelled = true;
                true
            }
            None => false,
        }
    }

    /// Worker the task is assigned to.
    pub fn worker_for(&self, task_id: TaskId) -> Option<WorkerId> {
        self.pending.get(&task_id).map(|p| p.worker_id)
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.pending.contains_key(&task_id)
    }

    /// Reject everything still pending.
    pub fn reject_all(&mut self, error: &DispatchError) -> usize {
        let count = self.pending.len();
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(error.clone()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
