//! Dispatcher — matches tasks to idle workers and owns all shared dispatch state.
//!
//! Registry, queue, and result channel live in one `DispatchState` behind a
//! single mutex. Every mutation, including the liveness scan, goes through it,
//! so matching a worker and marking it Busy happen in one critical section.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::model::{
    DispatchEvent, DispatchStats, RemovalCause, Task, TaskId, WorkerId, WorkerInfo, WorkerStatus,
};
use super::protocol::{ServerMessage, TaskSpec};
use super::queue::TaskQueue;
use super::registry::{RegistrationInfo, Registry, WorkerConnection};
use super::results::{ResultChannel, ResultSender, TaskHandle};
use crate::config::DispatcherConfig;
use crate::error::DispatchError;

/// Close code sent to workers on graceful shutdown.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code sent to workers reaped for missing heartbeats.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Mutable dispatch state. Only touched while holding `Dispatcher::state`.
pub(super) struct DispatchState {
    pub(super) registry: Registry,
    pub(super) queue: TaskQueue,
    pub(super) results: ResultChannel,
    pub(super) shutting_down: bool,
    events: broadcast::Sender<DispatchEvent>,
}

impl DispatchState {
    fn emit(&self, event: DispatchEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Hand `task` to an idle worker and send it over the worker's connection.
    fn assign(&mut self, worker_id: WorkerId, task: Task, reply: ResultSender) {
        let task_id = task.id;

        let Some(worker) = self
            .registry
            .get_mut(worker_id)
            .filter(|w| w.status == WorkerStatus::Idle)
        else {
            error!(task_id = %task_id, worker_id = %worker_id, "Assignment target is not idle");
            let _ = reply.send(Err(DispatchError::SendFailure { task_id, worker_id }));
            return;
        };

        worker.status = WorkerStatus::Busy;
        worker.current_task_id = Some(task_id);
        self.results.insert(task_id, worker_id, reply);

        let sent = worker.connection.send(ServerMessage::ExecuteTask {
            task: TaskSpec::from(&task),
            timestamp: Utc::now(),
        });

        if sent {
            info!(task_id = %task_id, worker_id = %worker_id, "Task assigned");
            self.emit(DispatchEvent::TaskAssigned { task_id, worker_id });
            return;
        }

        // The connection closed under us: fail this task only, do not requeue.
        worker.status = WorkerStatus::Errored;
        worker.current_task_id = None;
        let error = DispatchError::SendFailure { task_id, worker_id };
        warn!(task_id = %task_id, worker_id = %worker_id, "Failed to send task to worker");
        self.results.reject(task_id, error.clone());
        self.emit(DispatchEvent::WorkerErrored {
            worker_id,
            message: error.to_string(),
        });
        self.emit(DispatchEvent::TaskFailed {
            task_id,
            error: error.to_string(),
        });
    }

    /// Re-attempt a match for every queued task, front to back.
    fn drain_queue(&mut self) {
        let abandoned = self.queue.prune_abandoned();
        if abandoned > 0 {
            debug!(count = abandoned, "Dropped queued tasks with no waiting caller");
        }
        if self.queue.is_empty() || self.registry.count(WorkerStatus::Idle) == 0 {
            return;
        }

        debug!(queued = self.queue.len(), "Processing task queue");

        let mut index = 0;
        while let Some(queued) = self.queue.get(index) {
            match self.registry.find_idle(&queued.task.required_capabilities) {
                Some(worker_id) => {
                    if let Some(queued) = self.queue.remove_at(index) {
                        self.assign(worker_id, queued.task, queued.reply);
                    }
                }
                None => index += 1,
            }
        }
    }

    /// Remove a worker and fail the task it held, if any.
    pub(super) fn remove_worker(&mut self, worker_id: WorkerId, cause: RemovalCause) -> bool {
        let Some(worker) = self.registry.remove(worker_id) else {
            return false;
        };

        if let Some(task_id) = worker.current_task_id {
            let error = match &cause {
                RemovalCause::Closed { code, reason } => DispatchError::Connection {
                    worker_id,
                    reason: match code {
                        Some(code) => format!("{reason} (code {code})"),
                        None => reason.clone(),
                    },
                },
                RemovalCause::TimedOut { elapsed_ms } => DispatchError::WorkerTimeout {
                    worker_id,
                    elapsed: Duration::from_millis(*elapsed_ms),
                },
                RemovalCause::Shutdown => DispatchError::Shutdown,
            };
            error!(task_id = %task_id, worker_id = %worker_id, error = %error, "Task failed with its worker");
            if self.results.reject(task_id, error.clone()) {
                self.emit(DispatchEvent::TaskFailed {
                    task_id,
                    error: error.to_string(),
                });
            }
        }

        match &cause {
            RemovalCause::TimedOut { .. } => {
                worker.connection.close(CLOSE_GOING_AWAY, "Heartbeat timeout");
            }
            RemovalCause::Shutdown => {
                worker.connection.close(CLOSE_NORMAL, "Server shutdown");
            }
            RemovalCause::Closed { .. } => {}
        }

        info!(worker_id = %worker_id, cause = ?cause, "Worker removed");
        self.emit(DispatchEvent::WorkerRemoved { worker_id, cause });
        true
    }
}

/// The task dispatcher. Share it as `Arc<Dispatcher>`.
pub struct Dispatcher {
    config: DispatcherConfig,
    pub(super) state: Mutex<DispatchState>,
    events: broadcast::Sender<DispatchEvent>,
    shutdown_tx: watch::Sender<bool>,
    started_at: Instant,
}

impl Dispatcher {
    /// Create a new dispatcher.
    pub fn new(config: DispatcherConfig) -> Arc<Self> {
        let (events, _rx) = broadcast::channel(config.event_capacity.max(1));
        let (shutdown_tx, _rx) = watch::channel(false);

        Arc::new(Self {
            state: Mutex::new(DispatchState {
                registry: Registry::new(config.default_capability.clone()),
                queue: TaskQueue::new(),
                results: ResultChannel::new(),
                shutting_down: false,
                events: events.clone(),
            }),
            config,
            events,
            shutdown_tx,
            started_at: Instant::now(),
        })
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Subscribe to dispatch events (registration, assignment, progress, failures).
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.events.subscribe()
    }

    // ── Connection lifecycle ────────────────────────────────────────────

    /// Add a new connection as a `Connecting` worker and ask it to identify.
    pub async fn connect(
        &self,
        connection: WorkerConnection,
        origin: Option<String>,
    ) -> Result<WorkerId, DispatchError> {
        let mut state = self.state.lock().await;
        if state.shutting_down {
            connection.close(CLOSE_NORMAL, "Server shutdown");
            return Err(DispatchError::Shutdown);
        }

        let worker = state.registry.register(connection, origin);
        let worker_id = worker.id;
        worker.connection.send(ServerMessage::Identify {
            message: "Please identify your capabilities".to_string(),
        });

        state.emit(DispatchEvent::WorkerConnected { worker_id });
        Ok(worker_id)
    }

    /// Complete a worker's registration and drain the queue.
    ///
    /// Returns `Ok(false)` if the worker is no longer known.
    pub async fn register_worker(
        &self,
        worker_id: WorkerId,
        registration: RegistrationInfo,
    ) -> Result<bool, DispatchError> {
        let mut state = self.state.lock().await;

        let Some(worker) = state.registry.apply_registration(worker_id, registration)? else {
            return Ok(false);
        };

        worker.connection.send(ServerMessage::Registered {
            agent_id: worker_id,
            message: "Successfully registered with dispatcher".to_string(),
            server_time: Utc::now(),
        });
        let event = DispatchEvent::WorkerRegistered {
            worker_id,
            name: worker.metadata.name.clone(),
            capabilities: worker.capabilities.clone(),
        };

        state.emit(event);
        state.drain_queue();
        Ok(true)
    }

    /// Handle a transport close. Treated exactly like a heartbeat timeout.
    pub async fn disconnect(
        &self,
        worker_id: WorkerId,
        code: Option<u16>,
        reason: impl Into<String>,
    ) -> bool {
        let reason = reason.into();
        info!(worker_id = %worker_id, code = ?code, reason = %reason, "Worker disconnected");
        let mut state = self.state.lock().await;
        state.remove_worker(worker_id, RemovalCause::Closed { code, reason })
    }

    /// Record a heartbeat from a worker.
    pub async fn heartbeat(&self, worker_id: WorkerId) -> bool {
        let mut state = self.state.lock().await;
        let known = state.registry.heartbeat(worker_id, Instant::now());
        if !known {
            debug!(worker_id = %worker_id, "Heartbeat from unknown worker");
        }
        known
    }

    // ── Tasks ───────────────────────────────────────────────────────────

    /// Submit a task. Assigns it immediately if an eligible worker is idle,
    /// otherwise queues it. Await the returned handle for the result.
    pub async fn submit(&self, task: Task) -> TaskHandle {
        let mut state = self.state.lock().await;

        if state.shutting_down {
            return TaskHandle::rejected(task.id, DispatchError::Shutdown);
        }

        let (reply, handle) = TaskHandle::pair(task.id);

        match state.registry.find_idle(&task.required_capabilities) {
            Some(worker_id) => state.assign(worker_id, task, reply),
            None => {
                let task_id = task.id;
                info!(
                    task_id = %task_id,
                    required = ?task.required_capabilities,
                    "Task queued (no available workers)"
                );
                state.queue.push(task, reply);
                let queue_len = state.queue.len();
                state.emit(DispatchEvent::TaskQueued { task_id, queue_len });
            }
        }

        handle
    }

    /// Build and submit a task from its parts.
    pub async fn submit_task<I, S>(
        &self,
        required_capabilities: I,
        payload: serde_json::Value,
    ) -> TaskHandle
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.submit(Task::new(required_capabilities, payload)).await
    }

    /// Handle `taskComplete` from a worker. Stale or foreign completions are ignored.
    pub async fn complete_task(
        &self,
        worker_id: WorkerId,
        task_id: TaskId,
        response: serde_json::Value,
    ) -> bool {
        let mut state = self.state.lock().await;

        if state.results.worker_for(task_id) != Some(worker_id) {
            warn!(
                task_id = %task_id,
                worker_id = %worker_id,
                "Completion for a task this worker does not hold, ignoring"
            );
            return false;
        }

        if let Some(worker) = state.registry.get_mut(worker_id) {
            worker.status = WorkerStatus::Idle;
            worker.current_task_id = None;
        }
        state.results.resolve(task_id, response);

        info!(task_id = %task_id, worker_id = %worker_id, "Task completed");
        state.emit(DispatchEvent::TaskCompleted { task_id, worker_id });
        state.drain_queue();
        true
    }

    /// Forward a progress report to event subscribers. Does not change state.
    pub async fn report_progress(&self, worker_id: WorkerId, task_id: TaskId, progress: f32) {
        let progress = if progress.is_finite() {
            progress.clamp(0.0, 100.0)
        } else {
            0.0
        };
        debug!(task_id = %task_id, worker_id = %worker_id, progress, "Task progress");

        let state = self.state.lock().await;
        if state.registry.get(worker_id).is_none() {
            debug!(worker_id = %worker_id, "Progress from unknown worker dropped");
            return;
        }
        state.emit(DispatchEvent::TaskProgress {
            task_id,
            worker_id,
            progress,
            timestamp: Utc::now(),
        });
    }

    /// Handle a worker-reported error: mark it Errored and fail its task.
    pub async fn report_error(&self, worker_id: WorkerId, message: impl Into<String>) -> bool {
        let message = message.into();
        let mut state = self.state.lock().await;

        let Some(worker) = state.registry.get_mut(worker_id) else {
            warn!(worker_id = %worker_id, "Error report from unknown worker");
            return false;
        };

        worker.status = WorkerStatus::Errored;
        let held = worker.current_task_id.take();
        error!(worker_id = %worker_id, error = %message, "Worker reported error");

        if let Some(task_id) = held {
            let error = DispatchError::WorkerReported {
                worker_id,
                message: message.clone(),
            };
            if state.results.reject(task_id, error.clone()) {
                state.emit(DispatchEvent::TaskFailed {
                    task_id,
                    error: error.to_string(),
                });
            }
        }

        state.emit(DispatchEvent::WorkerErrored { worker_id, message });
        true
    }

    /// Replace a worker's capabilities and drain the queue.
    pub async fn update_capabilities(
        &self,
        worker_id: WorkerId,
        capabilities: Vec<String>,
    ) -> Result<bool, DispatchError> {
        let mut state = self.state.lock().await;
        if !state.registry.update_capabilities(worker_id, capabilities)? {
            return Ok(false);
        }
        state.drain_queue();
        Ok(true)
    }

    /// Cancel a task.
    ///
    /// A queued task is removed and rejected now. An in-flight task rejects
    /// with `Cancelled` when its worker reports completion. Returns false for
    /// unknown or already finished tasks.
    pub async fn cancel(&self, task_id: TaskId) -> bool {
        let mut state = self.state.lock().await;

        if let Some(queued) = state.queue.remove(task_id) {
            let _ = queued.reply.send(Err(DispatchError::Cancelled { task_id }));
            info!(task_id = %task_id, "Queued task cancelled");
            state.emit(DispatchEvent::TaskFailed {
                task_id,
                error: DispatchError::Cancelled { task_id }.to_string(),
            });
            return true;
        }

        if state.results.mark_cancelled(task_id) {
            info!(task_id = %task_id, "In-flight task marked cancelled");
            return true;
        }

        false
    }

    // ── Introspection ───────────────────────────────────────────────────

    pub async fn stats(&self) -> DispatchStats {
        let state = self.state.lock().await;
        DispatchStats {
            total_workers: state.registry.len(),
            connecting: state.registry.count(WorkerStatus::Connecting),
            idle: state.registry.count(WorkerStatus::Idle),
            busy: state.registry.count(WorkerStatus::Busy),
            errored: state.registry.count(WorkerStatus::Errored),
            queued_tasks: state.queue.len(),
            in_flight_tasks: state.results.len(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            timestamp: Utc::now(),
        }
    }

    /// Snapshots of all registered workers, in registration order.
    pub async fn workers(&self) -> Vec<WorkerInfo> {
        let state = self.state.lock().await;
        let now = Instant::now();
        state.registry.iter().map(|w| w.info(now)).collect()
    }

    /// Snapshot of one worker.
    pub async fn worker(&self, worker_id: WorkerId) -> Option<WorkerInfo> {
        let state = self.state.lock().await;
        state.registry.get(worker_id).map(|w| w.info(Instant::now()))
    }

    /// Idle workers able to run a task with these requirements.
    pub async fn idle_workers(&self, required: &BTreeSet<String>) -> Vec<WorkerId> {
        let state = self.state.lock().await;
        state.registry.list_idle(required).iter().map(|w| w.id).collect()
    }

    // ── Shutdown ────────────────────────────────────────────────────────

    /// Notify and disconnect every worker, fail all outstanding tasks, and
    /// stop accepting work. Calling it again is a no-op.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if state.shutting_down {
            debug!("Dispatcher already shut down");
            return;
        }
        state.shutting_down = true;
        info!("Shutting down dispatcher");

        let mut notified = 0;
        let worker_ids: Vec<WorkerId> = state.registry.iter().map(|w| w.id).collect();
        for worker_id in worker_ids {
            if let Some(worker) = state.registry.get(worker_id) {
                if worker.connection.send(ServerMessage::Shutdown {
                    message: "Server is shutting down".to_string(),
                }) {
                    notified += 1;
                }
            }
            state.remove_worker(worker_id, RemovalCause::Shutdown);
        }

        let queued = state.queue.drain();
        let queued_count = queued.len();
        for queued in queued {
            let _ = queued.reply.send(Err(DispatchError::Shutdown));
        }
        state.results.reject_all(&DispatchError::Shutdown);
        drop(state);

        self.shutdown_tx.send_replace(true);
        info!(notified, dropped_tasks = queued_count, "Dispatcher shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Resolves once `shutdown` has run.
    pub fn shutdown_signal(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut rx = self.shutdown_tx.subscribe();
        async move {
            loop {
                if *rx.borrow_and_update() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::registry::Outbound;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    struct FakeWorker {
        id: WorkerId,
        rx: mpsc::UnboundedReceiver<Outbound>,
    }

    impl FakeWorker {
        /// Next `executeTask` queued for this worker, skipping other frames.
        fn next_task(&mut self) -> Option<TaskSpec> {
            while let Ok(frame) = self.rx.try_recv() {
                if let Outbound::Message(ServerMessage::ExecuteTask { task, .. }) = frame {
                    return Some(task);
                }
            }
            None
        }

        fn frames(&mut self) -> Vec<Outbound> {
            let mut frames = Vec::new();
            while let Ok(frame) = self.rx.try_recv() {
                frames.push(frame);
            }
            frames
        }
    }

    fn dispatcher() -> Arc<Dispatcher> {
        Dispatcher::new(DispatcherConfig::default())
    }

    async fn connect(d: &Dispatcher) -> FakeWorker {
        let (conn, rx) = WorkerConnection::channel();
        let id = d.connect(conn, None).await.unwrap();
        FakeWorker { id, rx }
    }

    async fn register(d: &Dispatcher, capabilities: &[&str]) -> FakeWorker {
        let worker = connect(d).await;
        let registration = RegistrationInfo {
            capabilities: Some(capabilities.iter().map(|s| s.to_string()).collect()),
            ..Default::default()
        };
        assert!(d.register_worker(worker.id, registration).await.unwrap());
        worker
    }

    async fn assert_invariants(d: &Dispatcher) {
        let state = d.state.lock().await;
        let busy: Vec<_> = state
            .registry
            .iter()
            .filter(|w| w.status == WorkerStatus::Busy)
            .collect();
        assert_eq!(busy.len(), state.results.len());
        for worker in state.registry.iter() {
            assert_eq!(
                worker.current_task_id.is_some(),
                worker.status == WorkerStatus::Busy
            );
        }
        for worker in busy {
            let task_id = worker.current_task_id.unwrap();
            assert_eq!(state.results.worker_for(task_id), Some(worker.id));
            assert!(!state.queue.contains(task_id));
        }
    }

    #[tokio::test]
    async fn connect_sends_identify() {
        let d = dispatcher();
        let mut worker = connect(&d).await;
        match worker.frames().first() {
            Some(Outbound::Message(ServerMessage::Identify { .. })) => {}
            other => panic!("Expected identify, got {:?}", other),
        }
        assert_eq!(d.stats().await.connecting, 1);
    }

    #[tokio::test]
    async fn registration_replies_with_registered() {
        let d = dispatcher();
        let mut worker = register(&d, &["python"]).await;
        let registered = worker.frames().into_iter().any(|f| {
            matches!(f, Outbound::Message(ServerMessage::Registered { agent_id, .. }) if agent_id == worker.id)
        });
        assert!(registered);
        assert_eq!(d.stats().await.idle, 1);
    }

    #[tokio::test]
    async fn queued_task_assigned_when_capable_worker_registers() {
        let d = dispatcher();
        let handle = d
            .submit_task(["python"], serde_json::json!({"script": "main.py"}))
            .await;
        assert_eq!(d.stats().await.queued_tasks, 1);

        let mut worker = register(&d, &["python", "node"]).await;
        let stats = d.stats().await;
        assert_eq!(stats.queued_tasks, 0);
        assert_eq!(stats.busy, 1);

        let spec = worker.next_task().expect("task should be sent");
        assert_eq!(spec.id, handle.task_id());
        assert_eq!(spec.payload["script"], "main.py");
        assert_eq!(
            d.worker(worker.id).await.unwrap().status,
            WorkerStatus::Busy
        );
        assert_invariants(&d).await;

        assert!(
            d.complete_task(worker.id, spec.id, serde_json::json!({"exit": 0}))
                .await
        );
        assert_eq!(handle.await.unwrap()["exit"], 0);
        assert_invariants(&d).await;
    }

    #[tokio::test]
    async fn second_task_waits_for_same_worker() {
        let d = dispatcher();
        let mut worker = register(&d, &["general"]).await;

        let first = d.submit_task(Vec::<String>::new(), serde_json::json!(1)).await;
        let second = d.submit_task(Vec::<String>::new(), serde_json::json!(2)).await;
        assert_eq!(d.stats().await.queued_tasks, 1);

        let spec = worker.next_task().unwrap();
        assert_eq!(spec.id, first.task_id());
        assert!(worker.next_task().is_none());

        d.complete_task(worker.id, spec.id, serde_json::json!("one"))
            .await;
        let spec = worker.next_task().unwrap();
        assert_eq!(spec.id, second.task_id());
        assert_eq!(d.stats().await.queued_tasks, 0);

        d.complete_task(worker.id, spec.id, serde_json::json!("two"))
            .await;
        assert_eq!(first.await.unwrap(), "one");
        assert_eq!(second.await.unwrap(), "two");
    }

    #[tokio::test]
    async fn fifo_for_identical_requirements() {
        let d = dispatcher();
        let t1 = d.submit_task(["rust"], serde_json::json!("t1")).await;
        let t2 = d.submit_task(["rust"], serde_json::json!("t2")).await;

        let mut worker = register(&d, &["rust"]).await;
        let first = worker.next_task().unwrap();
        assert_eq!(first.id, t1.task_id());
        assert_eq!(d.stats().await.queued_tasks, 1);

        d.complete_task(worker.id, first.id, serde_json::json!("done"))
            .await;
        let second = worker.next_task().unwrap();
        assert_eq!(second.id, t2.task_id());
        assert_eq!(second.payload, "t2");
        assert_eq!(d.stats().await.queued_tasks, 0);
        assert_eq!(t1.await.unwrap(), "done");
    }

    #[tokio::test]
    async fn drain_skips_task_whose_handle_was_dropped() {
        let d = dispatcher();
        let abandoned = d.submit_task(["rust"], serde_json::json!("gone")).await;
        let kept = d.submit_task(["rust"], serde_json::json!("kept")).await;
        drop(abandoned);
        assert_eq!(d.stats().await.queued_tasks, 2);

        let mut worker = register(&d, &["rust"]).await;
        let spec = worker.next_task().unwrap();
        assert_eq!(spec.id, kept.task_id());
        assert!(worker.next_task().is_none());
        assert_eq!(d.stats().await.queued_tasks, 0);
        assert_invariants(&d).await;
    }

    #[tokio::test]
    async fn blocked_task_does_not_block_later_tasks() {
        let d = dispatcher();
        let _gpu = d.submit_task(["gpu"], serde_json::Value::Null).await;
        let cpu = d.submit_task(["cpu"], serde_json::Value::Null).await;

        let mut worker = register(&d, &["cpu"]).await;
        assert_eq!(worker.next_task().unwrap().id, cpu.task_id());
        assert_eq!(d.stats().await.queued_tasks, 1);
    }

    #[tokio::test]
    async fn task_only_goes_to_capable_worker() {
        let d = dispatcher();
        let mut node = register(&d, &["node"]).await;
        let mut python = register(&d, &["python", "docker"]).await;

        let handle = d.submit_task(["python"], serde_json::Value::Null).await;
        assert!(node.next_task().is_none());
        assert_eq!(python.next_task().unwrap().id, handle.task_id());
        assert_invariants(&d).await;
    }

    #[tokio::test]
    async fn stale_completion_is_ignored() {
        let d = dispatcher();
        let mut worker = register(&d, &[]).await;
        let handle = d.submit_task(Vec::<String>::new(), serde_json::Value::Null).await;
        worker.next_task().unwrap();

        let before = d.stats().await;
        assert!(
            !d.complete_task(worker.id, Uuid::new_v4(), serde_json::Value::Null)
                .await
        );
        let after = d.stats().await;
        assert_eq!(before.busy, after.busy);
        assert_eq!(before.in_flight_tasks, after.in_flight_tasks);

        // A different worker cannot complete someone else's task.
        let other = register(&d, &[]).await;
        assert!(
            !d.complete_task(other.id, handle.task_id(), serde_json::Value::Null)
                .await
        );
        assert_invariants(&d).await;
    }

    #[tokio::test]
    async fn send_failure_rejects_without_requeue() {
        let d = dispatcher();
        let worker = register(&d, &["python"]).await;
        let worker_id = worker.id;
        drop(worker.rx);

        let handle = d.submit_task(["python"], serde_json::Value::Null).await;
        match handle.await {
            Err(DispatchError::SendFailure { worker_id: w, .. }) => assert_eq!(w, worker_id),
            other => panic!("Expected SendFailure, got {:?}", other),
        }

        let stats = d.stats().await;
        assert_eq!(stats.errored, 1);
        assert_eq!(stats.queued_tasks, 0);
        assert_eq!(stats.in_flight_tasks, 0);
        assert_invariants(&d).await;
    }

    #[tokio::test]
    async fn worker_error_fails_its_task_and_excludes_worker() {
        let d = dispatcher();
        let mut worker = register(&d, &[]).await;
        let handle = d.submit_task(Vec::<String>::new(), serde_json::Value::Null).await;
        worker.next_task().unwrap();

        assert!(d.report_error(worker.id, "disk full").await);
        match handle.await {
            Err(DispatchError::WorkerReported { message, .. }) => assert_eq!(message, "disk full"),
            other => panic!("Expected WorkerReported, got {:?}", other),
        }

        let info = d.worker(worker.id).await.unwrap();
        assert_eq!(info.status, WorkerStatus::Errored);
        assert!(info.current_task_id.is_none());

        let queued = d.submit_task(Vec::<String>::new(), serde_json::Value::Null).await;
        assert_eq!(d.stats().await.queued_tasks, 1);

        // Recovery: a fresh registration makes it idle again and drains the queue.
        d.register_worker(worker.id, RegistrationInfo::default())
            .await
            .unwrap();
        assert_eq!(worker.next_task().unwrap().id, queued.task_id());
        assert_invariants(&d).await;
    }

    #[tokio::test]
    async fn capability_update_triggers_drain() {
        let d = dispatcher();
        let mut worker = register(&d, &["node"]).await;
        let handle = d.submit_task(["python"], serde_json::Value::Null).await;
        assert!(worker.next_task().is_none());

        assert!(
            d.update_capabilities(worker.id, vec!["node".into(), "python".into()])
                .await
                .unwrap()
        );
        assert_eq!(worker.next_task().unwrap().id, handle.task_id());
    }

    #[tokio::test]
    async fn heartbeat_timeout_reaps_busy_worker() {
        let d = dispatcher();
        let mut worker = register(&d, &[]).await;
        let handle = d.submit_task(Vec::<String>::new(), serde_json::Value::Null).await;
        worker.next_task().unwrap();

        let report = d.scan_at(Instant::now() + Duration::from_secs(61)).await;
        assert_eq!(report.reaped, vec![worker.id]);

        assert!(matches!(
            handle.await,
            Err(DispatchError::WorkerTimeout { .. })
        ));
        assert_eq!(d.stats().await.total_workers, 0);
        assert!(d.idle_workers(&BTreeSet::new()).await.is_empty());
        assert!(
            worker
                .frames()
                .iter()
                .any(|f| matches!(f, Outbound::Close { code: CLOSE_GOING_AWAY, .. }))
        );
    }

    #[tokio::test]
    async fn scan_probes_alive_workers_only() {
        let d = dispatcher();
        let mut idle = register(&d, &[]).await;
        let mut connecting = connect(&d).await;
        idle.frames();
        connecting.frames();

        let report = d.scan_at(Instant::now()).await;
        assert!(report.reaped.is_empty());
        assert_eq!(report.probed, 1);
        assert_eq!(idle.frames(), vec![Outbound::Ping]);
        assert!(connecting.frames().is_empty());
    }

    #[tokio::test]
    async fn heartbeat_keeps_worker_alive() {
        let d = dispatcher();
        let worker = register(&d, &[]).await;
        assert!(d.heartbeat(worker.id).await);
        let report = d.scan_at(Instant::now() + Duration::from_secs(30)).await;
        assert!(report.reaped.is_empty());
        assert_eq!(d.stats().await.total_workers, 1);
    }

    #[tokio::test]
    async fn disconnect_rejects_in_flight_task() {
        let d = dispatcher();
        let mut worker = register(&d, &[]).await;
        let handle = d.submit_task(Vec::<String>::new(), serde_json::Value::Null).await;
        worker.next_task().unwrap();

        assert!(d.disconnect(worker.id, Some(1006), "abnormal").await);
        match handle.await {
            Err(DispatchError::Connection { reason, .. }) => assert!(reason.contains("1006")),
            other => panic!("Expected Connection, got {:?}", other),
        }
        assert!(!d.disconnect(worker.id, None, "again").await);
        assert_invariants(&d).await;
    }

    #[tokio::test]
    async fn cancel_queued_task() {
        let d = dispatcher();
        let handle = d.submit_task(["python"], serde_json::Value::Null).await;
        assert!(d.cancel(handle.task_id()).await);
        assert_eq!(d.stats().await.queued_tasks, 0);
        assert!(matches!(handle.await, Err(DispatchError::Cancelled { .. })));
    }

    #[tokio::test]
    async fn cancel_in_flight_task_rejects_on_completion() {
        let d = dispatcher();
        let mut worker = register(&d, &[]).await;
        let handle = d.submit_task(Vec::<String>::new(), serde_json::Value::Null).await;
        let spec = worker.next_task().unwrap();

        assert!(d.cancel(spec.id).await);
        assert_eq!(d.stats().await.busy, 1);
        d.complete_task(worker.id, spec.id, serde_json::json!("late"))
            .await;
        assert!(matches!(handle.await, Err(DispatchError::Cancelled { .. })));
        assert_eq!(d.stats().await.idle, 1);
        assert!(!d.cancel(spec.id).await);
    }

    #[tokio::test]
    async fn progress_is_broadcast_without_state_change() {
        let d = dispatcher();
        let mut worker = register(&d, &[]).await;
        let _handle = d.submit_task(Vec::<String>::new(), serde_json::Value::Null).await;
        let spec = worker.next_task().unwrap();

        let mut events = d.subscribe();
        d.report_progress(worker.id, spec.id, 150.0).await;
        match events.recv().await.unwrap() {
            DispatchEvent::TaskProgress { task_id, progress, .. } => {
                assert_eq!(task_id, spec.id);
                assert_eq!(progress, 100.0);
            }
            other => panic!("Expected TaskProgress, got {:?}", other),
        }
        assert_eq!(d.stats().await.busy, 1);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_fails_everything() {
        let d = dispatcher();
        let mut worker = register(&d, &["python"]).await;
        let in_flight = d.submit_task(["python"], serde_json::Value::Null).await;
        let queued = d.submit_task(["python"], serde_json::Value::Null).await;
        worker.frames();

        d.shutdown().await;
        d.shutdown().await;
        assert!(d.is_shut_down());

        let frames = worker.frames();
        let notices = frames
            .iter()
            .filter(|f| matches!(f, Outbound::Message(ServerMessage::Shutdown { .. })))
            .count();
        assert_eq!(notices, 1);
        assert!(
            frames
                .iter()
                .any(|f| matches!(f, Outbound::Close { code: CLOSE_NORMAL, .. }))
        );

        assert!(matches!(in_flight.await, Err(DispatchError::Shutdown)));
        assert!(matches!(queued.await, Err(DispatchError::Shutdown)));

        let late = d.submit_task(Vec::<String>::new(), serde_json::Value::Null).await;
        assert!(matches!(late.await, Err(DispatchError::Shutdown)));
        assert_eq!(d.stats().await.total_workers, 0);

        let (conn, _rx) = WorkerConnection::channel();
        assert!(matches!(
            d.connect(conn, None).await,
            Err(DispatchError::Shutdown)
        ));
    }

    #[tokio::test]
    async fn shutdown_signal_resolves() {
        let d = dispatcher();
        let signal = d.shutdown_signal();
        d.shutdown().await;
        tokio::time::timeout(Duration::from_secs(1), signal)
            .await
            .expect("signal should fire");
    }

    #[tokio::test]
    async fn no_worker_holds_two_tasks_under_load() {
        let d = dispatcher();
        let mut workers = Vec::new();
        for _ in 0..3 {
            workers.push(register(&d, &["general"]).await);
        }

        let mut handles = Vec::new();
        for i in 0..10 {
            handles.push(d.submit_task(["general"], serde_json::json!(i)).await);
        }
        assert_eq!(d.stats().await.busy, 3);
        assert_eq!(d.stats().await.queued_tasks, 7);
        assert_invariants(&d).await;

        let mut completed = 0;
        while completed < 10 {
            for worker in workers.iter_mut() {
                if let Some(spec) = worker.next_task() {
                    assert!(worker.next_task().is_none());
                    d.complete_task(worker.id, spec.id, spec.payload.clone())
                        .await;
                    completed += 1;
                    assert_invariants(&d).await;
                }
            }
        }

        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap(), serde_json::json!(i));
        }
    }
}
