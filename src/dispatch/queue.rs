//! Task queue — FIFO holding area for tasks with no eligible idle worker.

use std::collections::VecDeque;

use super::model::{Task, TaskId};
use super::results::ResultSender;

/// A task waiting for a worker, together with the sender that completes it.
#[derive(Debug)]
pub struct QueuedTask {
    pub task: Task,
    pub reply: ResultSender,
}

impl QueuedTask {
    /// True once the submitter has dropped its handle.
    pub fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }
}

/// FIFO of queued tasks in submission order.
#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks: VecDeque<QueuedTask>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the tail.
    pub fn push(&mut self, task: Task, reply: ResultSender) {
        self.tasks.push_back(QueuedTask { task, reply });
    }

    pub fn get(&self, index: usize) -> Option<&QueuedTask> {
        self.tasks.get(index)
    }

    pub fn remove_at(&mut self, index: usize) -> Option<QueuedTask> {
        self.tasks.remove(index)
    }

    /// Remove a task by id, wherever it sits in the queue.
    pub fn remove(&mut self, task_id: TaskId) -> Option<QueuedTask> {
        let index = self.tasks.iter().position(|q| q.task.id == task_id)?;
        self.tasks.remove(index)
    }

    /// Drop tasks whose submitters went away. Returns how many were dropped.
    pub fn prune_abandoned(&mut self) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|q| !q.is_abandoned());
        before - self.tasks.len()
    }

    /// Take every queued task, front first.
    pub fn drain(&mut self) -> Vec<QueuedTask> {
        self.tasks.drain(..).collect()
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.tasks.iter().any(|q| q.task.id == task_id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
