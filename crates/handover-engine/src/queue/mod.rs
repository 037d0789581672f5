//! # Operation Queue
//!
//! Bounded priority queue drained by a fixed pool of tokio workers.
//!
//! - `submit` never blocks: a full queue is reported as
//!   [`QueueError::Full`] and the task is recorded as `Rejected`.
//! - Workers take the lowest priority number first; equal priorities run in
//!   submission order.
//! - Every execution runs under a deadline (per-kind budget or a per-task
//!   override). On expiry the operation future is dropped, the task fails
//!   with [`TaskError::Timeout`], and the worker moves on.
//! - Task ids are unique among queued and running tasks; a second task with
//!   a live id is refused with [`QueueError::Duplicate`].
//! - Cancelling a queued task removes it. Cancelling a running task marks it
//!   `Cancelled` and releases joiners at once; the worker's eventual result
//!   is discarded.
//!
//! The heap and the in-flight map sit behind one mutex owned by the queue;
//! no breaker lock is ever taken while it is held.

mod task;

pub use task::{
    Operation, OperationKind, OperationOutput, OperationTask, TaskError, TaskHandle, TaskResult,
    TaskStatus,
};

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::metrics::EngineMetrics;
use crate::prediction::PredictionError;

/// Runs the operations a worker dequeues.
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    async fn execute(&self, operation: Operation) -> Result<OperationOutput, PredictionError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("operation queue is full ({capacity} pending), task {task_id} rejected")]
    Full { capacity: usize, task_id: String },
    #[error("task {task_id} is already queued or running")]
    Duplicate { task_id: String },
    #[error("operation queue is shut down")]
    Closed,
}

// ── Shared state ────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
struct Pending {
    priority: u8,
    seq: u64,
    id: String,
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.priority, self.seq).cmp(&(other.priority, other.seq))
    }
}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct Entry {
    /// Taken by the worker that starts the task.
    operation: Option<Operation>,
    timeout: Duration,
    status: watch::Sender<TaskStatus>,
    result: Option<oneshot::Sender<TaskResult>>,
}

impl Entry {
    fn current(&self) -> TaskStatus {
        *self.status.borrow()
    }

    fn advance(&self, next: TaskStatus) -> bool {
        self.status.send_if_modified(|s| {
            if s.can_advance_to(next) {
                *s = next;
                true
            } else {
                false
            }
        })
    }

    fn finish(&mut self, result: TaskResult) {
        if let Some(tx) = self.result.take() {
            let _ = tx.send(result);
        }
    }
}

#[derive(Default)]
struct State {
    /// Min-heap on (priority, seq). Holds exactly the queued tasks.
    heap: BinaryHeap<Reverse<Pending>>,
    /// Every queued or running task.
    entries: HashMap<String, Entry>,
    queued: usize,
    running: usize,
    next_seq: u64,
    closed: bool,
}

struct Job {
    id: String,
    operation: Operation,
    timeout: Duration,
}

impl State {
    fn next_job(&mut self) -> Option<Job> {
        while let Some(Reverse(pending)) = self.heap.pop() {
            let Some(entry) = self.entries.get_mut(&pending.id) else {
                continue;
            };
            let Some(operation) = entry.operation.take() else {
                continue;
            };
            entry.advance(TaskStatus::Running);
            self.queued -= 1;
            self.running += 1;
            return Some(Job {
                id: pending.id,
                operation,
                timeout: entry.timeout,
            });
        }
        None
    }
}

pub(crate) struct Shared {
    state: Mutex<State>,
    notify: Notify,
    config: QueueConfig,
    metrics: Arc<EngineMetrics>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn budget(&self, task: &OperationTask) -> Duration {
        task.timeout.unwrap_or(match task.operation.kind() {
            OperationKind::Prediction => self.config.prediction_timeout,
            OperationKind::Training => self.config.training_timeout,
        })
    }

    pub(crate) fn cancel(&self, id: &str) -> bool {
        let mut state = self.lock();
        let Some(status) = state.entries.get(id).map(Entry::current) else {
            return false;
        };
        match status {
            TaskStatus::Queued => {
                let Some(mut entry) = state.entries.remove(id) else {
                    return false;
                };
                state.heap.retain(|Reverse(p)| p.id != id);
                state.queued -= 1;
                drop(state);
                entry.advance(TaskStatus::Cancelled);
                entry.finish(Err(TaskError::Cancelled));
                self.metrics.record_queue_cancelled();
                debug!(task_id = id, "queued task cancelled");
                true
            }
            TaskStatus::Running => {
                // The worker still owns the execution; it will find the
                // Cancelled status and discard whatever it produces.
                let Some(entry) = state.entries.get_mut(id) else {
                    return false;
                };
                entry.advance(TaskStatus::Cancelled);
                entry.finish(Err(TaskError::Cancelled));
                drop(state);
                self.metrics.record_queue_cancelled();
                debug!(task_id = id, "running task marked cancelled");
                true
            }
            _ => false,
        }
    }

    async fn next(&self) -> Option<Job> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if let Some(job) = state.next_job() {
                    if state.queued > 0 {
                        // Chain the wake-up so idle workers see the backlog.
                        self.notify.notify_one();
                    }
                    return Some(job);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    fn complete(&self, id: &str, outcome: TaskResult) {
        let mut state = self.lock();
        state.running -= 1;
        let Some(mut entry) = state.entries.remove(id) else {
            return;
        };
        drop(state);

        if entry.current() == TaskStatus::Cancelled {
            debug!(task_id = id, "discarding result of cancelled task");
            return;
        }
        let next = if outcome.is_ok() {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        entry.advance(next);
        match &outcome {
            Ok(_) => self.metrics.record_queue_completed(),
            Err(TaskError::Timeout(_)) => self.metrics.record_queue_timed_out(),
            Err(_) => self.metrics.record_queue_failed(),
        }
        entry.finish(outcome);
    }
}

// ── Public queue ────────────────────────────────────────────────────

pub struct OperationQueue {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl OperationQueue {
    /// Spawn `config.workers` workers on the current tokio runtime.
    pub fn start(
        config: QueueConfig,
        executor: Arc<dyn OperationExecutor>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            config,
            metrics,
        });

        let workers = (0..config.workers.max(1))
            .map(|worker| {
                let shared = shared.clone();
                let executor = executor.clone();
                tokio::spawn(worker_loop(worker, shared, executor))
            })
            .collect();

        info!(
            workers = config.workers,
            capacity = config.capacity,
            "operation queue started"
        );

        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    pub fn config(&self) -> QueueConfig {
        self.shared.config
    }

    /// Accept `task` or reject it immediately when the queue is full.
    pub fn submit(&self, task: OperationTask) -> Result<TaskHandle, QueueError> {
        let shared = &self.shared;
        let timeout = shared.budget(&task);
        let kind = task.operation.kind();
        let submitted_at = Instant::now();

        let mut state = shared.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        if state.entries.contains_key(&task.id) {
            drop(state);
            warn!(task_id = %task.id, kind = kind.as_str(), "duplicate task id refused");
            return Err(QueueError::Duplicate { task_id: task.id });
        }
        if state.queued >= shared.config.capacity {
            drop(state);
            shared.metrics.record_queue_rejected();
            warn!(
                task_id = %task.id,
                kind = kind.as_str(),
                status = TaskStatus::Rejected.as_str(),
                capacity = shared.config.capacity,
                "operation queue full, task rejected"
            );
            return Err(QueueError::Full {
                capacity: shared.config.capacity,
                task_id: task.id,
            });
        }

        let (status_tx, status_rx) = watch::channel(TaskStatus::Queued);
        let (result_tx, result_rx) = oneshot::channel();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(Reverse(Pending {
            priority: task.priority,
            seq,
            id: task.id.clone(),
        }));
        state.entries.insert(
            task.id.clone(),
            Entry {
                operation: Some(task.operation),
                timeout,
                status: status_tx,
                result: Some(result_tx),
            },
        );
        state.queued += 1;
        drop(state);

        shared.notify.notify_one();
        shared.metrics.record_queue_submitted();
        debug!(
            task_id = %task.id,
            kind = kind.as_str(),
            priority = task.priority,
            "task queued"
        );

        Ok(TaskHandle::new(
            task.id,
            kind,
            submitted_at,
            status_rx,
            result_rx,
            Arc::downgrade(shared),
        ))
    }

    /// Cancel a queued or running task. Returns `false` for unknown or
    /// already finished tasks.
    pub fn cancel(&self, task_id: &str) -> bool {
        self.shared.cancel(task_id)
    }

    pub fn status(&self, task_id: &str) -> Option<TaskStatus> {
        self.shared.lock().entries.get(task_id).map(Entry::current)
    }

    /// Tasks waiting for a worker.
    pub fn len(&self) -> usize {
        self.shared.lock().queued
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tasks currently held by a worker.
    pub fn running(&self) -> usize {
        self.shared.lock().running
    }

    /// Stop accepting work, cancel everything still queued and wait for the
    /// workers to finish their current task.
    pub async fn shutdown(&self) {
        self.close();
        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));
        for worker in workers {
            let _ = worker.await;
        }
        info!("operation queue stopped");
    }

    fn close(&self) {
        let mut state = self.shared.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        let queued: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| e.current() == TaskStatus::Queued)
            .map(|(id, _)| id.clone())
            .collect();
        let mut dropped = Vec::with_capacity(queued.len());
        for id in queued {
            if let Some(entry) = state.entries.remove(&id) {
                dropped.push(entry);
            }
        }
        state.queued = 0;
        state.heap.clear();
        drop(state);

        for mut entry in dropped {
            entry.advance(TaskStatus::Cancelled);
            entry.finish(Err(TaskError::Cancelled));
            self.shared.metrics.record_queue_cancelled();
        }
        self.shared.notify.notify_waiters();
    }
}

impl Drop for OperationQueue {
    fn drop(&mut self) {
        self.close();
    }
}

async fn worker_loop(worker: usize, shared: Arc<Shared>, executor: Arc<dyn OperationExecutor>) {
    debug!(worker, "queue worker started");
    while let Some(job) = shared.next().await {
        let started = Instant::now();
        let kind = job.operation.kind();
        debug!(worker, task_id = %job.id, kind = kind.as_str(), "task running");

        let outcome = match tokio::time::timeout(job.timeout, executor.execute(job.operation)).await
        {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(TaskError::Failed(e)),
            Err(_) => {
                warn!(
                    worker,
                    task_id = %job.id,
                    kind = kind.as_str(),
                    budget_ms = job.timeout.as_millis() as u64,
                    "task timed out"
                );
                Err(TaskError::Timeout(job.timeout))
            }
        };

        shared.metrics.task_latency.record(started.elapsed());
        shared.complete(&job.id, outcome);
    }
    debug!(worker, "queue worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use handover_common::protocol::TrainingRequest;

    struct Hang;

    #[async_trait]
    impl OperationExecutor for Hang {
        async fn execute(&self, _: Operation) -> Result<OperationOutput, PredictionError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn cancelled_tasks_leave_the_heap() {
        let cfg = QueueConfig {
            capacity: 2,
            workers: 1,
            ..QueueConfig::default()
        };
        let q = OperationQueue::start(cfg, Arc::new(Hang), Arc::new(EngineMetrics::new()));
        let mut busy = q.submit(OperationTask::train(TrainingRequest::new("busy"))).unwrap();
        while busy.status() != TaskStatus::Running {
            busy.changed().await;
        }

        for i in 0..1000 {
            let h = q
                .submit(OperationTask::train(TrainingRequest::new(format!("t{i}"))))
                .unwrap();
            assert!(h.cancel());
        }

        let state = q.shared.lock();
        assert_eq!(state.queued, 0);
        assert!(state.heap.is_empty(), "heap holds {} entries", state.heap.len());
        assert_eq!(state.entries.len(), 1);
    }

    #[test]
    fn pending_orders_by_priority_then_submission() {
        let mut heap = BinaryHeap::new();
        for (priority, seq, id) in [(5, 0, "a"), (1, 1, "b"), (5, 2, "c"), (1, 3, "d")] {
            heap.push(Reverse(Pending {
                priority,
                seq,
                id: id.into(),
            }));
        }
        let order: Vec<String> = std::iter::from_fn(|| heap.pop().map(|Reverse(p)| p.id)).collect();
        assert_eq!(order, ["b", "d", "a", "c"]);
    }
}
