use std::fmt;
use std::sync::Weak;
use std::time::Duration;

use handover_common::ids::operation_id;
use handover_common::models::UeSnapshot;
use handover_common::protocol::TrainingRequest;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;

use super::Shared;
use crate::prediction::{PredictionError, PredictionResult, TrainingReport};

/// Lifecycle of a queued operation.
///
/// Moves forward only: `Queued → Running → {Completed | Failed | Cancelled}`,
/// or `Queued → Cancelled`. `Rejected` is assigned at submission and is
/// never preceded by `Queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Rejected,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Rejected
        )
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Queued, Running) | (Queued, Cancelled) | (Running, Completed | Failed | Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Prediction,
    Training,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Prediction => "prediction",
            OperationKind::Training => "training",
        }
    }
}

/// Work a queue worker hands to its executor.
#[derive(Debug, Clone)]
pub enum Operation {
    Predict(Box<UeSnapshot>),
    Train(TrainingRequest),
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Predict(_) => OperationKind::Prediction,
            Operation::Train(_) => OperationKind::Training,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutput {
    Prediction(PredictionResult),
    Training(TrainingReport),
}

/// A submission: the operation plus its scheduling parameters.
#[derive(Debug, Clone)]
pub struct OperationTask {
    pub id: String,
    pub operation: Operation,
    /// Lower is more urgent.
    pub priority: u8,
    /// Overrides the queue's per-kind budget when set.
    pub timeout: Option<Duration>,
}

impl OperationTask {
    pub const DEFAULT_PRIORITY: u8 = 5;
    /// Training yields to predictions by default.
    pub const TRAINING_PRIORITY: u8 = 8;

    pub fn new(operation: Operation) -> Self {
        Self {
            id: operation_id(),
            operation,
            priority: Self::DEFAULT_PRIORITY,
            timeout: None,
        }
    }

    pub fn predict(snapshot: UeSnapshot) -> Self {
        Self::new(Operation::Predict(Box::new(snapshot)))
    }

    pub fn train(request: TrainingRequest) -> Self {
        Self::new(Operation::Train(request)).with_priority(Self::TRAINING_PRIORITY)
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Why a task did not produce an output.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TaskError {
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("task was cancelled")]
    Cancelled,
    #[error("operation failed: {0}")]
    Failed(#[from] PredictionError),
    #[error("task was dropped before reporting a result")]
    Dropped,
}

pub type TaskResult = Result<OperationOutput, TaskError>;

/// Submitter's view of an accepted task.
///
/// Status changes can be polled with [`status`](Self::status) or awaited
/// with [`changed`](Self::changed); [`join`](Self::join) waits for the
/// result. Dropping the handle does not cancel the task.
pub struct TaskHandle {
    id: String,
    kind: OperationKind,
    submitted_at: Instant,
    status: watch::Receiver<TaskStatus>,
    result: oneshot::Receiver<TaskResult>,
    queue: Weak<Shared>,
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl TaskHandle {
    pub(super) fn new(
        id: String,
        kind: OperationKind,
        submitted_at: Instant,
        status: watch::Receiver<TaskStatus>,
        result: oneshot::Receiver<TaskResult>,
        queue: Weak<Shared>,
    ) -> Self {
        Self {
            id,
            kind,
            submitted_at,
            status,
            result,
            queue,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }

    pub fn status(&self) -> TaskStatus {
        *self.status.borrow()
    }

    /// Wait for the next status change and return the new status. Returns
    /// the current status immediately once it is terminal.
    pub async fn changed(&mut self) -> TaskStatus {
        let current = *self.status.borrow_and_update();
        if current.is_terminal() {
            return current;
        }
        match self.status.changed().await {
            Ok(()) => *self.status.borrow_and_update(),
            Err(_) => *self.status.borrow(),
        }
    }

    /// Wait until the task reaches a terminal status.
    pub async fn wait_terminal(&mut self) -> TaskStatus {
        loop {
            let status = self.changed().await;
            if status.is_terminal() || self.status.has_changed().is_err() {
                return status;
            }
        }
    }

    /// Best-effort cancellation; see [`OperationQueue::cancel`](super::OperationQueue::cancel).
    pub fn cancel(&self) -> bool {
        match self.queue.upgrade() {
            Some(shared) => shared.cancel(&self.id),
            None => false,
        }
    }

    /// Wait for the task's result.
    pub async fn join(self) -> TaskResult {
        self.result.await.unwrap_or(Err(TaskError::Dropped))
    }

    /// Wait at most `limit` for the result. On expiry the handle is handed
    /// back so the caller can keep waiting or walk away.
    pub async fn join_timeout(mut self, limit: Duration) -> Result<TaskResult, TaskHandle> {
        match tokio::time::timeout(limit, &mut self.result).await {
            Ok(r) => Ok(r.unwrap_or(Err(TaskError::Dropped))),
            Err(_) => Err(self),
        }
    }
}
