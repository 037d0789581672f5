//! # Integration tests: operation queue
//!
//! A recording executor stands in for the prediction client. Operations are
//! training requests whose model name doubles as a label:
//!
//! - `block*` waits until the test releases the gate
//! - `hang*` never finishes on its own
//! - `fail*` returns an error
//! - anything else completes immediately

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use handover_common::protocol::TrainingRequest;
use handover_engine::config::QueueConfig;
use handover_engine::metrics::EngineMetrics;
use handover_engine::prediction::{PredictionError, TrainingReport};
use handover_engine::queue::{
    Operation, OperationExecutor, OperationOutput, OperationQueue, OperationTask, QueueError,
    TaskError, TaskHandle, TaskStatus,
};
use tokio::sync::Semaphore;

// ─── Helpers ────────────────────────────────────────────────────────────────

struct Recorder {
    started: Mutex<Vec<String>>,
    gate: Semaphore,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            started: Mutex::new(Vec::new()),
            gate: Semaphore::new(0),
        })
    }

    fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }
}

#[async_trait]
impl OperationExecutor for Recorder {
    async fn execute(&self, operation: Operation) -> Result<OperationOutput, PredictionError> {
        let label = match &operation {
            Operation::Train(r) => r.model.clone(),
            Operation::Predict(s) => s.ue_id.clone(),
        };
        self.started.lock().unwrap().push(label.clone());

        if label.starts_with("block") {
            self.gate.acquire().await.unwrap().forget();
        } else if label.starts_with("hang") {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        } else if label.starts_with("fail") {
            return Err(PredictionError::Unauthorized);
        }

        Ok(OperationOutput::Training(TrainingReport {
            model_version: label,
            accuracy: None,
            samples: 0,
        }))
    }
}

fn queue(workers: usize, capacity: usize) -> (OperationQueue, Arc<Recorder>, Arc<EngineMetrics>) {
    let recorder = Recorder::new();
    let metrics = Arc::new(EngineMetrics::new());
    let cfg = QueueConfig {
        capacity,
        workers,
        prediction_timeout: Duration::from_secs(2),
        training_timeout: Duration::from_secs(30),
    };
    let q = OperationQueue::start(cfg, recorder.clone(), metrics.clone());
    (q, recorder, metrics)
}

fn task(label: &str, priority: u8) -> OperationTask {
    OperationTask::train(TrainingRequest::new(label)).with_priority(priority)
}

async fn wait_for(handle: &mut TaskHandle, status: TaskStatus) {
    while handle.status() != status {
        let now = handle.changed().await;
        assert!(
            !now.is_terminal() || now == status,
            "task reached {now} while waiting for {status}"
        );
    }
}

fn label(output: OperationOutput) -> String {
    match output {
        OperationOutput::Training(r) => r.model_version,
        other => panic!("unexpected output {other:?}"),
    }
}

// ─── Ordering ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn lowest_priority_number_runs_first_with_fifo_ties() {
    let (q, recorder, _) = queue(1, 100);
    let mut blocker = q.submit(task("block", 0)).unwrap();
    wait_for(&mut blocker, TaskStatus::Running).await;

    let handles: Vec<_> = [("a", 5), ("b", 1), ("c", 5), ("d", 1), ("e", 3)]
        .into_iter()
        .map(|(l, p)| q.submit(task(l, p)).unwrap())
        .collect();
    assert_eq!(q.len(), 5);

    recorder.release(1);
    blocker.join().await.unwrap();
    for h in handles {
        h.join().await.unwrap();
    }

    assert_eq!(recorder.started(), ["block", "b", "d", "e", "a", "c"]);
}

#[tokio::test]
async fn status_transitions_are_observable() {
    let (q, recorder, _) = queue(1, 10);
    let mut h = q.submit(task("block", 1)).unwrap();
    assert!(h.id().starts_with("op_"));

    let mut seen = vec![h.status()];
    loop {
        let s = h.changed().await;
        if seen.last() != Some(&s) {
            seen.push(s);
        }
        if s == TaskStatus::Running {
            recorder.release(1);
        }
        if s.is_terminal() {
            break;
        }
    }
    assert_eq!(
        seen,
        [TaskStatus::Queued, TaskStatus::Running, TaskStatus::Completed]
    );
    assert_eq!(label(h.join().await.unwrap()), "block");
}

// ─── Backpressure ───────────────────────────────────────────────────────────

#[tokio::test]
async fn submissions_past_capacity_are_rejected() {
    let (q, recorder, metrics) = queue(1, 3);
    let mut blocker = q.submit(task("block", 0)).unwrap();
    wait_for(&mut blocker, TaskStatus::Running).await;

    let accepted: Vec<_> = (0..3)
        .map(|i| q.submit(task(&format!("ok-{i}"), 5)).unwrap())
        .collect();

    for i in 0..2 {
        let t = task(&format!("over-{i}"), 1);
        let id = t.id.clone();
        match q.submit(t) {
            Err(QueueError::Full { capacity, task_id }) => {
                assert_eq!(capacity, 3);
                assert_eq!(task_id, id);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }
    assert_eq!(metrics.counters().queue_rejected, 2);
    assert_eq!(q.len(), 3);

    // Every accepted task still reaches a terminal status.
    recorder.release(1);
    blocker.join().await.unwrap();
    for mut h in accepted {
        assert_eq!(h.wait_terminal().await, TaskStatus::Completed);
    }
    assert!(!recorder.started().iter().any(|l| l.starts_with("over")));
    assert_eq!(metrics.counters().queue_completed, 4);
}

#[tokio::test]
async fn duplicate_live_id_is_refused() {
    let (q, recorder, metrics) = queue(1, 10);
    let mut blocker = q.submit(task("block", 0)).unwrap();
    wait_for(&mut blocker, TaskStatus::Running).await;

    let mut first = task("first", 1);
    first.id = "dup".into();
    let first = q.submit(first).unwrap();

    let mut second = task("second", 1);
    second.id = "dup".into();
    assert_eq!(
        q.submit(second).unwrap_err(),
        QueueError::Duplicate {
            task_id: "dup".into()
        }
    );
    // A running task's id is live too.
    let mut clash = task("clash", 1);
    clash.id = blocker.id().to_string();
    assert!(matches!(q.submit(clash), Err(QueueError::Duplicate { .. })));
    assert_eq!(q.len(), 1);

    recorder.release(1);
    blocker.join().await.unwrap();
    assert_eq!(label(first.join().await.unwrap()), "first");
    assert_eq!(recorder.started(), ["block", "first"]);
    assert_eq!(q.len(), 0);
    assert_eq!(q.running(), 0);
    assert_eq!(metrics.counters().queue_submitted, 2);

    // Once finished, the id may be reused.
    let mut again = task("again", 1);
    again.id = "dup".into();
    assert_eq!(label(q.submit(again).unwrap().join().await.unwrap()), "again");
}

#[tokio::test(start_paused = true)]
async fn every_accepted_task_reaches_a_terminal_status() {
    let (q, recorder, metrics) = queue(2, 8);
    let labels = [
        "ok-0", "fail-0", "hang-0", "ok-1", "block-0", "victim", "ok-2", "fail-1",
    ];
    let mut handles: Vec<_> = labels
        .iter()
        .map(|l| {
            q.submit(task(l, 3).with_timeout(Duration::from_millis(50)))
                .unwrap()
        })
        .collect();
    for i in 0..4 {
        assert!(matches!(
            q.submit(task(&format!("over-{i}"), 1)),
            Err(QueueError::Full { .. })
        ));
    }
    assert!(handles[5].cancel());
    recorder.release(1);

    let mut finished = Vec::new();
    for h in handles.iter_mut() {
        finished.push(h.wait_terminal().await);
    }
    assert!(finished.iter().all(|s| s.is_terminal()));
    assert_eq!(finished[5], TaskStatus::Cancelled);
    assert_eq!(finished[2], TaskStatus::Failed);

    let c = metrics.counters();
    assert_eq!(c.queue_submitted, labels.len() as u64);
    assert_eq!(c.queue_rejected, 4);
    assert_eq!(
        c.queue_completed + c.queue_failed + c.queue_timed_out + c.queue_cancelled,
        labels.len() as u64
    );
    assert_eq!(q.len(), 0);
    assert_eq!(q.running(), 0);
}

// ─── Deadlines ──────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn timed_out_task_fails_and_frees_the_worker() {
    let (q, _recorder, metrics) = queue(1, 10);
    let mut hung = q
        .submit(task("hang", 1).with_timeout(Duration::from_millis(100)))
        .unwrap();
    let next = q.submit(task("after", 2)).unwrap();

    assert_eq!(hung.wait_terminal().await, TaskStatus::Failed);
    assert_eq!(
        hung.join().await.unwrap_err(),
        TaskError::Timeout(Duration::from_millis(100))
    );
    assert_eq!(label(next.join().await.unwrap()), "after");
    assert_eq!(metrics.counters().queue_timed_out, 1);
}

#[tokio::test(start_paused = true)]
async fn kind_budget_applies_without_override() {
    let (q, _recorder, _) = queue(1, 10);
    let started = tokio::time::Instant::now();
    let err = q.submit(task("hang", 1)).unwrap().join().await.unwrap_err();
    assert_eq!(err, TaskError::Timeout(Duration::from_secs(30)));
    assert!(started.elapsed() >= Duration::from_secs(30));
}

#[tokio::test]
async fn executor_errors_fail_the_task() {
    let (q, _recorder, metrics) = queue(2, 10);
    let mut h = q.submit(task("fail", 1)).unwrap();
    assert_eq!(h.wait_terminal().await, TaskStatus::Failed);
    assert_eq!(
        h.join().await.unwrap_err(),
        TaskError::Failed(PredictionError::Unauthorized)
    );
    assert_eq!(metrics.counters().queue_failed, 1);
}

#[tokio::test(start_paused = true)]
async fn join_timeout_returns_the_handle() {
    let (q, recorder, _) = queue(1, 10);
    let h = q.submit(task("block", 1)).unwrap();

    let h = match h.join_timeout(Duration::from_millis(10)).await {
        Err(h) => h,
        Ok(r) => panic!("blocked task finished early: {r:?}"),
    };
    recorder.release(1);
    let result = h.join_timeout(Duration::from_secs(1)).await.unwrap();
    assert_eq!(label(result.unwrap()), "block");
}

// ─── Cancellation ───────────────────────────────────────────────────────────

#[tokio::test]
async fn cancelling_a_queued_task_removes_it() {
    let (q, recorder, metrics) = queue(1, 10);
    let mut blocker = q.submit(task("block", 0)).unwrap();
    wait_for(&mut blocker, TaskStatus::Running).await;

    let victim = q.submit(task("victim", 1)).unwrap();
    let survivor = q.submit(task("survivor", 2)).unwrap();
    assert!(victim.cancel());
    assert!(!q.cancel(victim.id()), "second cancel is a no-op");
    assert_eq!(victim.status(), TaskStatus::Cancelled);
    assert_eq!(q.len(), 1);

    recorder.release(1);
    assert_eq!(label(survivor.join().await.unwrap()), "survivor");
    assert_eq!(victim.join().await.unwrap_err(), TaskError::Cancelled);
    assert_eq!(recorder.started(), ["block", "survivor"]);
    assert_eq!(metrics.counters().queue_cancelled, 1);
}

#[tokio::test]
async fn cancelling_a_running_task_discards_its_result() {
    let (q, recorder, metrics) = queue(1, 10);
    let mut running = q.submit(task("block", 0)).unwrap();
    wait_for(&mut running, TaskStatus::Running).await;
    let next = q.submit(task("next", 1)).unwrap();

    assert!(q.cancel(running.id()));
    assert_eq!(running.status(), TaskStatus::Cancelled);

    recorder.release(1);
    assert_eq!(label(next.join().await.unwrap()), "next");
    assert_eq!(running.join().await.unwrap_err(), TaskError::Cancelled);
    let counters = metrics.counters();
    assert_eq!(counters.queue_cancelled, 1);
    assert_eq!(counters.queue_completed, 1);
}

#[tokio::test]
async fn unknown_or_finished_tasks_cannot_be_cancelled() {
    let (q, _recorder, _) = queue(1, 10);
    assert!(!q.cancel("op_missing"));
    let mut h = q.submit(task("quick", 1)).unwrap();
    assert_eq!(h.wait_terminal().await, TaskStatus::Completed);
    assert!(!h.cancel());
}

// ─── Pool & lifecycle ───────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn workers_run_in_parallel() {
    let (q, recorder, _) = queue(4, 10);
    let mut handles: Vec<_> = (0..4)
        .map(|i| q.submit(task(&format!("block-{i}"), 1)).unwrap())
        .collect();
    for h in handles.iter_mut() {
        wait_for(h, TaskStatus::Running).await;
    }
    assert_eq!(q.running(), 4);
    assert_eq!(q.len(), 0);

    recorder.release(4);
    for h in handles {
        h.join().await.unwrap();
    }
    assert_eq!(q.running(), 0);
}

#[tokio::test]
async fn shutdown_cancels_pending_and_refuses_new_work() {
    let (q, recorder, _) = queue(1, 10);
    let mut blocker = q.submit(task("block", 0)).unwrap();
    wait_for(&mut blocker, TaskStatus::Running).await;
    let pending = q.submit(task("pending", 1)).unwrap();

    recorder.release(1);
    q.shutdown().await;

    assert_eq!(pending.join().await.unwrap_err(), TaskError::Cancelled);
    assert!(matches!(q.submit(task("late", 1)), Err(QueueError::Closed)));
}
