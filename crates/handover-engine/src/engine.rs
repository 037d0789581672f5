//! # Handover Decision Engine
//!
//! One decision per mobility event. ML first, A3 rule as the safety net:
//!
//! ```text
//!  snapshot ──► ML enabled? ──no──────────────────────────► A3 rule
//!                  │yes
//!                  ▼
//!              prediction ──error / circuit open / timeout──► A3 rule (ml_unavailable)
//!                  │ok
//!                  ▼
//!              QoS context? ──yes──► compliant? ──no────────► A3 rule (qos_rejected)
//!                  │no                    │yes
//!                  ▼                      ▼
//!              conf ≥ threshold? ──no─────┼─────────────────► A3 rule (low_confidence)
//!                  │yes                   │
//!                  └──────────► apply ML target ◄─────────────┘
//! ```
//!
//! Every path ends in exactly one [`HandoverDecision`] handed to the sink,
//! and no failure below this layer ever reaches the caller.

use std::sync::Arc;

use handover_common::models::UeSnapshot;
use handover_common::protocol::TrainingRequest;
use quanta::Clock;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{Dispatch, EngineConfig, MlMode};
use crate::decision::{DecisionMethod, DecisionSink, FallbackReason, HandoverDecision};
use crate::metrics::{EngineMetrics, MetricsSnapshot, MetricsSource};
use crate::prediction::{PredictionClient, PredictionError, PredictionProvider, PredictionResult};
use crate::qos::QosComplianceEvaluator;
use crate::queue::{
    OperationExecutor, OperationOutput, OperationQueue, OperationTask, QueueError, TaskError,
    TaskHandle,
};
use crate::rule::RuleEvaluator;

/// Why no usable prediction was obtained.
#[derive(Debug, Error)]
enum Unavailable {
    #[error(transparent)]
    Prediction(#[from] PredictionError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error("queued prediction produced a training report")]
    UnexpectedOutput,
}

pub struct HandoverEngine {
    config: EngineConfig,
    client: Arc<PredictionClient>,
    queue: OperationQueue,
    rule: RuleEvaluator,
    qos: QosComplianceEvaluator,
    sink: Arc<dyn DecisionSink>,
    metrics: Arc<EngineMetrics>,
    clock: Clock,
}

impl HandoverEngine {
    /// Build the engine and start its queue workers. Must be called from
    /// within a tokio runtime.
    pub fn new(
        config: EngineConfig,
        provider: Arc<dyn PredictionProvider>,
        sink: Arc<dyn DecisionSink>,
    ) -> Self {
        Self::with_clock(config, provider, sink, Clock::new())
    }

    /// Same as [`new`](Self::new) with an injected clock for breaker and
    /// time-to-trigger timing.
    pub fn with_clock(
        config: EngineConfig,
        provider: Arc<dyn PredictionProvider>,
        sink: Arc<dyn DecisionSink>,
        clock: Clock,
    ) -> Self {
        let metrics = Arc::new(EngineMetrics::new());
        let client = Arc::new(PredictionClient::with_clock(
            provider,
            &config,
            metrics.clone(),
            clock.clone(),
        ));
        let executor: Arc<dyn OperationExecutor> = client.clone();
        let queue = OperationQueue::start(config.queue, executor, metrics.clone());

        Self {
            rule: RuleEvaluator::with_clock(config.rule.clone(), clock.clone()),
            qos: QosComplianceEvaluator::new(config.qos, config.ml.default_priority),
            client,
            queue,
            sink,
            metrics,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn client(&self) -> &PredictionClient {
        &self.client
    }

    pub fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    pub fn rule(&self) -> &RuleEvaluator {
        &self.rule
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    /// Whether the provider is consulted for this snapshot.
    pub fn ml_enabled_for(&self, snapshot: &UeSnapshot) -> bool {
        match self.config.ml.mode {
            MlMode::Enabled => true,
            MlMode::Disabled => false,
            MlMode::Auto => snapshot.known_cell_count() >= self.config.ml.min_cells,
        }
    }

    /// Decide and apply a handover for one UE. Always returns a decision;
    /// the worst case is "no change".
    pub async fn decide_and_apply(&self, snapshot: &UeSnapshot) -> HandoverDecision {
        let start = self.clock.now();
        let mut decision = HandoverDecision::new(&snapshot.ue_id, snapshot.serving_cell_id());
        debug!(
            ue_id = %snapshot.ue_id,
            serving = %snapshot.serving.cell_id,
            neighbors = snapshot.neighbors.len(),
            "deciding"
        );

        if !self.ml_enabled_for(snapshot) {
            debug!(ue_id = %snapshot.ue_id, "ML disabled for snapshot, using A3 rule");
            self.apply_rule(&mut decision, snapshot);
        } else {
            match self.fetch_prediction(snapshot).await {
                Ok(prediction) => self.arbitrate(&mut decision, snapshot, prediction),
                Err(e) => {
                    warn!(ue_id = %snapshot.ue_id, error = %e, "ML unavailable, falling back to A3 rule");
                    self.fall_back(&mut decision, snapshot, FallbackReason::MlUnavailable);
                }
            }
        }

        let applied = decision.is_handover();
        if applied {
            // Trigger timers were measured against the old serving cell.
            self.rule.forget(&snapshot.ue_id);
        }
        self.metrics.record_decision(decision.method, applied);
        self.metrics
            .decision_latency
            .record(self.clock.now().saturating_duration_since(start));
        self.sink.record(&decision);
        decision
    }

    /// Gate a successful prediction on QoS compliance or raw confidence.
    fn arbitrate(
        &self,
        decision: &mut HandoverDecision,
        snapshot: &UeSnapshot,
        prediction: PredictionResult,
    ) {
        decision.confidence = Some(prediction.confidence);

        if snapshot.qos.is_some() || prediction.qos.is_some() {
            let compliance = self.qos.evaluate_service(
                prediction.confidence,
                snapshot.declared_priority(),
                snapshot.qos.as_ref().map(|q| q.service_type),
            );
            if let Some(claimed) = prediction.qos.as_ref().and_then(|q| q.priority_ok) {
                if claimed != compliance.priority_ok {
                    debug!(
                        ue_id = %snapshot.ue_id,
                        claimed,
                        computed = compliance.priority_ok,
                        "provider QoS verdict disagrees with local evaluation"
                    );
                }
            }
            self.metrics.record_qos(compliance.priority_ok);
            let ok = compliance.priority_ok;
            decision.qos = Some(compliance);
            if !ok {
                self.fall_back(decision, snapshot, FallbackReason::QosRejected);
                return;
            }
        } else if prediction.confidence < self.config.ml.confidence_threshold {
            self.fall_back(decision, snapshot, FallbackReason::LowConfidence);
            return;
        }

        if prediction.target_cell_id == snapshot.serving.cell_id {
            decision.method = DecisionMethod::None;
            decision.target_cell_id = None;
        } else {
            decision.method = DecisionMethod::Ml;
            decision.target_cell_id = Some(prediction.target_cell_id);
        }
    }

    fn fall_back(
        &self,
        decision: &mut HandoverDecision,
        snapshot: &UeSnapshot,
        reason: FallbackReason,
    ) {
        debug!(ue_id = %snapshot.ue_id, reason = reason.as_str(), "falling back to A3 rule");
        self.metrics.record_fallback(reason);
        decision.fallback_reason = Some(reason);
        self.apply_rule(decision, snapshot);
    }

    fn apply_rule(&self, decision: &mut HandoverDecision, snapshot: &UeSnapshot) {
        match self.rule.evaluate_snapshot(snapshot) {
            Some(target) => {
                decision.method = DecisionMethod::Rule;
                decision.target_cell_id = Some(target);
            }
            None => {
                decision.method = DecisionMethod::None;
                decision.target_cell_id = None;
            }
        }
    }

    async fn fetch_prediction(&self, snapshot: &UeSnapshot) -> Result<PredictionResult, Unavailable> {
        match self.config.ml.dispatch {
            Dispatch::Direct => Ok(self.client.predict(snapshot).await?),
            Dispatch::Queued => {
                let handle = self.submit_prediction(snapshot.clone())?;
                match handle.join().await? {
                    OperationOutput::Prediction(p) => Ok(p),
                    OperationOutput::Training(_) => Err(Unavailable::UnexpectedOutput),
                }
            }
        }
    }

    /// Queue a prediction without waiting for it. Urgency follows the UE's
    /// QoS priority: priority 10 runs first.
    pub fn submit_prediction(&self, snapshot: UeSnapshot) -> Result<TaskHandle, QueueError> {
        let priority = queue_priority(
            snapshot
                .declared_priority()
                .unwrap_or(self.qos.default_priority()),
        );
        self.queue
            .submit(OperationTask::predict(snapshot).with_priority(priority))
    }

    /// Queue a model training job.
    pub fn submit_training(&self, request: TrainingRequest) -> Result<TaskHandle, QueueError> {
        self.queue.submit(OperationTask::train(request))
    }

    /// Stop the queue workers after their current task.
    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
    }
}

/// Map a QoS priority (10 = most critical) to a queue priority (lower runs
/// first).
pub fn queue_priority(qos_priority: u8) -> u8 {
    11 - qos_priority.clamp(1, 10)
}

impl MetricsSource for HandoverEngine {
    fn metrics_snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.metrics.counters(),
            breakers: vec![
                self.client.login_breaker().snapshot(),
                self.client.api_breaker().snapshot(),
            ],
            queue_pending: self.queue.len(),
            queue_running: self.queue.running(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_priority_inverts_qos_priority() {
        assert_eq!(queue_priority(10), 1);
        assert_eq!(queue_priority(1), 10);
        assert_eq!(queue_priority(5), 6);
        assert_eq!(queue_priority(0), 10);
        assert_eq!(queue_priority(200), 1);
    }
}
