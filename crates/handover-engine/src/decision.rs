//! Decision records and the sinks that receive them.
//!
//! A [`HandoverDecision`] is emitted for every `decide_and_apply` call,
//! including the ones that keep the UE where it is. The engine never reads
//! them back.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use handover_common::ids::decision_id;
use serde::Serialize;
use tracing::info;

use crate::metrics::EngineMetrics;
use crate::qos::QosCompliance;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionMethod {
    Ml,
    Rule,
    /// Neither path produced a move.
    None,
}

impl DecisionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionMethod::Ml => "ml",
            DecisionMethod::Rule => "rule",
            DecisionMethod::None => "none",
        }
    }
}

impl fmt::Display for DecisionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the ML suggestion was not used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    MlUnavailable,
    QosRejected,
    LowConfidence,
}

impl FallbackReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackReason::MlUnavailable => "ml_unavailable",
            FallbackReason::QosRejected => "qos_rejected",
            FallbackReason::LowConfidence => "low_confidence",
        }
    }
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HandoverDecision {
    pub id: String,
    pub ue_id: String,
    pub serving_cell_id: String,
    /// `None` means no change.
    pub target_cell_id: Option<String>,
    pub method: DecisionMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<FallbackReason>,
    /// Confidence of the prediction, when one was obtained.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qos: Option<QosCompliance>,
    pub decided_at: DateTime<Utc>,
}

impl HandoverDecision {
    pub fn new(ue_id: impl Into<String>, serving_cell_id: impl Into<String>) -> Self {
        Self {
            id: decision_id(),
            ue_id: ue_id.into(),
            serving_cell_id: serving_cell_id.into(),
            target_cell_id: None,
            method: DecisionMethod::None,
            fallback_reason: None,
            confidence: None,
            qos: None,
            decided_at: Utc::now(),
        }
    }

    /// Whether the UE is moved to a different cell.
    pub fn is_handover(&self) -> bool {
        self.target_cell_id
            .as_deref()
            .is_some_and(|t| t != self.serving_cell_id)
    }
}

/// Write-only destination for decision records.
pub trait DecisionSink: Send + Sync {
    fn record(&self, decision: &HandoverDecision);
}

impl<T: DecisionSink + ?Sized> DecisionSink for Arc<T> {
    fn record(&self, decision: &HandoverDecision) {
        (**self).record(decision)
    }
}

/// Logs every decision at INFO.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DecisionSink for TracingSink {
    fn record(&self, d: &HandoverDecision) {
        info!(
            decision_id = %d.id,
            ue_id = %d.ue_id,
            serving = %d.serving_cell_id,
            target = d.target_cell_id.as_deref().unwrap_or("-"),
            method = d.method.as_str(),
            fallback = d.fallback_reason.map(|r| r.as_str()).unwrap_or("-"),
            confidence = d.confidence,
            "handover decision"
        );
    }
}

/// Forwards decisions over a bounded crossbeam channel. A full or
/// disconnected channel drops the record and counts it.
pub struct ChannelSink {
    tx: Sender<HandoverDecision>,
    metrics: Option<Arc<EngineMetrics>>,
}

impl ChannelSink {
    pub fn bounded(capacity: usize) -> (Self, Receiver<HandoverDecision>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        (Self { tx, metrics: None }, rx)
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

impl DecisionSink for ChannelSink {
    fn record(&self, decision: &HandoverDecision) {
        match self.tx.try_send(decision.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                if let Some(m) = &self.metrics {
                    m.record_sink_dropped();
                }
            }
        }
    }
}

/// Keeps the most recent `capacity` decisions in memory.
pub struct MemorySink {
    capacity: usize,
    records: Mutex<VecDeque<HandoverDecision>>,
}

impl MemorySink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: Mutex::new(VecDeque::new()),
        }
    }

    pub fn records(&self) -> Vec<HandoverDecision> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn last(&self) -> Option<HandoverDecision> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .back()
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DecisionSink for MemorySink {
    fn record(&self, decision: &HandoverDecision) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(decision.clone());
    }
}
