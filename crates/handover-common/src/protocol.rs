//! Payloads exchanged with the external prediction provider.
//!
//! Requests are fully typed. Responses are deliberately loose (`Option`
//! everywhere, unknown fields ignored): the provider is a remote service we
//! do not control, so validation happens in the engine's prediction client
//! and nowhere else.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::{CellMeasurement, Position, QosRequirement, UeSnapshot};

// ── Auth ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoginResponse {
    pub access_token: Option<String>,
    pub token_type: Option<String>,
}

// ── Prediction ──────────────────────────────────────────────────────

/// Body of a prediction call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRequest {
    pub ue_id: String,
    pub connected_to: String,
    pub serving: CellMeasurement,
    pub neighbors: Vec<CellMeasurement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qos: Option<QosRequirement>,
}

impl From<&UeSnapshot> for PredictionRequest {
    fn from(snap: &UeSnapshot) -> Self {
        Self {
            ue_id: snap.ue_id.clone(),
            connected_to: snap.serving.cell_id.clone(),
            serving: snap.serving.clone(),
            neighbors: snap.neighbors.clone(),
            position: snap.position,
            qos: snap.qos.clone(),
        }
    }
}

/// Prediction response as received on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawPrediction {
    #[serde(alias = "predicted_cell", alias = "target_cell")]
    pub target_cell_id: Option<String>,
    pub confidence: Option<f64>,
    pub qos_compliance: Option<RawQosCompliance>,
}

/// QoS sub-record a provider may attach to its prediction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawQosCompliance {
    pub service_priority: Option<u8>,
    pub required_confidence: Option<f64>,
    pub observed_confidence: Option<f64>,
    pub priority_ok: Option<bool>,
}

// ── Training ────────────────────────────────────────────────────────

/// Request to retrain the provider's model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRequest {
    /// Model family understood by the provider (e.g. "lightgbm", "lstm").
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, serde_json::Value>,
}

impl TrainingRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            dataset: None,
            params: BTreeMap::new(),
        }
    }
}

/// Training response as received on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawTrainingReport {
    pub model_version: Option<String>,
    pub accuracy: Option<f64>,
    pub samples: Option<u64>,
}
