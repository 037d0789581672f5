//! Data models for the handover engine.
//!
//! A [`UeSnapshot`] is captured by an external collaborator on every
//! mobility tick and handed to the engine as-is. The engine never mutates
//! a snapshot; everything it derives lives in separate records.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Cell measurements ───────────────────────────────────────────────

/// RF view of one cell as seen by a UE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellMeasurement {
    pub cell_id: String,
    /// Reference Signal Received Power in dBm. Range: -140 to -44.
    pub rsrp_dbm: f64,
    /// Signal-to-Interference-plus-Noise Ratio in dB.
    #[serde(default)]
    pub sinr_db: f64,
    /// Cell load as a fraction of capacity [0, 1].
    #[serde(default)]
    pub load: f64,
}

impl CellMeasurement {
    pub fn new(cell_id: impl Into<String>, rsrp_dbm: f64) -> Self {
        Self {
            cell_id: cell_id.into(),
            rsrp_dbm,
            sinr_db: 0.0,
            load: 0.0,
        }
    }
}

/// Geographic position of a UE (WGS84).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    /// Ground speed in m/s, when the mobility source knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_mps: Option<f64>,
}

// ── QoS ─────────────────────────────────────────────────────────────

/// Service class declared by the UE's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    BestEffort,
    Embb,
    Video,
    Voice,
    Mmtc,
    Urllc,
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceType::BestEffort => write!(f, "best_effort"),
            ServiceType::Embb => write!(f, "embb"),
            ServiceType::Video => write!(f, "video"),
            ServiceType::Voice => write!(f, "voice"),
            ServiceType::Mmtc => write!(f, "mmtc"),
            ServiceType::Urllc => write!(f, "urllc"),
        }
    }
}

impl std::str::FromStr for ServiceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "best_effort" => Ok(ServiceType::BestEffort),
            "embb" => Ok(ServiceType::Embb),
            "video" => Ok(ServiceType::Video),
            "voice" => Ok(ServiceType::Voice),
            "mmtc" => Ok(ServiceType::Mmtc),
            "urllc" => Ok(ServiceType::Urllc),
            other => Err(format!("unknown service type: {other}")),
        }
    }
}

/// QoS requirement declared for a UE session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QosRequirement {
    pub service_type: ServiceType,
    /// 1 (best-effort) to 10 (mission-critical). Out-of-range values are
    /// clamped by the consumer, not rejected.
    pub priority: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throughput_mbps: Option<f64>,
    /// Target reliability in percent (e.g. 99.999).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reliability_pct: Option<f64>,
}

// ── UE snapshot ─────────────────────────────────────────────────────

/// Immutable per-tick view of one UE: where it is attached, what it hears,
/// and what its session asks for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UeSnapshot {
    pub ue_id: String,
    pub serving: CellMeasurement,
    #[serde(default)]
    pub neighbors: Vec<CellMeasurement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qos: Option<QosRequirement>,
    #[serde(default = "Utc::now")]
    pub captured_at: DateTime<Utc>,
}

impl UeSnapshot {
    pub fn new(ue_id: impl Into<String>, serving: CellMeasurement) -> Self {
        Self {
            ue_id: ue_id.into(),
            serving,
            neighbors: Vec::new(),
            position: None,
            qos: None,
            captured_at: Utc::now(),
        }
    }

    pub fn with_neighbor(mut self, neighbor: CellMeasurement) -> Self {
        self.neighbors.push(neighbor);
        self
    }

    pub fn with_qos(mut self, qos: QosRequirement) -> Self {
        self.qos = Some(qos);
        self
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.position = Some(position);
        self
    }

    pub fn serving_cell_id(&self) -> &str {
        &self.serving.cell_id
    }

    /// Number of distinct cells visible in this snapshot, serving included.
    pub fn known_cell_count(&self) -> usize {
        let mut ids: HashSet<&str> = HashSet::with_capacity(self.neighbors.len() + 1);
        ids.insert(self.serving.cell_id.as_str());
        for n in &self.neighbors {
            ids.insert(n.cell_id.as_str());
        }
        ids.len()
    }

    /// The declared service priority, if the session declared one.
    pub fn declared_priority(&self) -> Option<u8> {
        self.qos.as_ref().map(|q| q.priority)
    }
}
