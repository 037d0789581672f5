//! # Prediction
//!
//! Contract with the remote prediction provider and the client that guards
//! it. Everything past [`PredictionClient`] sees only validated
//! [`PredictionResult`]s; raw provider payloads never leave this module.

pub mod client;
pub mod http;

use std::time::Duration;

use async_trait::async_trait;
use handover_common::protocol::{
    PredictionRequest, RawPrediction, RawQosCompliance, RawTrainingReport, TrainingRequest,
};
use serde::Serialize;
use thiserror::Error;

use crate::breaker::{BreakerError, CircuitOpen, FailureKind};

pub use client::PredictionClient;
pub use http::HttpPredictionProvider;

// ── Errors ──────────────────────────────────────────────────────────

/// Transport/availability failures. These, and only these, count toward a
/// circuit breaker's failure threshold.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportFailure {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("server error: HTTP {0}")]
    ServerError(u16),
}

/// Errors a provider implementation may return.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    #[error("transport failure: {0}")]
    Transport(#[from] TransportFailure),
    #[error("provider session is not authorized")]
    Unauthorized,
    #[error("request rejected (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl FailureKind for ProviderError {
    fn trips_breaker(&self) -> bool {
        matches!(self, ProviderError::Transport(_))
    }
}

/// Errors surfaced by [`PredictionClient`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PredictionError {
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpen),
    #[error("transport failure: {0}")]
    Transport(TransportFailure),
    #[error("provider session is not authorized")]
    Unauthorized,
    #[error("request rejected (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl From<ProviderError> for PredictionError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::Transport(t) => PredictionError::Transport(t),
            ProviderError::Unauthorized => PredictionError::Unauthorized,
            ProviderError::Rejected { status, message } => {
                PredictionError::Rejected { status, message }
            }
            ProviderError::Malformed(m) => PredictionError::MalformedResponse(m),
        }
    }
}

impl From<BreakerError<ProviderError>> for PredictionError {
    fn from(e: BreakerError<ProviderError>) -> Self {
        match e {
            BreakerError::Open(open) => PredictionError::CircuitOpen(open),
            BreakerError::Inner(inner) => inner.into(),
        }
    }
}

impl PredictionError {
    /// Short label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            PredictionError::CircuitOpen(_) => "circuit_open",
            PredictionError::Transport(TransportFailure::Timeout(_)) => "timeout",
            PredictionError::Transport(_) => "transport",
            PredictionError::Unauthorized => "unauthorized",
            PredictionError::Rejected { .. } => "rejected",
            PredictionError::MalformedResponse(_) => "malformed",
        }
    }
}

// ── Provider contract ───────────────────────────────────────────────

/// A remote service that suggests target cells and retrains its model.
#[async_trait]
pub trait PredictionProvider: Send + Sync {
    /// Whether [`login`](Self::login) must succeed before API calls.
    fn requires_login(&self) -> bool {
        false
    }

    async fn login(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn predict(&self, request: &PredictionRequest) -> Result<RawPrediction, ProviderError>;

    async fn train(&self, request: &TrainingRequest) -> Result<RawTrainingReport, ProviderError>;
}

// ── Validated results ───────────────────────────────────────────────

/// QoS context a provider attached to its prediction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderQos {
    pub service_priority: Option<u8>,
    pub required_confidence: Option<f64>,
    /// The provider's own verdict. Informational only; compliance is
    /// recomputed locally.
    pub priority_ok: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionResult {
    pub target_cell_id: String,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qos: Option<ProviderQos>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingReport {
    pub model_version: String,
    pub accuracy: Option<f64>,
    pub samples: u64,
}

fn probability(field: &str, v: Option<f64>) -> Result<Option<f64>, ProviderError> {
    match v {
        None => Ok(None),
        Some(x) if x.is_finite() && (0.0..=1.0).contains(&x) => Ok(Some(x)),
        Some(x) => Err(ProviderError::Malformed(format!(
            "{field} {x} is outside [0, 1]"
        ))),
    }
}

impl TryFrom<RawQosCompliance> for ProviderQos {
    type Error = ProviderError;

    fn try_from(raw: RawQosCompliance) -> Result<Self, Self::Error> {
        if let Some(p) = raw.service_priority {
            if !(1..=10).contains(&p) {
                return Err(ProviderError::Malformed(format!(
                    "qos_compliance.service_priority {p} is outside 1-10"
                )));
            }
        }
        probability("qos_compliance.observed_confidence", raw.observed_confidence)?;
        Ok(ProviderQos {
            service_priority: raw.service_priority,
            required_confidence: probability(
                "qos_compliance.required_confidence",
                raw.required_confidence,
            )?,
            priority_ok: raw.priority_ok,
        })
    }
}

impl TryFrom<RawPrediction> for PredictionResult {
    type Error = ProviderError;

    fn try_from(raw: RawPrediction) -> Result<Self, Self::Error> {
        let target_cell_id = raw
            .target_cell_id
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ProviderError::Malformed("missing target cell id".into()))?;
        let confidence = probability("confidence", raw.confidence)?
            .ok_or_else(|| ProviderError::Malformed("missing confidence".into()))?;
        let qos = raw.qos_compliance.map(ProviderQos::try_from).transpose()?;
        Ok(PredictionResult {
            target_cell_id,
            confidence,
            qos,
        })
    }
}

impl TryFrom<RawTrainingReport> for TrainingReport {
    type Error = ProviderError;

    fn try_from(raw: RawTrainingReport) -> Result<Self, Self::Error> {
        let model_version = raw
            .model_version
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ProviderError::Malformed("missing model version".into()))?;
        Ok(TrainingReport {
            model_version,
            accuracy: probability("accuracy", raw.accuracy)?,
            samples: raw.samples.unwrap_or(0),
        })
    }
}
