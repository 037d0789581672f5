//! QoS compliance gating.
//!
//! Maps a declared service priority to the confidence an ML prediction must
//! reach before the engine is allowed to act on it:
//!
//! $$\text{required}(p) = \text{min} + (\text{clamp}(p, 1, 10) - 1) \cdot \frac{\text{max} - \text{min}}{9}$$
//!
//! With the default policy, priority 1 requires 0.50 and priority 10 requires 0.95.

use handover_common::models::ServiceType;
use serde::Serialize;

use crate::config::QosConfig;

/// Outcome of judging one prediction against one UE's QoS requirement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QosCompliance {
    pub priority_ok: bool,
    pub required_confidence: f64,
    pub observed_confidence: f64,
    /// Priority used for the mapping, after clamping / defaulting.
    pub service_priority: u8,
    /// `false` when the default priority stood in for an undeclared one.
    pub declared: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_type: Option<ServiceType>,
}

/// Pure evaluator; holds only policy.
#[derive(Debug, Clone, Copy)]
pub struct QosComplianceEvaluator {
    policy: QosConfig,
    default_priority: u8,
}

impl Default for QosComplianceEvaluator {
    fn default() -> Self {
        Self::new(QosConfig::default(), 5)
    }
}

impl QosComplianceEvaluator {
    pub fn new(policy: QosConfig, default_priority: u8) -> Self {
        Self {
            policy,
            default_priority: default_priority.clamp(1, 10),
        }
    }

    pub fn default_priority(&self) -> u8 {
        self.default_priority
    }

    /// Required confidence for a priority (clamped to 1–10). Monotonically
    /// non-decreasing in `priority`.
    pub fn required_confidence(&self, priority: u8) -> f64 {
        let p = priority.clamp(1, 10);
        if p == 10 {
            return self.policy.max_required;
        }
        let span = self.policy.max_required - self.policy.min_required;
        self.policy.min_required + span * f64::from(p - 1) / 9.0
    }

    /// Judge `confidence` against `priority` (the default priority applies
    /// when `None`).
    pub fn evaluate(&self, confidence: f64, priority: Option<u8>) -> QosCompliance {
        self.evaluate_service(confidence, priority, None)
    }

    pub fn evaluate_service(
        &self,
        confidence: f64,
        priority: Option<u8>,
        service_type: Option<ServiceType>,
    ) -> QosCompliance {
        let service_priority = priority.unwrap_or(self.default_priority).clamp(1, 10);
        let required_confidence = self.required_confidence(service_priority);
        QosCompliance {
            // NaN never satisfies the comparison.
            priority_ok: confidence >= required_confidence,
            required_confidence,
            observed_confidence: confidence,
            service_priority,
            declared: priority.is_some(),
            service_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_match_default_policy() {
        let q = QosComplianceEvaluator::default();
        assert!((q.required_confidence(1) - 0.50).abs() < 1e-12);
        assert!((q.required_confidence(10) - 0.95).abs() < 1e-12);
        assert!((q.required_confidence(9) - 0.90).abs() < 1e-9);
        assert!((q.required_confidence(5) - 0.70).abs() < 1e-9);
    }

    #[test]
    fn out_of_range_priorities_are_clamped() {
        let q = QosComplianceEvaluator::default();
        assert_eq!(q.required_confidence(0), q.required_confidence(1));
        assert_eq!(q.required_confidence(200), q.required_confidence(10));
        assert_eq!(q.evaluate(0.99, Some(42)).service_priority, 10);
    }

    #[test]
    fn priority_nine_rejects_point_six() {
        let q = QosComplianceEvaluator::default();
        let c = q.evaluate(0.6, Some(9));
        assert!(!c.priority_ok);
        assert!(c.declared);
        assert!((c.required_confidence - 0.90).abs() < 1e-9);
        assert!((c.observed_confidence - 0.6).abs() < 1e-12);
    }

    #[test]
    fn undeclared_priority_uses_default() {
        let q = QosComplianceEvaluator::new(QosConfig::default(), 5);
        let c = q.evaluate(0.71, None);
        assert_eq!(c.service_priority, 5);
        assert!(!c.declared);
        assert!(c.priority_ok);
    }

    #[test]
    fn nan_confidence_is_never_compliant() {
        let q = QosComplianceEvaluator::default();
        assert!(!q.evaluate(f64::NAN, Some(1)).priority_ok);
    }

    #[test]
    fn custom_policy_is_respected() {
        let q = QosComplianceEvaluator::new(
            QosConfig {
                min_required: 0.3,
                max_required: 0.75,
            },
            5,
        );
        assert!((q.required_confidence(1) - 0.3).abs() < 1e-12);
        assert!((q.required_confidence(10) - 0.75).abs() < 1e-12);
    }
}
