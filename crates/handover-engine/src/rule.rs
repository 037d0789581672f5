//! # A3 Rule: deterministic fallback
//!
//! 3GPP Event A3: a neighbour becomes the preferred target once its RSRP
//! exceeds the serving cell's by more than the hysteresis, continuously for
//! at least the time-to-trigger. Among qualifying neighbours the strongest
//! wins; equal strength keeps measurement order.
//!
//! The rule has no external dependency and never fails, which is what makes
//! it the backstop for every ML fallback.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use handover_common::models::{CellMeasurement, UeSnapshot};
use quanta::{Clock, Instant};

use crate::config::RuleConfig;

/// Entering condition for one neighbour.
#[inline]
pub fn a3_entering(serving_rsrp_dbm: f64, neighbor_rsrp_dbm: f64, hysteresis_db: f64) -> bool {
    neighbor_rsrp_dbm - serving_rsrp_dbm > hysteresis_db
}

/// Instantaneous A3 evaluation (time-to-trigger = 0).
///
/// Returns the strongest neighbour whose RSRP beats the serving cell by more
/// than `hysteresis_db`, or `None` to stay on the serving cell.
pub fn a3_target<'a>(
    serving_rsrp_dbm: f64,
    neighbors: &'a [CellMeasurement],
    hysteresis_db: f64,
) -> Option<&'a CellMeasurement> {
    neighbors
        .iter()
        .filter(|n| n.rsrp_dbm.is_finite())
        .filter(|n| a3_entering(serving_rsrp_dbm, n.rsrp_dbm, hysteresis_db))
        .fold(None, strongest)
}

/// A3 evaluator with per-UE time-to-trigger tracking.
///
/// Trigger state is keyed by UE and neighbour cell and records when the
/// entering condition was first observed. A neighbour that stops meeting
/// the condition (or disappears from the measurement set) loses its timer.
pub struct RuleEvaluator {
    config: RuleConfig,
    clock: Clock,
    /// ue_id → (neighbour cell_id → condition first met)
    triggers: Mutex<HashMap<String, HashMap<String, Instant>>>,
}

impl RuleEvaluator {
    pub fn new(config: RuleConfig) -> Self {
        Self::with_clock(config, Clock::new())
    }

    pub fn with_clock(config: RuleConfig, clock: Clock) -> Self {
        Self {
            config,
            clock,
            triggers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RuleConfig {
        &self.config
    }

    /// Evaluate a snapshot with the configured hysteresis and time-to-trigger.
    pub fn evaluate_snapshot(&self, snapshot: &UeSnapshot) -> Option<String> {
        self.evaluate(
            &snapshot.ue_id,
            &snapshot.serving,
            &snapshot.neighbors,
            self.config.hysteresis_db,
            self.config.time_to_trigger,
        )
    }

    pub fn evaluate(
        &self,
        ue_id: &str,
        serving: &CellMeasurement,
        neighbors: &[CellMeasurement],
        hysteresis_db: f64,
        time_to_trigger: Duration,
    ) -> Option<String> {
        let candidates: Vec<&CellMeasurement> = neighbors
            .iter()
            .filter(|n| n.cell_id != serving.cell_id && n.rsrp_dbm.is_finite())
            .collect();

        if time_to_trigger.is_zero() {
            return candidates
                .into_iter()
                .filter(|n| a3_entering(serving.rsrp_dbm, n.rsrp_dbm, hysteresis_db))
                .fold(None, strongest)
                .map(|n| n.cell_id.clone());
        }

        let now = self.clock.now();
        let mut triggers = self.triggers.lock().unwrap_or_else(|e| e.into_inner());
        let timers = triggers.entry(ue_id.to_string()).or_default();

        let entering: Vec<&CellMeasurement> = candidates
            .into_iter()
            .filter(|n| a3_entering(serving.rsrp_dbm, n.rsrp_dbm, hysteresis_db))
            .collect();

        timers.retain(|cell_id, _| entering.iter().any(|n| &n.cell_id == cell_id));

        let mut best: Option<&CellMeasurement> = None;
        for n in entering {
            let first_met = *timers.entry(n.cell_id.clone()).or_insert(now);
            if now.saturating_duration_since(first_met) >= time_to_trigger {
                best = strongest(best, n);
            }
        }

        if timers.is_empty() {
            triggers.remove(ue_id);
        }

        best.map(|n| n.cell_id.clone())
    }

    /// Drop all trigger state for a UE (e.g. after its serving cell changed).
    pub fn forget(&self, ue_id: &str) {
        self.triggers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(ue_id);
    }

    /// Number of UEs with at least one running trigger timer.
    pub fn tracked_ues(&self) -> usize {
        self.triggers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

fn strongest<'a>(
    best: Option<&'a CellMeasurement>,
    n: &'a CellMeasurement,
) -> Option<&'a CellMeasurement> {
    match best {
        Some(b) if b.rsrp_dbm >= n.rsrp_dbm => Some(b),
        _ => Some(n),
    }
}
