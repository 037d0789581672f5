//! Handover decision engine.
//!
//! Arbitrates between an ML prediction provider and a deterministic A3 rule
//! for every UE mobility event. The provider sits behind two circuit
//! breakers and a bounded operation queue; predictions are gated on QoS
//! compliance before they are applied.

pub mod breaker;
pub mod config;
pub mod decision;
pub mod engine;
pub mod metrics;
pub mod prediction;
pub mod qos;
pub mod queue;
pub mod rule;

pub use config::EngineConfig;
pub use decision::{DecisionMethod, DecisionSink, FallbackReason, HandoverDecision};
pub use engine::HandoverEngine;
