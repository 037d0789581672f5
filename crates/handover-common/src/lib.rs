//! Shared types for the handover decision engine.
//!
//! This crate contains:
//! - **Data models**: UE snapshots, per-cell RF measurements, declared QoS requirements
//! - **Protocol messages**: request/response payloads exchanged with the prediction provider
//! - **ID generation**: Prefixed UUIDv7 helpers (`dec_`, `op_`)

pub mod ids;
pub mod models;
pub mod protocol;
