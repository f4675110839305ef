//! Shared data model for the pbxmon alerting pipeline.
//!
//! Defines telemetry readings, per-device threshold configuration, the
//! persisted alerting state (conditions, RTT trend history) and the
//! [`types::AlertEvent`] structure produced by the alert engine.

pub mod id;
pub mod types;
