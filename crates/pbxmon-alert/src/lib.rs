//! Stateful alert decision engine for device telemetry readings.
//!
//! The engine compares each reading against the device's configured
//! thresholds, tracks how long every breached condition has persisted,
//! debounces repeat notifications per severity tier, follows SIP lines
//! through their mutually exclusive registration faults, and classifies
//! noisy RTT signals from sliding-window trends. It is pure with respect to
//! its inputs: persistence and delivery happen through the collaborator
//! traits below, driven by [`processor::ReadingProcessor`].

pub mod engine;
pub mod error;
pub mod escalation;
pub mod evaluator;
pub mod processor;
pub mod render;
pub mod transition;
pub mod trend;

#[cfg(test)]
mod tests;

use anyhow::Result;
use async_trait::async_trait;
use pbxmon_common::types::{DeviceAlertState, DeviceConfig};

/// Source of per-device alerting configuration.
///
/// A device without configuration is not evaluated at all.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    async fn get_config(&self, device_id: &str) -> Result<Option<DeviceConfig>>;
}

/// Persistence for [`DeviceAlertState`] documents.
///
/// The engine treats state as a whole-structure read before evaluation and
/// write after; callers must not interleave evaluations for one device.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the device's alerting state, or a default empty state if the
    /// device has none yet.
    async fn load(&self, device_id: &str) -> Result<DeviceAlertState>;

    async fn save(&self, device_id: &str, state: &DeviceAlertState) -> Result<()>;
}

/// Opaque delivery channel for rendered alert reports.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &str) -> Result<()>;
}
