//! In-memory collaborators for tests and single-process deployments.

use anyhow::Result;
use async_trait::async_trait;
use pbxmon_alert::{ConfigProvider, StateStore};
use pbxmon_common::types::{DeviceAlertState, DeviceConfig};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Keeps every device's alert state in a map; nothing survives a restart.
#[derive(Default)]
pub struct MemoryStateStore {
    states: RwLock<HashMap<String, DeviceAlertState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, device_id: &str) -> Result<DeviceAlertState> {
        Ok(self
            .states
            .read()
            .await
            .get(device_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save(&self, device_id: &str, state: &DeviceAlertState) -> Result<()> {
        let mut states = self.states.write().await;
        if state.is_empty() {
            states.remove(device_id);
        } else {
            states.insert(device_id.to_string(), state.clone());
        }
        Ok(())
    }
}

/// Fixed per-device configuration handed in at construction.
#[derive(Default)]
pub struct MemoryConfigProvider {
    configs: RwLock<HashMap<String, DeviceConfig>>,
}

impl MemoryConfigProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, device_id: &str, config: DeviceConfig) {
        self.configs
            .write()
            .await
            .insert(device_id.to_string(), config);
    }
}

#[async_trait]
impl ConfigProvider for MemoryConfigProvider {
    async fn get_config(&self, device_id: &str) -> Result<Option<DeviceConfig>> {
        Ok(self.configs.read().await.get(device_id).cloned())
    }
}
