//! Glue between the pure engine and its collaborators.
//!
//! Loads config and state, runs the engine, persists the result and hands a
//! rendered report to the notifier. Readings for the same device are
//! serialized through a per-device async mutex because the persisted state
//! is read-modify-write; different devices proceed concurrently.

use crate::engine::AlertEngine;
use crate::error::ProcessError;
use crate::render;
use crate::{ConfigProvider, Notifier, StateStore};
use chrono::{DateTime, Utc};
use pbxmon_common::types::{AlertEvent, Reading};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

pub struct ReadingProcessor<C, S, N> {
    configs: C,
    store: S,
    notifier: N,
    engine: AlertEngine,
    /// One lock per device id; taken for the whole load-evaluate-save span.
    device_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Previous reading per device, for delta-based transforms and IP-change
    /// detection. Explicit state rather than a module global so devices
    /// sharing a process never cross-contaminate.
    last_readings: Mutex<HashMap<String, Reading>>,
}

impl<C, S, N> ReadingProcessor<C, S, N>
where
    C: ConfigProvider,
    S: StateStore,
    N: Notifier,
{
    pub fn new(configs: C, store: S, notifier: N) -> Self {
        Self {
            configs,
            store,
            notifier,
            engine: AlertEngine::new(),
            device_locks: Mutex::new(HashMap::new()),
            last_readings: Mutex::new(HashMap::new()),
        }
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    /// Runs one reading end to end and returns the emitted events.
    pub async fn handle_reading(
        &self,
        reading: &Reading,
        now: DateTime<Utc>,
    ) -> Result<Vec<AlertEvent>, ProcessError> {
        let device_id = reading.device_id.clone();

        let lock = {
            let mut locks = self
                .device_locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            locks.entry(device_id.clone()).or_default().clone()
        };
        let _serialized = lock.lock().await;

        let config = self
            .configs
            .get_config(&device_id)
            .await
            .map_err(|source| ProcessError::ConfigLoad {
                device_id: device_id.clone(),
                source,
            })?;
        let Some(config) = config else {
            tracing::warn!(%device_id, "no config for device, skipping reading");
            return Err(ProcessError::ConfigMissing { device_id });
        };

        let state = self
            .store
            .load(&device_id)
            .await
            .map_err(|source| ProcessError::StateLoad {
                device_id: device_id.clone(),
                source,
            })?;

        let previous = {
            // Both maps are plain bookkeeping; a guard recovered from a
            // poisoned lock is still coherent.
            let mut cache = self
                .last_readings
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            cache.insert(device_id.clone(), reading.clone())
        };

        let (new_state, events) = self.engine.process(
            &device_id,
            state,
            &config,
            previous.as_ref(),
            reading,
            now,
        );

        if let Err(source) = self.store.save(&device_id, &new_state).await {
            return Err(ProcessError::Persistence {
                device_id,
                source,
                events,
            });
        }

        if let Some(report) = render::render_report(&device_id, now, &events) {
            // Delivery failure never invalidates the decision; log and
            // return the events anyway.
            if let Err(err) = self.notifier.send(&report).await {
                tracing::warn!(%device_id, error = %err, "notification delivery failed");
            }
        }

        Ok(events)
    }

    /// Marks a device offline (stale, no readings) and wipes its condition
    /// state; the next reading will emit a single back-online event.
    pub async fn mark_offline(
        &self,
        device_id: &str,
        last_seen: DateTime<Utc>,
    ) -> Result<(), ProcessError> {
        let lock = {
            let mut locks = self
                .device_locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            locks.entry(device_id.to_string()).or_default().clone()
        };
        let _serialized = lock.lock().await;

        let mut state = self
            .store
            .load(device_id)
            .await
            .map_err(|source| ProcessError::StateLoad {
                device_id: device_id.to_string(),
                source,
            })?;
        self.engine.mark_offline(&mut state, last_seen);
        self.store
            .save(device_id, &state)
            .await
            .map_err(|source| ProcessError::Persistence {
                device_id: device_id.to_string(),
                source,
                events: Vec::new(),
            })
    }
}
