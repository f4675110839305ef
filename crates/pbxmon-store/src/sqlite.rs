//! Single-file SQLite persistence for alert state, device configuration and
//! emitted alert events.
//!
//! State and configuration documents are stored as whole JSON blobs keyed by
//! device id: the alert engine always reads and writes state as one unit, so
//! there is nothing to gain from exploding it into columns. Events are
//! append-only rows for later inspection.

use crate::error::{Result, StoreError};
use anyhow::Result as AnyResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pbxmon_alert::{ConfigProvider, StateStore};
use pbxmon_common::types::{AlertEvent, DeviceAlertState, DeviceConfig};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS device_alert_state (
    device_id TEXT PRIMARY KEY,
    state_json TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS device_config (
    device_id TEXT PRIMARY KEY,
    config_json TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS alert_events (
    id TEXT PRIMARY KEY,
    device_id TEXT NOT NULL,
    condition TEXT NOT NULL,
    tier TEXT NOT NULL,
    kind TEXT NOT NULL,
    message TEXT NOT NULL,
    timestamp INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_device_time
    ON alert_events(device_id, timestamp);
";

/// SQLite-backed store. All access goes through one connection behind a
/// mutex; per-device serialization above this layer keeps contention low.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        tracing::debug!(path = %path.display(), "opened alert store");
        Self::init(conn)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Other("connection mutex poisoned".to_string()))
    }

    pub fn load_state(&self, device_id: &str) -> Result<DeviceAlertState> {
        let conn = self.lock()?;
        let json: Option<String> = conn
            .prepare_cached("SELECT state_json FROM device_alert_state WHERE device_id = ?1")?
            .query_row(rusqlite::params![device_id], |row| row.get(0))
            .optional()?;
        match json {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(DeviceAlertState::default()),
        }
    }

    /// Writes the device's state document. An empty state deletes the row
    /// instead, so long-recovered devices leave no residue behind.
    pub fn save_state(&self, device_id: &str, state: &DeviceAlertState) -> Result<()> {
        let conn = self.lock()?;
        if state.is_empty() {
            conn.prepare_cached("DELETE FROM device_alert_state WHERE device_id = ?1")?
                .execute(rusqlite::params![device_id])?;
            return Ok(());
        }
        let json = serde_json::to_string(state)?;
        conn.prepare_cached(
            "INSERT INTO device_alert_state (device_id, state_json, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(device_id) DO UPDATE SET
                 state_json = excluded.state_json,
                 updated_at = excluded.updated_at",
        )?
        .execute(rusqlite::params![
            device_id,
            json,
            Utc::now().timestamp_millis()
        ])?;
        Ok(())
    }

    pub fn get_config(&self, device_id: &str) -> Result<Option<DeviceConfig>> {
        let conn = self.lock()?;
        let json: Option<String> = conn
            .prepare_cached("SELECT config_json FROM device_config WHERE device_id = ?1")?
            .query_row(rusqlite::params![device_id], |row| row.get(0))
            .optional()?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub fn put_config(&self, device_id: &str, config: &DeviceConfig) -> Result<()> {
        let json = serde_json::to_string(config)?;
        let conn = self.lock()?;
        conn.prepare_cached(
            "INSERT INTO device_config (device_id, config_json, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(device_id) DO UPDATE SET
                 config_json = excluded.config_json,
                 updated_at = excluded.updated_at",
        )?
        .execute(rusqlite::params![
            device_id,
            json,
            Utc::now().timestamp_millis()
        ])?;
        Ok(())
    }

    pub fn delete_config(&self, device_id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.prepare_cached("DELETE FROM device_config WHERE device_id = ?1")?
            .execute(rusqlite::params![device_id])?;
        Ok(())
    }

    /// Appends emitted events for the audit trail.
    pub fn record_events(&self, events: &[AlertEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO alert_events
                     (id, device_id, condition, tier, kind, message, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for event in events {
                stmt.execute(rusqlite::params![
                    event.id,
                    event.device_id,
                    event.condition,
                    event.tier.to_string(),
                    event.kind.to_string(),
                    event.message,
                    event.timestamp.timestamp_millis(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Most recent events for a device, newest first.
    pub fn recent_events(&self, device_id: &str, limit: usize) -> Result<Vec<AlertEvent>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, device_id, condition, tier, kind, message, timestamp
             FROM alert_events
             WHERE device_id = ?1
             ORDER BY timestamp DESC, id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![device_id, limit as i64], |row| {
            let tier: String = row.get(3)?;
            let kind: String = row.get(4)?;
            let ts_ms: i64 = row.get(6)?;
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                tier,
                kind,
                row.get::<_, String>(5)?,
                ts_ms,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (id, device_id, condition, tier, kind, message, ts_ms) = row?;
            let tier = tier
                .parse()
                .map_err(|e: String| StoreError::Other(format!("bad tier column: {e}")))?;
            let kind = serde_json::from_value(serde_json::Value::String(kind))?;
            let timestamp: DateTime<Utc> =
                DateTime::from_timestamp_millis(ts_ms).unwrap_or_default();
            events.push(AlertEvent {
                id,
                device_id,
                condition,
                tier,
                kind,
                message,
                timestamp,
            });
        }
        Ok(events)
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn load(&self, device_id: &str) -> AnyResult<DeviceAlertState> {
        Ok(self.load_state(device_id)?)
    }

    async fn save(&self, device_id: &str, state: &DeviceAlertState) -> AnyResult<()> {
        Ok(self.save_state(device_id, state)?)
    }
}

#[async_trait]
impl ConfigProvider for SqliteStore {
    async fn get_config(&self, device_id: &str) -> AnyResult<Option<DeviceConfig>> {
        Ok(SqliteStore::get_config(self, device_id)?)
    }
}
