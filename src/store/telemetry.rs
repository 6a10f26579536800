// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Telemetry sample store (C8): raw device telemetry (battery, signal,
//! sensor faults) sampled over time, backing `/v1/lifelog/telemetry`.

use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::db::{epoch_ms, SqliteHandle};

pub const MIGRATIONS: &[&str] = &[r#"
    CREATE TABLE IF NOT EXISTS telemetry_samples (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id TEXT NOT NULL,
        session_id TEXT,
        ts INTEGER NOT NULL,
        payload_json TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_telemetry_device_ts ON telemetry_samples(device_id, ts);
"#];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub id: i64,
    pub device_id: String,
    pub session_id: Option<String>,
    pub ts: i64,
    pub payload: Value,
}

pub struct TelemetrySampleStore {
    db: SqliteHandle,
}

impl TelemetrySampleStore {
    pub fn new(db: SqliteHandle) -> Self {
        Self { db }
    }

    pub async fn add(&self, device_id: &str, session_id: Option<&str>, payload: Value) {
        let device_id = device_id.to_owned();
        let session_id = session_id.map(|s| s.to_owned());
        let payload_json = payload.to_string();
        let ts = epoch_ms();
        let db = self.db.clone();
        let result = db.with(move |conn| {
            conn.execute(
                "INSERT INTO telemetry_samples (device_id, session_id, ts, payload_json) VALUES (?1, ?2, ?3, ?4)",
                params![device_id, session_id, ts, payload_json],
            )
        });
        if let Err(e) = result {
            tracing::warn!(err = %e, "telemetry add failed");
        }
    }

    pub async fn list(&self, device_id: &str, limit: i64) -> Vec<TelemetrySample> {
        let device_id = device_id.to_owned();
        let db = self.db.clone();
        db.with(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, device_id, session_id, ts, payload_json FROM telemetry_samples
                 WHERE device_id = ?1 ORDER BY ts DESC LIMIT ?2",
            )?;
            stmt.query_map(params![device_id, limit], |row| {
                let payload_json: String = row.get(4)?;
                Ok(TelemetrySample {
                    id: row.get(0)?,
                    device_id: row.get(1)?,
                    session_id: row.get(2)?,
                    ts: row.get(3)?,
                    payload: serde_json::from_str(&payload_json).unwrap_or(Value::Null),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
        })
        .unwrap_or_default()
    }
}

#[cfg(test)]
mod telemetry_tests {
    use super::*;

    #[tokio::test]
    async fn add_then_list_returns_newest_first() {
        let store = TelemetrySampleStore::new(SqliteHandle::open_in_memory(MIGRATIONS).unwrap());
        store.add("dev-1", None, serde_json::json!({"battery_pct": 90})).await;
        store.add("dev-1", None, serde_json::json!({"battery_pct": 88})).await;
        let rows = store.list("dev-1", 10).await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].payload["battery_pct"], 88);
    }
}
