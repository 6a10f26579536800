// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Observability sample store (C8): a bounded ring of runtime health
//! samples (queue depths, adapter connectivity, loop latency) backing
//! `/v1/runtime/observability`. Kept in its own SQLite file, separate from
//! the lifelog database, so a busy lifelog writer never blocks the
//! operator's status polling.

use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::db::{epoch_ms, SqliteHandle};

pub const MIGRATIONS: &[&str] = &[r#"
    CREATE TABLE IF NOT EXISTS observability_samples (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ts INTEGER NOT NULL,
        component TEXT NOT NULL,
        payload_json TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_observability_component_ts ON observability_samples(component, ts);
"#];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilitySample {
    pub id: i64,
    pub ts: i64,
    pub component: String,
    pub payload: Value,
}

pub struct ObservabilityStore {
    db: SqliteHandle,
    max_rows: i64,
}

impl ObservabilityStore {
    pub fn new(db: SqliteHandle, max_rows: i64) -> Self {
        Self { db, max_rows }
    }

    /// Record one sample and trim the oldest rows past `max_rows`, keeping
    /// the table a bounded ring rather than an unbounded log.
    pub async fn add_sample(&self, component: &str, payload: Value) {
        let component = component.to_owned();
        let payload_json = payload.to_string();
        let ts = epoch_ms();
        let max_rows = self.max_rows;
        let db = self.db.clone();
        let result = db.with(move |conn| {
            conn.execute(
                "INSERT INTO observability_samples (ts, component, payload_json) VALUES (?1, ?2, ?3)",
                params![ts, component, payload_json],
            )?;
            conn.execute(
                "DELETE FROM observability_samples WHERE id IN (
                    SELECT id FROM observability_samples ORDER BY id DESC LIMIT -1 OFFSET ?1
                 )",
                params![max_rows],
            )
        });
        if let Err(e) = result {
            tracing::warn!(err = %e, "observability add_sample failed");
        }
    }

    pub async fn list_samples(&self, component: Option<&str>, limit: i64) -> Vec<ObservabilitySample> {
        let component = component.map(|s| s.to_owned());
        let db = self.db.clone();
        db.with(move |conn| {
            if let Some(ref c) = component {
                let mut stmt = conn.prepare(
                    "SELECT id, ts, component, payload_json FROM observability_samples
                     WHERE component = ?1 ORDER BY ts DESC LIMIT ?2",
                )?;
                stmt.query_map(params![c, limit], row_to_sample)?.collect::<rusqlite::Result<Vec<_>>>()
            } else {
                let mut stmt = conn.prepare(
                    "SELECT id, ts, component, payload_json FROM observability_samples ORDER BY ts DESC LIMIT ?1",
                )?;
                stmt.query_map(params![limit], row_to_sample)?.collect::<rusqlite::Result<Vec<_>>>()
            }
        })
        .unwrap_or_default()
    }
}

fn row_to_sample(row: &rusqlite::Row) -> rusqlite::Result<ObservabilitySample> {
    let payload_json: String = row.get(3)?;
    Ok(ObservabilitySample {
        id: row.get(0)?,
        ts: row.get(1)?,
        component: row.get(2)?,
        payload: serde_json::from_str(&payload_json).unwrap_or(Value::Null),
    })
}

#[cfg(test)]
mod observability_tests {
    use super::*;

    #[tokio::test]
    async fn add_sample_trims_to_max_rows() {
        let store = ObservabilityStore::new(SqliteHandle::open_in_memory(MIGRATIONS).unwrap(), 3);
        for i in 0..10 {
            store.add_sample("orchestrator", serde_json::json!({"n": i})).await;
        }
        let rows = store.list_samples(None, 100).await;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].payload["n"], 9);
        assert_eq!(rows[2].payload["n"], 7);
    }

    #[tokio::test]
    async fn list_samples_filters_by_component() {
        let store = ObservabilityStore::new(SqliteHandle::open_in_memory(MIGRATIONS).unwrap(), 100);
        store.add_sample("mqtt_adapter", serde_json::json!({})).await;
        store.add_sample("orchestrator", serde_json::json!({})).await;
        let rows = store.list_samples(Some("mqtt_adapter"), 10).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].component, "mqtt_adapter");
    }
}
