// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Device binding store (C8): which `device_token` is authorized for which
//! `device_id`, and whether that binding has been activated. Backs the
//! authentication gate in the orchestrator (C5) and the `/v1/device/*`
//! control-plane endpoints.

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::store::db::{epoch_ms, SqliteHandle};

pub const MIGRATIONS: &[&str] = &[r#"
    CREATE TABLE IF NOT EXISTS device_bindings (
        device_id TEXT PRIMARY KEY,
        device_token TEXT NOT NULL,
        activated INTEGER NOT NULL DEFAULT 0,
        label TEXT,
        created_at_ms INTEGER NOT NULL,
        updated_at_ms INTEGER NOT NULL
    );
"#];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceBinding {
    pub device_id: String,
    pub device_token: String,
    pub activated: bool,
    pub label: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

pub struct DeviceBindingStore {
    db: SqliteHandle,
}

impl DeviceBindingStore {
    pub fn new(db: SqliteHandle) -> Self {
        Self { db }
    }

    pub async fn upsert(&self, device_id: &str, device_token: &str, label: Option<&str>) -> DeviceBinding {
        let device_id = device_id.to_owned();
        let device_token = device_token.to_owned();
        let label = label.map(|s| s.to_owned());
        let now = epoch_ms();
        let db = self.db.clone();
        db.with(move |conn| {
            conn.execute(
                "INSERT INTO device_bindings (device_id, device_token, activated, label, created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, 0, ?3, ?4, ?4)
                 ON CONFLICT(device_id) DO UPDATE SET
                    device_token=excluded.device_token,
                    label=COALESCE(excluded.label, device_bindings.label),
                    updated_at_ms=excluded.updated_at_ms",
                params![device_id, device_token, label, now],
            )?;
            conn.query_row(
                "SELECT device_id, device_token, activated, label, created_at_ms, updated_at_ms
                 FROM device_bindings WHERE device_id = ?1",
                params![device_id],
                row_to_binding,
            )
        })
        .expect("device binding upsert followed by select must find the row")
    }

    pub async fn get(&self, device_id: &str) -> Option<DeviceBinding> {
        let device_id = device_id.to_owned();
        let db = self.db.clone();
        db.with(move |conn| {
            conn.query_row(
                "SELECT device_id, device_token, activated, label, created_at_ms, updated_at_ms
                 FROM device_bindings WHERE device_id = ?1",
                params![device_id],
                row_to_binding,
            )
            .optional()
        })
        .ok()
        .flatten()
    }

    pub async fn list(&self) -> Vec<DeviceBinding> {
        let db = self.db.clone();
        db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT device_id, device_token, activated, label, created_at_ms, updated_at_ms
                 FROM device_bindings ORDER BY created_at_ms DESC",
            )?;
            stmt.query_map([], row_to_binding)?.collect::<rusqlite::Result<Vec<_>>>()
        })
        .unwrap_or_default()
    }

    pub async fn activate(&self, device_id: &str) -> bool {
        let device_id = device_id.to_owned();
        let now = epoch_ms();
        let db = self.db.clone();
        db.with(move |conn| {
            conn.execute(
                "UPDATE device_bindings SET activated = 1, updated_at_ms = ?2 WHERE device_id = ?1",
                params![device_id, now],
            )
        })
        .map(|n| n > 0)
        .unwrap_or(false)
    }

    /// Remove a device's binding entirely, revoking any token it held.
    /// Returns `true` if a row was removed.
    pub async fn revoke(&self, device_id: &str) -> bool {
        let device_id = device_id.to_owned();
        let db = self.db.clone();
        db.with(move |conn| conn.execute("DELETE FROM device_bindings WHERE device_id = ?1", params![device_id]))
            .map(|n| n > 0)
            .unwrap_or(false)
    }

    /// Check whether `device_token` is authorized for `device_id`.
    ///
    /// `require_activated` rejects a binding that exists but hasn't been
    /// activated yet. `allow_unbound` accepts any token for a device that
    /// has no binding row at all (first-contact provisioning mode).
    pub async fn verify(
        &self,
        device_id: &str,
        device_token: &str,
        require_activated: bool,
        allow_unbound: bool,
    ) -> bool {
        match self.get(device_id).await {
            Some(binding) => {
                binding.device_token == device_token && (!require_activated || binding.activated)
            }
            None => allow_unbound,
        }
    }
}

fn row_to_binding(row: &rusqlite::Row) -> rusqlite::Result<DeviceBinding> {
    Ok(DeviceBinding {
        device_id: row.get(0)?,
        device_token: row.get(1)?,
        activated: row.get::<_, i64>(2)? != 0,
        label: row.get(3)?,
        created_at_ms: row.get(4)?,
        updated_at_ms: row.get(5)?,
    })
}

#[cfg(test)]
mod bindings_tests {
    use super::*;

    fn store() -> DeviceBindingStore {
        DeviceBindingStore::new(SqliteHandle::open_in_memory(MIGRATIONS).unwrap())
    }

    #[tokio::test]
    async fn verify_rejects_wrong_token() {
        let store = store();
        store.upsert("dev-1", "tok-a", None).await;
        store.activate("dev-1").await;
        assert!(store.verify("dev-1", "tok-a", true, false).await);
        assert!(!store.verify("dev-1", "tok-b", true, false).await);
    }

    #[tokio::test]
    async fn verify_requires_activation_when_asked() {
        let store = store();
        store.upsert("dev-2", "tok-a", None).await;
        assert!(!store.verify("dev-2", "tok-a", true, false).await);
        assert!(store.verify("dev-2", "tok-a", false, false).await);
        store.activate("dev-2").await;
        assert!(store.verify("dev-2", "tok-a", true, false).await);
    }

    #[tokio::test]
    async fn unbound_device_requires_allow_unbound() {
        let store = store();
        assert!(!store.verify("dev-unknown", "anything", true, false).await);
        assert!(store.verify("dev-unknown", "anything", true, true).await);
    }

    #[tokio::test]
    async fn revoke_removes_binding() {
        let store = store();
        store.upsert("dev-3", "tok-a", None).await;
        assert!(store.revoke("dev-3").await);
        assert!(store.get("dev-3").await.is_none());
        assert!(!store.revoke("dev-3").await);
    }
}
