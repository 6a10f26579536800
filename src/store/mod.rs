// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Persistence layer (C8). Two SQLite files: `lifelog.db` holds device
//! sessions, the lifelog event timeline, device bindings, device
//! operations, and thought traces; `observability.db` holds the bounded
//! runtime-health ring, kept separate so operator polling never contends
//! with the hot write path.

pub mod bindings;
pub mod db;
pub mod lifelog;
pub mod observability;
pub mod operations;
pub mod telemetry;
pub mod thought_trace;

use std::path::Path;
use std::sync::Arc;

use db::SqliteHandle;

/// Every store the gateway persists to, opened against the two database
/// files under the configured data directory.
pub struct Stores {
    pub lifelog: Arc<lifelog::LifelogStore>,
    pub bindings: Arc<bindings::DeviceBindingStore>,
    pub operations: Arc<operations::DeviceOperationStore>,
    pub thought_trace: Arc<thought_trace::ThoughtTraceStore>,
    pub telemetry: Arc<telemetry::TelemetrySampleStore>,
    pub observability: Arc<observability::ObservabilityStore>,
}

impl Stores {
    pub fn open(data_dir: &Path, observability_max_rows: i64) -> rusqlite::Result<Self> {
        let lifelog_migrations: Vec<&str> = lifelog::MIGRATIONS
            .iter()
            .chain(bindings::MIGRATIONS.iter())
            .chain(operations::MIGRATIONS.iter())
            .chain(thought_trace::MIGRATIONS.iter())
            .chain(telemetry::MIGRATIONS.iter())
            .copied()
            .collect();
        let lifelog_db = SqliteHandle::open(&data_dir.join("lifelog.db"), &lifelog_migrations)?;
        let observability_db =
            SqliteHandle::open(&data_dir.join("observability.db"), observability::MIGRATIONS)?;

        Ok(Self {
            lifelog: Arc::new(lifelog::LifelogStore::new(lifelog_db.clone())),
            bindings: Arc::new(bindings::DeviceBindingStore::new(lifelog_db.clone())),
            operations: Arc::new(operations::DeviceOperationStore::new(lifelog_db.clone())),
            thought_trace: Arc::new(thought_trace::ThoughtTraceStore::new(lifelog_db.clone())),
            telemetry: Arc::new(telemetry::TelemetrySampleStore::new(lifelog_db)),
            observability: Arc::new(observability::ObservabilityStore::new(
                observability_db,
                observability_max_rows,
            )),
        })
    }
}
