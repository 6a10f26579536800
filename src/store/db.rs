// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared SQLite connection plumbing: tuned PRAGMAs and a forward-only,
//! `user_version`-gated migration runner. Grounded on
//! `examples/SinergaOptima-Dictum/dictum-app/src/storage.rs::init_schema`,
//! generalized to support more than one migration step.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;

/// A SQLite connection guarded by a mutex, matching spec.md §4.8's
/// `check_same_thread=false` + per-store-mutex model. Locking is a plain
/// synchronous `std::sync::Mutex` lock taken for the duration of one
/// query — acceptable because every write here is a small local WAL
/// commit; see DESIGN.md for the tradeoff against a full connection pool.
#[derive(Clone)]
pub struct SqliteHandle {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteHandle {
    /// Open (or create) the database at `path`, apply durability PRAGMAs,
    /// and run any migrations past the current `user_version`.
    pub fn open(path: &Path, migrations: &[&str]) -> rusqlite::Result<Self> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;

        let current_version: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
        let current_version = current_version.max(0) as usize;

        for (idx, migration) in migrations.iter().enumerate() {
            if idx < current_version {
                continue;
            }
            conn.execute_batch(migration)?;
            conn.pragma_update(None, "user_version", (idx + 1) as i64)?;
        }

        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Open an in-memory database (tests only).
    #[cfg(test)]
    pub fn open_in_memory(migrations: &[&str]) -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        for migration in migrations {
            conn.execute_batch(migration)?;
        }
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Run a synchronous closure against the guarded connection.
    pub fn with<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> rusqlite::Result<T> {
        let conn = self.conn.lock().unwrap_or_else(|poison| poison.into_inner());
        f(&conn)
    }
}

pub fn epoch_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
