//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - CouchDB testcontainer setup
//! - A document store wrapper that injects failures
//! - SQLite fixtures for the `orders` table

#![allow(dead_code)]

pub mod containers;
pub mod flaky_store;

pub use containers::*;
pub use flaky_store::*;

use replicant::document::Payload;
use replicant::{RelationalConfig, RelationalStore, Schema};
use serde_json::Value;

/// DDL for the table every test replicates.
pub const ORDERS_DDL: &str = "CREATE TABLE orders (id INTEGER PRIMARY KEY, amount INTEGER)";

pub fn orders_schema() -> Schema {
    Schema::new().with_table("orders", &[("id", "INTEGER"), ("amount", "INTEGER")])
}

/// Object literal to payload.
pub fn payload(value: Value) -> Payload {
    value.as_object().cloned().expect("payload must be a JSON object")
}

/// In-memory SQLite with the given DDL applied.
pub async fn memory_store(ddl: &str) -> RelationalStore {
    let store = RelationalStore::open(&RelationalConfig::in_memory())
        .await
        .expect("open in-memory store");
    sqlx::query(ddl)
        .execute(store.pool())
        .await
        .expect("apply DDL");
    store
}

/// File-backed SQLite config under `dir`.
pub fn file_config(dir: &tempfile::TempDir, name: &str) -> RelationalConfig {
    RelationalConfig {
        sqlite_path: dir.path().join(name).to_string_lossy().to_string(),
        wal_mode: true,
        max_connections: 4,
    }
}

/// Run a statement as the application would.
pub async fn exec(store: &RelationalStore, sql: &str) {
    sqlx::query(sql)
        .execute(store.pool())
        .await
        .unwrap_or_else(|e| panic!("{}: {}", sql, e));
}
