// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Relational store integration (SQLite).
//!
//! The tracked tables, the outbox and the checkpoint all live in the same
//! SQLite database, so a row mutation and the outbox entry its trigger
//! appends commit together.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the application holds a
//! write lock at the same moment we do. Our own writes go through
//! [`execute_with_retry`], which retries with capped exponential backoff.
//!
//! # Row values
//!
//! Rows cross into JSON by storage class, not declared type:
//!
//! | Storage class | JSON |
//! |---------------|------|
//! | NULL | `null` |
//! | INTEGER | number |
//! | REAL | number (`null` for NaN/inf) |
//! | TEXT | string |
//! | BLOB | string (lossy UTF-8) |

pub mod capture;
pub mod checkpoint;
pub mod outbox;
pub mod writer;

pub use capture::ChangeCapture;
pub use checkpoint::CheckpointStore;
pub use outbox::{Action, DrainReport, Outbox, OutboxEntry, PendingChange};
pub use writer::RelationalWriter;

use crate::config::RelationalConfig;
use crate::document::Payload;
use crate::error::{ReplicationError, Result};
use crate::origin::TRACKING_COLUMN;
use crate::schema::{quote_ident, ID_COLUMN};
use serde_json::{Number, Value};
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow, SqliteSynchronous,
};
use sqlx::{Column, Row, Sqlite, TypeInfo, ValueRef};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error
pub(crate) fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
pub(crate) async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::sqlite_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(operation = operation_name, attempts, "SQLite busy, max retries exceeded");
                }
                return Err(e);
            }
        }
    }
}

/// Handle to the SQLite database being replicated.
#[derive(Debug, Clone)]
pub struct RelationalStore {
    pool: SqlitePool,
    path: String,
}

impl RelationalStore {
    /// Open (creating if missing) the database described by `config`.
    pub async fn open(config: &RelationalConfig) -> Result<Self> {
        info!(path = %config.sqlite_path, "Opening relational store");

        let pool = if config.is_in_memory() {
            // Every connection to :memory: is its own database; keep exactly one alive.
            let options = SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?;
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            let journal = if config.wal_mode {
                SqliteJournalMode::Wal
            } else {
                SqliteJournalMode::Delete
            };
            let options = SqliteConnectOptions::new()
                .filename(&config.sqlite_path)
                .journal_mode(journal)
                .synchronous(SqliteSynchronous::Normal)
                .create_if_missing(true);
            SqlitePoolOptions::new()
                .max_connections(config.max_connections.max(1))
                .connect_with(options)
                .await?
        };

        Ok(Self {
            pool,
            path: config.sqlite_path.clone(),
        })
    }

    /// Wrap an existing pool (the host already owns one).
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            path: String::new(),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    pub async fn table_exists(&self, table: &str) -> Result<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(table)
                .fetch_one(&self.pool)
                .await?;
        Ok(count > 0)
    }

    pub async fn column_exists(&self, table: &str, column: &str) -> Result<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM pragma_table_info(?) WHERE name = ?")
                .bind(table)
                .bind(column)
                .fetch_one(&self.pool)
                .await?;
        Ok(count > 0)
    }

    /// Current state of a row by primary key, without the tracking column.
    pub async fn fetch_row(&self, table: &str, key: &Value) -> Result<Option<Payload>> {
        let sql = format!(
            "SELECT * FROM {} WHERE {} = ?",
            quote_ident(table),
            quote_ident(ID_COLUMN)
        );
        let row = bind_value(sqlx::query(&sql), key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_payload).transpose()
    }

    /// Value of the tracking column for a row. Outer `None` if the row is absent.
    pub async fn tracking_value(&self, table: &str, key: &Value) -> Result<Option<Option<String>>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?",
            quote_ident(TRACKING_COLUMN),
            quote_ident(table),
            quote_ident(ID_COLUMN)
        );
        let row = bind_value(sqlx::query(&sql), key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get::<Option<String>, _>(0)?)),
            None => Ok(None),
        }
    }

    /// Close the connection pool gracefully.
    pub async fn close(&self) {
        self.pool.close().await;
        info!(path = %self.path, "Relational store closed");
    }
}

/// Bind a JSON value as the next positional parameter.
pub(crate) fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::String(s) => query.bind(s.clone()),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64()),
        },
        Value::Bool(b) => query.bind(*b),
        Value::Null => query.bind(Option::<String>::None),
        // Nested values are stored as JSON text
        other => query.bind(other.to_string()),
    }
}

/// Decode a row into column values, dropping the tracking column.
pub(crate) fn row_to_payload(row: &SqliteRow) -> Result<Payload> {
    let mut payload = Payload::new();
    for (index, column) in row.columns().iter().enumerate() {
        if column.name() == TRACKING_COLUMN {
            continue;
        }
        payload.insert(column.name().to_string(), column_value(row, index)?);
    }
    Ok(payload)
}

/// Decode a single column by its runtime storage class.
pub(crate) fn column_value(row: &SqliteRow, index: usize) -> Result<Value> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let storage = raw.type_info().name().to_string();
    let value = match storage.as_str() {
        "INTEGER" => Value::from(row.try_get_unchecked::<i64, _>(index)?),
        "REAL" => Number::from_f64(row.try_get_unchecked::<f64, _>(index)?)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        "BLOB" => {
            let bytes: Vec<u8> = row.try_get_unchecked(index)?;
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        }
        _ => Value::String(row.try_get_unchecked::<String, _>(index)?),
    };
    Ok(value)
}

/// Loose equality between a stored value and an incoming one.
///
/// SQLite coerces on write (`"10"` into an INTEGER column becomes `10`,
/// `true` becomes `1`), so compare the way it would have stored them.
pub(crate) fn values_match(stored: &Value, incoming: &Value) -> bool {
    if stored == incoming {
        return true;
    }
    match (stored, incoming) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::Number(a), Value::Bool(b)) => a.as_i64() == Some(i64::from(*b)),
        (Value::Number(a), Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(|parsed| a.as_f64() == Some(parsed))
            .unwrap_or(false),
        (Value::String(s), Value::Number(n)) => *s == n.to_string(),
        (Value::String(s), other @ (Value::Array(_) | Value::Object(_))) => *s == other.to_string(),
        _ => false,
    }
}
