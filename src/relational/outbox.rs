// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Outbox queue and drainer.
//!
//! The capture triggers append `(key, table, action)` rows to
//! `_replicant_log`; the `_seq` autoincrement gives FIFO order by arrival.
//!
//! Draining resolves each entry to the row's *current* state rather than
//! replaying the recorded action, so insert + update + delete of the same row
//! before a drain ends up as a single delete on the remote side:
//!
//! ```text
//! peek ──► resolve(row | gone) ──► apply ──► Flow
//!   ▲                                         │
//!   └──────── remove(entry) ◄── consumed ─────┤
//!                                             └─ StopFailure: leave entry, stop
//! ```
//!
//! An entry is removed only after its apply reported success.

use super::{bind_value, column_value, execute_with_retry, RelationalStore};
use crate::document::Payload;
use crate::error::{ReplicationError, Result};
use crate::flow::Flow;
use crate::origin::OUTBOX_TABLE;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::fmt;
use std::future::Future;
use tracing::{debug, warn};

/// Kind of mutation recorded by a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Insert,
    Update,
    Delete,
}

impl Action {
    /// Single-letter code stored in the outbox.
    pub fn code(self) -> &'static str {
        match self {
            Action::Insert => "I",
            Action::Update => "U",
            Action::Delete => "D",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "I" => Some(Action::Insert),
            "U" => Some(Action::Update),
            "D" => Some(Action::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// One captured local mutation awaiting propagation.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEntry {
    pub seq: i64,
    /// Row id as stored (`NEW.id` / `OLD.id`).
    pub key: Value,
    pub table: String,
    pub action: Action,
}

/// An entry resolved against the current table contents.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChange {
    pub entry: OutboxEntry,
    /// Current row, without the tracking column. `None` when deleted.
    pub row: Option<Payload>,
    pub is_delete: bool,
}

/// Result of a drain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    /// `false` if the apply function rejected an entry.
    pub success: bool,
    pub applied: usize,
    /// Sequence of the rejected entry, left at the head of the queue.
    pub failed_at: Option<i64>,
}

/// SQL creating the outbox table.
pub(crate) fn create_table_sql() -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS "{}" (
            _seq INTEGER PRIMARY KEY AUTOINCREMENT,
            _key NOT NULL,
            _table TEXT NOT NULL,
            _action TEXT NOT NULL
        )
        "#,
        OUTBOX_TABLE
    )
}

/// Ordered queue of pending local mutations.
#[derive(Debug, Clone)]
pub struct Outbox {
    store: RelationalStore,
}

impl Outbox {
    pub fn new(store: RelationalStore) -> Self {
        Self { store }
    }

    /// Create the outbox table if missing.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(&create_table_sql())
            .execute(self.store.pool())
            .await?;
        Ok(())
    }

    /// Number of pending entries.
    pub async fn len(&self) -> Result<u64> {
        let sql = format!(r#"SELECT COUNT(*) FROM "{}""#, OUTBOX_TABLE);
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(self.store.pool()).await?;
        Ok(count.max(0) as u64)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Oldest pending entry.
    pub async fn peek(&self) -> Result<Option<OutboxEntry>> {
        let sql = format!(
            r#"SELECT _seq, _key, _table, _action FROM "{}" ORDER BY _seq ASC LIMIT 1"#,
            OUTBOX_TABLE
        );
        let row = sqlx::query(&sql).fetch_optional(self.store.pool()).await?;
        row.as_ref().map(decode_entry).transpose()
    }

    /// All pending entries in order.
    pub async fn entries(&self) -> Result<Vec<OutboxEntry>> {
        let sql = format!(
            r#"SELECT _seq, _key, _table, _action FROM "{}" ORDER BY _seq ASC"#,
            OUTBOX_TABLE
        );
        let rows = sqlx::query(&sql).fetch_all(self.store.pool()).await?;
        rows.iter().map(decode_entry).collect()
    }

    /// Whether a captured mutation of this row is waiting to be drained.
    pub async fn has_pending(&self, table: &str, key: &Value) -> Result<bool> {
        let sql = format!(
            r#"SELECT EXISTS (SELECT 1 FROM "{}" WHERE _table = ? AND _key = ?)"#,
            OUTBOX_TABLE
        );
        let row = bind_value(sqlx::query(&sql).bind(table.to_string()), key)
            .fetch_one(self.store.pool())
            .await?;
        let pending: i64 = row.try_get(0)?;
        Ok(pending != 0)
    }

    /// Remove exactly this entry. Returns `false` if it was already gone.
    pub async fn remove(&self, entry: &OutboxEntry) -> Result<bool> {
        let sql = format!(r#"DELETE FROM "{}" WHERE _seq = ?"#, OUTBOX_TABLE);
        let pool = self.store.pool();
        let seq = entry.seq;
        let result = execute_with_retry("outbox_remove", || async {
            sqlx::query(&sql).bind(seq).execute(pool).await
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Look up the current state of the entry's row.
    pub async fn resolve(&self, entry: OutboxEntry) -> Result<PendingChange> {
        let row = match entry.action {
            Action::Delete => None,
            Action::Insert | Action::Update => self.store.fetch_row(&entry.table, &entry.key).await?,
        };
        Ok(PendingChange {
            is_delete: row.is_none(),
            row,
            entry,
        })
    }

    /// Drain the queue in order through `apply`.
    ///
    /// Returns `Err` only for local database failures; a rejected entry is
    /// reported through [`DrainReport::success`] and stays at the head.
    pub async fn drain<F, Fut>(&self, mut apply: F) -> Result<DrainReport>
    where
        F: FnMut(PendingChange) -> Fut,
        Fut: Future<Output = Flow>,
    {
        let mut report = DrainReport {
            success: true,
            ..Default::default()
        };

        while let Some(entry) = self.peek().await? {
            let pending = self.resolve(entry.clone()).await?;
            debug!(
                seq = entry.seq,
                table = %entry.table,
                key = %entry.key,
                action = %entry.action,
                is_delete = pending.is_delete,
                "Draining outbox entry"
            );

            let flow = apply(pending).await;
            if !flow.consumed() {
                warn!(seq = entry.seq, table = %entry.table, key = %entry.key, "Outbox entry rejected, stopping drain");
                report.success = false;
                report.failed_at = Some(entry.seq);
                break;
            }

            self.remove(&entry).await?;
            report.applied += 1;

            if !flow.proceed() {
                break;
            }
        }

        crate::metrics::set_outbox_depth(self.len().await?);
        Ok(report)
    }

    /// Append an entry by hand, as a trigger would.
    pub async fn push(&self, table: &str, key: &Value, action: Action) -> Result<i64> {
        let sql = format!(
            r#"INSERT INTO "{}" (_key, _table, _action) VALUES (?, ?, ?)"#,
            OUTBOX_TABLE
        );
        let result = bind_value(sqlx::query(&sql), key)
            .bind(table.to_string())
            .bind(action.code())
            .execute(self.store.pool())
            .await?;
        Ok(result.last_insert_rowid())
    }
}

fn decode_entry(row: &SqliteRow) -> Result<OutboxEntry> {
    let seq: i64 = row.try_get(0)?;
    let key = column_value(row, 1)?;
    let table: String = row.try_get(2)?;
    let code: String = row.try_get(3)?;
    let action = Action::from_code(&code)
        .ok_or_else(|| ReplicationError::Decode(format!("unknown outbox action '{}' at seq {}", code, seq)))?;
    Ok(OutboxEntry {
        seq,
        key,
        table,
        action,
    })
}
