// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Relational Change Capture.
//!
//! For every tracked table: add the nullable `_replicant_origin` column and
//! three triggers feeding the outbox.
//!
//! | Trigger | Fires | Guard | Records |
//! |---------|-------|-------|---------|
//! | `_replicant_<t>_i` | after insert | `NEW._replicant_origin IS NULL` | `(NEW.id, t, 'I')` |
//! | `_replicant_<t>_u` | after update | `NEW._replicant_origin IS NULL` | `(NEW.id, t, 'U')` |
//! | `_replicant_<t>_d` | after delete | none | `(OLD.id, t, 'D')` |
//!
//! The guard is what breaks the replication loop: the Relational Writer
//! stamps the column, so its writes are never captured. Installation is
//! idempotent and each table is set up in its own transaction.
//!
//! Each trigger first removes any pending entry for the same row, so the
//! outbox holds at most one entry per row, positioned at its latest
//! mutation. The drainer resolves current row state anyway; older entries
//! would only repeat the same write.

use super::outbox::create_table_sql;
use super::{execute_with_retry, RelationalStore};
use crate::error::{ReplicationError, Result};
use crate::origin::{OUTBOX_TABLE, TRACKING_COLUMN};
use crate::schema::{quote_ident, Schema, ID_COLUMN};
use sqlx::{Sqlite, Transaction};
use tracing::{debug, info};

/// Trigger names for a table, in insert/update/delete order.
pub fn trigger_names(table: &str) -> [String; 3] {
    [
        format!("_replicant_{}_i", table),
        format!("_replicant_{}_u", table),
        format!("_replicant_{}_d", table),
    ]
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Trigger DDL for a table.
fn trigger_sql(table: &str) -> [String; 3] {
    let [insert, update, delete] = trigger_names(table);
    let table_ident = quote_ident(table);
    let table_lit = quote_literal(table);
    let origin = quote_ident(TRACKING_COLUMN);
    let id = quote_ident(ID_COLUMN);
    let log = quote_ident(OUTBOX_TABLE);

    let guarded = |name: &str, event: &str, code: &str| {
        format!(
            "CREATE TRIGGER IF NOT EXISTS {name} AFTER {event} ON {table_ident} \
             WHEN NEW.{origin} IS NULL \
             BEGIN \
             DELETE FROM {log} WHERE _table = {table_lit} AND _key = NEW.{id}; \
             INSERT INTO {log} (_key, _table, _action) VALUES (NEW.{id}, {table_lit}, '{code}'); \
             END",
            name = quote_ident(name),
        )
    };

    [
        guarded(&insert, "INSERT", "I"),
        guarded(&update, "UPDATE", "U"),
        format!(
            "CREATE TRIGGER IF NOT EXISTS {name} AFTER DELETE ON {table_ident} \
             BEGIN \
             DELETE FROM {log} WHERE _table = {table_lit} AND _key = OLD.{id}; \
             INSERT INTO {log} (_key, _table, _action) VALUES (OLD.{id}, {table_lit}, 'D'); \
             END",
            name = quote_ident(&delete),
        ),
    ]
}

/// Installs capture on the tracked tables.
#[derive(Debug, Clone)]
pub struct ChangeCapture {
    store: RelationalStore,
}

impl ChangeCapture {
    pub fn new(store: RelationalStore) -> Self {
        Self { store }
    }

    /// Create the outbox and install capture on every table in `schema`,
    /// in table-name order.
    ///
    /// Stops at the first table that doesn't exist with
    /// [`ReplicationError::SchemaMismatch`]; tables before it stay installed.
    pub async fn install(&self, schema: &Schema) -> Result<()> {
        sqlx::query(&create_table_sql())
            .execute(self.store.pool())
            .await?;

        for table in schema.tables() {
            self.install_table(table).await?;
        }
        Ok(())
    }

    /// Install capture on a single table.
    pub async fn install_table(&self, table: &str) -> Result<()> {
        if !self.store.table_exists(table).await? {
            return Err(ReplicationError::SchemaMismatch {
                table: table.to_string(),
            });
        }

        let pool = self.store.pool();
        let added = execute_with_retry("capture_install", || async {
            let mut tx = pool.begin().await?;
            let added = install_in_tx(&mut tx, table).await?;
            tx.commit().await?;
            Ok::<_, sqlx::Error>(added)
        })
        .await?;

        if added {
            info!(table = %table, "Added tracking column");
        }
        info!(table = %table, "Change capture installed");
        crate::metrics::record_capture_installed(table);
        Ok(())
    }

    /// Whether the tracking column and all three triggers are present.
    pub async fn is_installed(&self, table: &str) -> Result<bool> {
        if !self.store.column_exists(table, TRACKING_COLUMN).await? {
            return Ok(false);
        }
        let [i, u, d] = trigger_names(table);
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'trigger' AND name IN (?, ?, ?)",
        )
        .bind(i)
        .bind(u)
        .bind(d)
        .fetch_one(self.store.pool())
        .await?;
        Ok(count == 3)
    }
}

/// Add the column if missing and create the triggers. Returns whether the
/// column was added.
async fn install_in_tx(
    tx: &mut Transaction<'_, Sqlite>,
    table: &str,
) -> std::result::Result<bool, sqlx::Error> {
    let has_column: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM pragma_table_info(?) WHERE name = ?")
            .bind(table)
            .bind(TRACKING_COLUMN)
            .fetch_one(&mut **tx)
            .await?;

    let added = has_column == 0;
    if added {
        let alter = format!(
            "ALTER TABLE {} ADD COLUMN {} TEXT",
            quote_ident(table),
            quote_ident(TRACKING_COLUMN)
        );
        sqlx::query(&alter).execute(&mut **tx).await?;
    }

    for ddl in trigger_sql(table) {
        debug!(table = %table, "Creating capture trigger");
        sqlx::query(&ddl).execute(&mut **tx).await?;
    }
    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelationalConfig;
    use crate::relational::{Action, Outbox};
    use serde_json::json;

    async fn store_with(tables: &[&str]) -> RelationalStore {
        let store = RelationalStore::open(&RelationalConfig::in_memory()).await.unwrap();
        for table in tables {
            sqlx::query(&format!(
                "CREATE TABLE {} (id INTEGER PRIMARY KEY, amount INTEGER)",
                table
            ))
            .execute(store.pool())
            .await
            .unwrap();
        }
        store
    }

    fn schema(tables: &[&str]) -> Schema {
        tables.iter().fold(Schema::new(), |schema, table| {
            schema.with_table(table, &[("id", "INTEGER"), ("amount", "INTEGER")])
        })
    }

    #[tokio::test]
    async fn test_install_is_idempotent() {
        let store = store_with(&["orders"]).await;
        let capture = ChangeCapture::new(store.clone());

        capture.install(&schema(&["orders"])).await.unwrap();
        capture.install(&schema(&["orders"])).await.unwrap();

        assert!(capture.is_installed("orders").await.unwrap());
        assert!(store.column_exists("orders", TRACKING_COLUMN).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_table_is_schema_mismatch() {
        let store = store_with(&["alpha"]).await;
        let capture = ChangeCapture::new(store);

        let err = capture.install(&schema(&["alpha", "beta"])).await.unwrap_err();
        match err {
            ReplicationError::SchemaMismatch { table } => assert_eq!(table, "beta"),
            other => panic!("expected SchemaMismatch, got {:?}", other),
        }
        // Earlier tables keep their capture
        assert!(capture.is_installed("alpha").await.unwrap());
    }

    #[tokio::test]
    async fn test_triggers_record_application_writes() {
        let store = store_with(&["orders"]).await;
        ChangeCapture::new(store.clone())
            .install(&schema(&["orders"]))
            .await
            .unwrap();
        let pool = store.pool();

        sqlx::query("INSERT INTO orders (id, amount) VALUES (1, 10)").execute(pool).await.unwrap();
        sqlx::query("INSERT INTO orders (id, amount) VALUES (2, 20)").execute(pool).await.unwrap();
        sqlx::query("UPDATE orders SET amount = 21 WHERE id = 2").execute(pool).await.unwrap();

        let entries = Outbox::new(store.clone()).entries().await.unwrap();
        let summary: Vec<(serde_json::Value, Action)> =
            entries.into_iter().map(|e| (e.key, e.action)).collect();
        assert_eq!(
            summary,
            vec![(json!(1), Action::Insert), (json!(2), Action::Update)]
        );
    }

    #[tokio::test]
    async fn test_row_history_collapses_to_latest_action() {
        let store = store_with(&["orders"]).await;
        ChangeCapture::new(store.clone())
            .install(&schema(&["orders"]))
            .await
            .unwrap();
        let pool = store.pool();

        sqlx::query("INSERT INTO orders (id, amount) VALUES (1, 10)").execute(pool).await.unwrap();
        sqlx::query("INSERT INTO orders (id, amount) VALUES (2, 20)").execute(pool).await.unwrap();
        sqlx::query("UPDATE orders SET amount = 11 WHERE id = 1").execute(pool).await.unwrap();
        sqlx::query("DELETE FROM orders WHERE id = 1").execute(pool).await.unwrap();

        let entries = Outbox::new(store.clone()).entries().await.unwrap();
        let summary: Vec<(serde_json::Value, Action)> =
            entries.into_iter().map(|e| (e.key, e.action)).collect();
        // Row 1 moved behind row 2 when it was last touched
        assert_eq!(
            summary,
            vec![(json!(2), Action::Insert), (json!(1), Action::Delete)]
        );
    }

    #[tokio::test]
    async fn test_stamped_writes_are_not_captured_except_delete() {
        let store = store_with(&["orders"]).await;
        ChangeCapture::new(store.clone())
            .install(&schema(&["orders"]))
            .await
            .unwrap();
        let pool = store.pool();

        sqlx::query("INSERT INTO orders (id, amount, _replicant_origin) VALUES (1, 10, 'm')")
            .execute(pool)
            .await
            .unwrap();
        sqlx::query("UPDATE orders SET amount = 12, _replicant_origin = 'm' WHERE id = 1")
            .execute(pool)
            .await
            .unwrap();
        let outbox = Outbox::new(store.clone());
        assert_eq!(outbox.len().await.unwrap(), 0);

        sqlx::query("DELETE FROM orders WHERE id = 1").execute(pool).await.unwrap();
        assert_eq!(outbox.len().await.unwrap(), 1);
    }

    #[test]
    fn test_trigger_names() {
        assert_eq!(
            trigger_names("orders"),
            [
                "_replicant_orders_i".to_string(),
                "_replicant_orders_u".to_string(),
                "_replicant_orders_d".to_string(),
            ]
        );
    }
}
