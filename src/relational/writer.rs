// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Relational Writer: applies a change from the document feed to SQLite.
//!
//! Every insert and update stamps the tracking column with the origin marker,
//! which keeps the capture triggers quiet. Deletes are idempotent.
//!
//! # Dedup
//!
//! Before writing, the current row is compared with the incoming payload. If
//! every incoming column already holds that value the write is skipped
//! entirely. This is what stops our own outbound writes from echoing back
//! through the change feed and stamping a row the application owns.

use super::{bind_value, execute_with_retry, row_to_payload, values_match, RelationalStore};
use crate::document::Payload;
use crate::error::{ReplicationError, Result};
use crate::flow::ApplyOutcome;
use crate::origin::{OriginMarker, TRACKING_COLUMN};
use crate::schema::{quote_ident, Schema, ID_COLUMN};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

pub struct RelationalWriter {
    store: RelationalStore,
    schema: Arc<Schema>,
    origin: OriginMarker,
}

impl RelationalWriter {
    pub fn new(store: RelationalStore, schema: Arc<Schema>, origin: OriginMarker) -> Self {
        Self {
            store,
            schema,
            origin,
        }
    }

    pub fn origin(&self) -> &OriginMarker {
        &self.origin
    }

    /// Apply one change to `table`, keyed by the row id from the document id.
    ///
    /// Any database failure comes back as [`ReplicationError::ApplyFailed`].
    pub async fn apply(
        &self,
        table: &str,
        key: &str,
        payload: &Payload,
        deleted: bool,
    ) -> Result<ApplyOutcome> {
        let key_value = self.key_value(table, key);

        let result = if deleted {
            self.delete(table, &key_value).await
        } else {
            let columns = self.columns_for(table, payload, &key_value);
            self.upsert(table, &key_value, &columns).await
        };

        let outcome = result.map_err(|e| ReplicationError::apply_failed(table, key, e))?;
        debug!(table = %table, key = %key, outcome = ?outcome, "Applied change to relational store");
        Ok(outcome)
    }

    /// Typed row id: numeric when the `id` column is declared as an integer
    /// type and the key parses as one.
    pub fn key_value(&self, table: &str, key: &str) -> Value {
        let integer_id = self
            .schema
            .columns(table)
            .and_then(|cols| cols.iter().find(|c| c.name == ID_COLUMN))
            .map(|c| c.sql_type.to_ascii_uppercase().contains("INT"))
            .unwrap_or(false);
        if integer_id {
            if let Ok(n) = key.parse::<i64>() {
                return Value::from(n);
            }
        }
        Value::String(key.to_string())
    }

    /// Payload restricted to declared columns, with `id` filled from the key
    /// when absent.
    fn columns_for(&self, table: &str, payload: &Payload, key: &Value) -> Vec<(String, Value)> {
        let mut columns: Vec<(String, Value)> = payload
            .iter()
            .filter(|(name, _)| name.as_str() != TRACKING_COLUMN && self.schema.has_column(table, name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        if !columns.iter().any(|(name, _)| name == ID_COLUMN) {
            columns.push((ID_COLUMN.to_string(), key.clone()));
        }
        columns
    }

    async fn delete(&self, table: &str, key: &Value) -> std::result::Result<ApplyOutcome, sqlx::Error> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?",
            quote_ident(table),
            quote_ident(ID_COLUMN)
        );
        let pool = self.store.pool();
        let result = execute_with_retry("relational_delete", || async {
            bind_value(sqlx::query(&sql), key).execute(pool).await
        })
        .await?;
        Ok(if result.rows_affected() > 0 {
            ApplyOutcome::Deleted
        } else {
            ApplyOutcome::AlreadyAbsent
        })
    }

    async fn upsert(
        &self,
        table: &str,
        key: &Value,
        columns: &[(String, Value)],
    ) -> std::result::Result<ApplyOutcome, sqlx::Error> {
        execute_with_retry("relational_upsert", || self.upsert_once(table, key, columns)).await
    }

    async fn upsert_once(
        &self,
        table: &str,
        key: &Value,
        columns: &[(String, Value)],
    ) -> std::result::Result<ApplyOutcome, sqlx::Error> {
        let table_ident = quote_ident(table);
        let id_ident = quote_ident(ID_COLUMN);
        let origin_ident = quote_ident(TRACKING_COLUMN);

        let mut tx = self.store.pool().begin().await?;

        let select = format!("SELECT * FROM {} WHERE {} = ?", table_ident, id_ident);
        let existing = bind_value(sqlx::query(&select), key)
            .fetch_optional(&mut *tx)
            .await?;

        let outcome = match existing {
            Some(row) => {
                let current = row_to_payload(&row).map_err(|e| sqlx::Error::Protocol(e.to_string()))?;
                let unchanged = columns.iter().all(|(name, value)| {
                    current
                        .get(name)
                        .map(|stored| values_match(stored, value))
                        .unwrap_or(false)
                });
                if unchanged {
                    tx.rollback().await?;
                    return Ok(ApplyOutcome::Unchanged);
                }

                let assignments: Vec<String> = columns
                    .iter()
                    .map(|(name, _)| format!("{} = ?", quote_ident(name)))
                    .chain(std::iter::once(format!("{} = ?", origin_ident)))
                    .collect();
                let update = format!(
                    "UPDATE {} SET {} WHERE {} = ?",
                    table_ident,
                    assignments.join(", "),
                    id_ident
                );
                let mut query = sqlx::query(&update);
                for (_, value) in columns {
                    query = bind_value(query, value);
                }
                query = query.bind(self.origin.as_str().to_string());
                query = bind_value(query, key);
                query.execute(&mut *tx).await?;
                ApplyOutcome::Updated
            }
            None => {
                let names: Vec<String> = columns
                    .iter()
                    .map(|(name, _)| quote_ident(name))
                    .chain(std::iter::once(origin_ident.clone()))
                    .collect();
                let placeholders = vec!["?"; names.len()].join(", ");
                let insert = format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    table_ident,
                    names.join(", "),
                    placeholders
                );
                let mut query = sqlx::query(&insert);
                for (_, value) in columns {
                    query = bind_value(query, value);
                }
                query = query.bind(self.origin.as_str().to_string());
                query.execute(&mut *tx).await?;
                ApplyOutcome::Created
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }
}
