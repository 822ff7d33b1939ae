// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tracked table declarations.
//!
//! The schema is static input: which tables replicate, and which of their
//! columns travel in a document's `payload`. It is never derived from the
//! database. The external form is the one operators already write:
//!
//! ```json
//! { "orders": [ {"id": "INTEGER"}, {"amount": "INTEGER"} ] }
//! ```
//!
//! Names end up spliced into DDL (triggers, `ALTER TABLE`), so they are
//! restricted to plain identifiers and checked by [`Schema::validate`].

use crate::error::{ReplicationError, Result};
use crate::origin::RESERVED_PREFIX;
use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// Name of the per-row unique identifier column every tracked table must have.
pub const ID_COLUMN: &str = "id";

/// A single column declaration (`{"amount": "INTEGER"}`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub sql_type: String,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: sql_type.into(),
        }
    }
}

impl Serialize for ColumnDef {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(&self.name, &self.sql_type)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for ColumnDef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let entry: BTreeMap<String, String> = BTreeMap::deserialize(deserializer)?;
        if entry.len() != 1 {
            return Err(D::Error::custom(format!(
                "column definition must have exactly one entry, got {}",
                entry.len()
            )));
        }
        let (name, sql_type) = entry.into_iter().next().ok_or_else(|| D::Error::custom("empty column definition"))?;
        Ok(Self { name, sql_type })
    }
}

/// Mapping from table name to its column definitions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    tables: BTreeMap<String, Vec<ColumnDef>>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style table declaration.
    pub fn with_table(mut self, table: &str, columns: &[(&str, &str)]) -> Self {
        self.tables.insert(
            table.to_string(),
            columns.iter().map(|(n, t)| ColumnDef::new(*n, *t)).collect(),
        );
        self
    }

    /// Tracked table names, in a stable order.
    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn columns(&self, table: &str) -> Option<&[ColumnDef]> {
        self.tables.get(table).map(Vec::as_slice)
    }

    pub fn contains_table(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    /// Whether `column` is declared for `table`.
    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.columns(table)
            .map(|cols| cols.iter().any(|c| c.name == column))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Check names are safe to use in generated SQL.
    pub fn validate(&self) -> Result<()> {
        for (table, columns) in &self.tables {
            if !is_identifier(table) {
                return Err(ReplicationError::Config(format!(
                    "invalid table name '{}'",
                    table
                )));
            }
            if table.starts_with(RESERVED_PREFIX) {
                return Err(ReplicationError::Config(format!(
                    "table name '{}' uses the reserved {} prefix",
                    table, RESERVED_PREFIX
                )));
            }
            for column in columns {
                if !is_identifier(&column.name) || column.name.starts_with(RESERVED_PREFIX) {
                    return Err(ReplicationError::Config(format!(
                        "invalid column name '{}' in table '{}'",
                        column.name, table
                    )));
                }
            }
            if !columns.iter().any(|c| c.name == ID_COLUMN) {
                return Err(ReplicationError::Config(format!(
                    "table '{}' must declare an '{}' column",
                    table, ID_COLUMN
                )));
            }
        }
        Ok(())
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Double-quote an identifier for SQLite.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
