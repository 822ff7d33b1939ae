// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for a replication pair.
//!
//! Configuration is passed to
//! [`ReplicationEngine::new()`](crate::ReplicationEngine::new) and can be
//! constructed programmatically or deserialized from JSON/YAML. Loading it
//! from files, flags or the environment is the host's business.
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── pair_id: String               # Name used in logs/metrics
//! ├── relational: RelationalConfig  # SQLite database with the tracked tables
//! ├── document: DocumentStoreConfig # CouchDB server + database
//! ├── cycle: CycleConfig            # Cadence + since override
//! └── schema: Schema                # Tracked tables and their columns
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "pair_id": "orders-eu",
//!   "relational": { "sqlite_path": "/var/lib/app/data.db" },
//!   "document": { "url": "http://couch:5984", "database": "data" },
//!   "cycle": { "interval": "10s" },
//!   "schema": { "orders": [ {"id": "INTEGER"}, {"amount": "INTEGER"} ] }
//! }
//! ```
//!
//! The keys used by older deployments (`sql_uri`, `nosql_uri`,
//! `database_name`) are accepted as aliases.

use crate::document::Sequence;
use crate::error::{ReplicationError, Result};
use crate::schema::Schema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything needed to run one relational <-> document replication pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Name of this pair in logs and health output.
    #[serde(default = "default_pair_id")]
    pub pair_id: String,

    #[serde(default)]
    pub relational: RelationalConfig,

    #[serde(default)]
    pub document: DocumentStoreConfig,

    #[serde(default)]
    pub cycle: CycleConfig,

    /// Tracked tables. Read-only to the engine.
    #[serde(default)]
    pub schema: Schema,
}

fn default_pair_id() -> String {
    "default".to_string()
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            pair_id: default_pair_id(),
            relational: RelationalConfig::default(),
            document: DocumentStoreConfig::default(),
            cycle: CycleConfig::default(),
            schema: Schema::default(),
        }
    }
}

impl ReplicationConfig {
    /// Create a minimal config for testing against a given SQLite file.
    pub fn for_testing(sqlite_path: &str, schema: Schema) -> Self {
        Self {
            pair_id: "test".to_string(),
            relational: RelationalConfig {
                sqlite_path: sqlite_path.to_string(),
                wal_mode: false,
                max_connections: 1,
            },
            document: DocumentStoreConfig::default(),
            cycle: CycleConfig {
                interval: "50ms".to_string(),
                since: None,
                shutdown_timeout: "2s".to_string(),
            },
            schema,
        }
    }

    /// Parse a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| ReplicationError::Config(format!("invalid config JSON: {}", e)))
    }

    /// Check the config is usable before anything touches a store.
    pub fn validate(&self) -> Result<()> {
        if self.schema.is_empty() {
            return Err(ReplicationError::Config("schema declares no tables".to_string()));
        }
        self.schema.validate()?;
        self.document.validate()?;
        self.cycle.validate()?;
        if self.relational.sqlite_path.is_empty() {
            return Err(ReplicationError::Config("sqlite_path is empty".to_string()));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RelationalConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// SQLite database holding the tracked tables, the outbox and the checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationalConfig {
    /// Path to the SQLite database (`:memory:` for a private in-memory db).
    #[serde(alias = "sql_uri")]
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,

    /// Pool size. Forced to 1 for `:memory:`.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_true() -> bool {
    true
}

fn default_max_connections() -> u32 {
    4
}

impl Default for RelationalConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "data.db".to_string(),
            wal_mode: true,
            max_connections: 4,
        }
    }
}

impl RelationalConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
            max_connections: 1,
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.sqlite_path == ":memory:"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DocumentStoreConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// CouchDB server and database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentStoreConfig {
    /// Server URL, e.g. `http://127.0.0.1:5984`.
    #[serde(alias = "nosql_uri", default = "default_document_url")]
    pub url: String,

    /// Database name inside the server.
    #[serde(alias = "database_name", default = "default_database")]
    pub database: String,

    /// Create the database on connect if it does not exist.
    #[serde(default = "default_true")]
    pub create_database: bool,

    /// Per-request timeout as a duration string (e.g., "30s").
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

fn default_document_url() -> String {
    "http://127.0.0.1:5984".to_string()
}

fn default_database() -> String {
    "data".to_string()
}

fn default_request_timeout() -> String {
    "30s".to_string()
}

impl Default for DocumentStoreConfig {
    fn default() -> Self {
        Self {
            url: default_document_url(),
            database: default_database(),
            create_database: true,
            request_timeout: default_request_timeout(),
            username: None,
            password: None,
        }
    }
}

impl DocumentStoreConfig {
    /// Parse the request_timeout string to a Duration.
    pub fn request_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.request_timeout).unwrap_or(Duration::from_secs(30))
    }

    pub fn validate(&self) -> Result<()> {
        reqwest::Url::parse(&self.url)
            .map_err(|e| ReplicationError::Config(format!("invalid document store url '{}': {}", self.url, e)))?;
        if !is_valid_database_name(&self.database) {
            return Err(ReplicationError::Config(format!(
                "invalid database name '{}'",
                self.database
            )));
        }
        Ok(())
    }
}

/// CouchDB database names: `^[a-z][a-z0-9_$()+/-]*$`.
fn is_valid_database_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "_$()+/-".contains(c))
}

// ═══════════════════════════════════════════════════════════════════════════════
// CycleConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Cycle cadence when the engine drives its own loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleConfig {
    /// Delay between cycles as a duration string (e.g., "5s").
    #[serde(default = "default_interval")]
    pub interval: String,

    /// Read the change feed from this sequence on the first cycle instead of
    /// the stored checkpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<String>,

    /// How long shutdown waits for the cycle in flight (e.g., "10s").
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: String,
}

fn default_interval() -> String {
    "5s".to_string()
}

fn default_shutdown_timeout() -> String {
    "10s".to_string()
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            since: None,
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl CycleConfig {
    /// Parse the interval string to a Duration.
    pub fn interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.interval).unwrap_or(Duration::from_secs(5))
    }

    /// Parse the shutdown timeout string to a Duration.
    pub fn shutdown_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.shutdown_timeout).unwrap_or(Duration::from_secs(10))
    }

    /// The since override, parsed.
    pub fn since_sequence(&self) -> Result<Option<Sequence>> {
        match &self.since {
            None => Ok(None),
            Some(token) => Sequence::parse(token)
                .map(Some)
                .ok_or_else(|| ReplicationError::Config(format!("invalid since sequence '{}'", token))),
        }
    }

    pub fn validate(&self) -> Result<()> {
        humantime::parse_duration(&self.interval)
            .map_err(|e| ReplicationError::Config(format!("invalid cycle interval '{}': {}", self.interval, e)))?;
        humantime::parse_duration(&self.shutdown_timeout).map_err(|e| {
            ReplicationError::Config(format!("invalid shutdown timeout '{}': {}", self.shutdown_timeout, e))
        })?;
        self.since_sequence()?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
