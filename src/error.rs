// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication engine.
//!
//! Errors are categorized by the store they come from (SQLite, CouchDB) and
//! by whether the next cycle can be expected to succeed where this one failed.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `SchemaMismatch` | No | Tracked table missing when capture is installed |
//! | `ApplyFailed` | Yes | A single change could not be written to the target store |
//! | `Transport` | Yes | Document store unreachable, HTTP failure |
//! | `Conflict` | Yes | Document revision conflict (someone else wrote first) |
//! | `Database` | No | Local SQLite errors (needs operator attention) |
//! | `Decode` | No | Malformed document or change feed body |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Engine state machine violation |
//! | `Shutdown` | No | Engine is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! Deleting something that is already gone is **not** an error anywhere in
//! this crate; both writers treat it as a successful no-op.

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur during replication.
///
/// Use [`is_retryable()`](Self::is_retryable) to check whether a later cycle
/// may succeed without operator intervention.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// A table named in the schema does not exist in the relational store.
    ///
    /// Raised by change capture installation. Not retryable - the table has
    /// to be created before replication can be set up for it.
    #[error("Schema mismatch: table '{table}' does not exist")]
    SchemaMismatch { table: String },

    /// A single change could not be applied to the target store.
    ///
    /// The outbox entry or checkpoint position is left untouched so the next
    /// cycle retries it.
    #[error("Apply failed ({table}/{key}): {message}")]
    ApplyFailed {
        table: String,
        key: String,
        message: String,
    },

    /// HTTP error talking to the document store.
    #[error("Transport error ({operation}): {message}")]
    Transport {
        operation: String,
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// Document revision conflict.
    ///
    /// Somebody updated the document between our read and our write.
    #[error("Document conflict: {id}")]
    Conflict { id: String },

    /// SQLite error in the relational store.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Malformed document or change feed entry.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Engine state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a transport error from a reqwest::Error
    pub fn transport(operation: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Transport {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a transport error without source
    pub fn transport_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create an apply failure for a table/key pair
    pub fn apply_failed(
        table: impl Into<String>,
        key: impl Into<String>,
        message: impl std::fmt::Display,
    ) -> Self {
        Self::ApplyFailed {
            table: table.into(),
            key: key.into(),
            message: message.to_string(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ApplyFailed { .. } => true,
            Self::Transport { .. } => true,
            Self::Conflict { .. } => true,
            Self::SchemaMismatch { .. } => false,
            Self::Database(_) => false, // busy/locked is retried below this layer
            Self::Decode(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SchemaMismatch { .. } => "schema_mismatch",
            Self::ApplyFailed { .. } => "apply_failed",
            Self::Transport { .. } => "transport",
            Self::Conflict { .. } => "conflict",
            Self::Database(_) => "database",
            Self::Decode(_) => "decode",
            Self::Config(_) => "config",
            Self::InvalidState { .. } => "invalid_state",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}
