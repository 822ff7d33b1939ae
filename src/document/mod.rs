// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document store integration.
//!
//! Defines what we need from the document side and the types that cross the
//! boundary. All relational tables share one document namespace through the
//! composite id `"<table>/<rowId>"`; each document keeps the row's column
//! values under `payload`:
//!
//! ```json
//! { "_id": "orders/1", "_rev": "3-9f1c…", "payload": { "id": 1, "amount": 10 },
//!   "replicant_origin": "4d98…" }
//! ```
//!
//! `replicant_origin` is present only on documents this crate wrote last.
//!
//! The [`DocumentStore`] trait is the seam between the replication logic and
//! the transport. [`CouchDbStore`] talks to CouchDB over HTTP;
//! [`MemoryDocumentStore`] keeps everything in process for tests and
//! standalone runs.
//!
//! # Example
//!
//! ```rust,no_run
//! use replicant::document::{BoxFuture, Change, Document, DocumentStore, Sequence};
//!
//! struct MyBackend { /* ... */ }
//!
//! impl DocumentStore for MyBackend {
//!     fn get(&self, _id: &str) -> BoxFuture<'_, Option<Document>> {
//!         Box::pin(async move { Ok(None) })
//!     }
//!
//!     fn put(&self, _doc: Document) -> BoxFuture<'_, String> {
//!         Box::pin(async move { Ok("1-abc".to_string()) })
//!     }
//!
//!     fn delete(&self, _id: &str, _rev: &str) -> BoxFuture<'_, bool> {
//!         Box::pin(async move { Ok(true) })
//!     }
//!
//!     fn changes(&self, _since: Option<&Sequence>) -> BoxFuture<'_, Vec<Change>> {
//!         Box::pin(async move { Ok(vec![]) })
//!     }
//! }
//! ```

pub mod couch;
pub mod memory;
pub mod reader;
pub mod writer;

pub use couch::CouchDbStore;
pub use memory::MemoryDocumentStore;
pub use reader::{ChangeReader, InboundChange, ReadReport};
pub use writer::DocumentWriter;

use crate::error::Result;
use crate::resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = futures::future::BoxFuture<'a, Result<T>>;

/// Column values of one row, as carried in a document's `payload`.
pub type Payload = Map<String, Value>;

/// Trait defining what we need from the document store.
///
/// Implementations report transport problems as
/// [`ReplicationError::Transport`](crate::ReplicationError::Transport) and
/// stale revisions as [`ReplicationError::Conflict`](crate::ReplicationError::Conflict).
pub trait DocumentStore: Send + Sync + 'static {
    /// Fetch the current revision of a document. `None` if absent or deleted.
    fn get(&self, id: &str) -> BoxFuture<'_, Option<Document>>;

    /// Create (no `rev`) or update (matching `rev`) a document.
    ///
    /// Returns the new revision.
    fn put(&self, doc: Document) -> BoxFuture<'_, String>;

    /// Delete a document at the given revision.
    ///
    /// Returns `false` if it was already gone.
    fn delete(&self, id: &str, rev: &str) -> BoxFuture<'_, bool>;

    /// The change feed strictly after `since` (from the start when `None`),
    /// in feed order, with full document bodies and deleted markers.
    fn changes(&self, since: Option<&Sequence>) -> BoxFuture<'_, Vec<Change>>;

    /// Wait until the store is reachable and usable.
    ///
    /// Called once when the engine starts. Default: ready immediately.
    fn ensure_ready<'a>(&'a self, _retry: &'a RetryConfig) -> BoxFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Sequence
// ═══════════════════════════════════════════════════════════════════════════════

/// A position in the change feed.
///
/// CouchDB 1.x reports plain integers; 2.x and later report opaque tokens of
/// the form `"<n>-<opaque>"`. We order by the integer and hand the raw
/// token back to the store when resuming.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sequence {
    number: u64,
    token: String,
}

impl Sequence {
    pub fn new(number: u64, token: impl Into<String>) -> Self {
        Self {
            number,
            token: token.into(),
        }
    }

    pub fn from_number(number: u64) -> Self {
        Self::new(number, number.to_string())
    }

    /// Parse a raw token (`"7"` or `"7-g1AAAA…"`).
    pub fn parse(token: &str) -> Option<Self> {
        parse_sequence_number(token).map(|number| Self::new(number, token))
    }

    /// Parse a `seq` value as it appears in a change feed (number or string).
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_u64().map(Self::from_number),
            Value::String(s) => Self::parse(s),
            _ => None,
        }
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl Ord for Sequence {
    fn cmp(&self, other: &Self) -> Ordering {
        self.number
            .cmp(&other.number)
            .then_with(|| self.token.cmp(&other.token))
    }
}

impl PartialOrd for Sequence {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token)
    }
}

/// Leading integer of a sequence token.
///
/// Returns `None` for anything that doesn't start with ASCII digits followed
/// by either the end of the string or a `-`.
pub fn parse_sequence_number(token: &str) -> Option<u64> {
    let digits = match token.split_once('-') {
        Some((prefix, _)) => prefix,
        None => token,
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

// ═══════════════════════════════════════════════════════════════════════════════
// DocId
// ═══════════════════════════════════════════════════════════════════════════════

/// Composite document id: `"<table>/<rowId>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocId {
    pub table: String,
    pub key: String,
}

impl DocId {
    pub fn new(table: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            key: key.into(),
        }
    }

    /// Split on the first `/`. Both halves must be non-empty.
    pub fn parse(id: &str) -> Option<Self> {
        let (table, key) = id.split_once('/')?;
        if table.is_empty() || key.is_empty() {
            return None;
        }
        Some(Self::new(table, key))
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.key)
    }
}

/// Render a row id value as the key half of a [`DocId`].
///
/// Strings are used verbatim, everything else through its JSON form
/// (`1` → `"1"`).
pub fn key_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Document / Change
// ═══════════════════════════════════════════════════════════════════════════════

/// A document as stored: id, revision, payload, and any other top-level
/// fields other clients put there (kept as-is on update).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(rename = "_id")]
    pub id: String,

    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,

    #[serde(default, deserialize_with = "payload_or_empty")]
    pub payload: Payload,

    /// Marker of the database whose replication wrote this revision.
    #[serde(
        rename = "replicant_origin",
        default,
        deserialize_with = "origin_or_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub origin: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `payload` that is missing, null, or not an object reads as empty.
fn payload_or_empty<'de, D>(deserializer: D) -> std::result::Result<Payload, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Object(map) => map,
        _ => Map::new(),
    })
}

/// A non-string origin is somebody else's data, not our marker.
fn origin_or_none<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(s) => Some(s),
        _ => None,
    })
}

impl Document {
    /// A new document (no revision yet).
    pub fn new(id: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: id.into(),
            rev: None,
            payload,
            origin: None,
            extra: Map::new(),
        }
    }

    /// Decode a document body from JSON.
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| crate::error::ReplicationError::Decode(format!("document body: {}", e)))
    }
}

/// One entry of the change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub seq: Sequence,
    pub id: String,
    pub deleted: bool,
    /// Full document body at this change (`include_docs`).
    pub doc: Option<Value>,
}

impl Change {
    /// The `payload` object of the body, empty when absent (e.g. deletes).
    pub fn payload(&self) -> Payload {
        self.doc
            .as_ref()
            .and_then(|doc| doc.get("payload"))
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    }

    /// Origin marker in the body, if the writer left one.
    pub fn origin(&self) -> Option<&str> {
        self.doc
            .as_ref()
            .and_then(|doc| doc.get(crate::origin::DOCUMENT_ORIGIN_FIELD))
            .and_then(Value::as_str)
    }
}

/// Revision generation: the integer before the `-` in `"3-abc"`.
pub fn rev_generation(rev: &str) -> Option<u64> {
    parse_sequence_number(rev)
}

/// Field-wise merge, last writer wins. Returns whether `existing` changed.
pub fn merge_payload(existing: &mut Payload, update: &Payload) -> bool {
    let mut changed = false;
    for (key, value) in update {
        if existing.get(key) != Some(value) {
            existing.insert(key.clone(), value.clone());
            changed = true;
        }
    }
    changed
}
