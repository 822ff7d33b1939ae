// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Origin tagging.
//!
//! Every tracked table carries a nullable [`TRACKING_COLUMN`]. The application
//! never writes it, so it stays `NULL` on application writes. The relational
//! writer stamps it with this database's [`OriginMarker`] on every write it
//! performs, and the capture triggers only fire while the column is `NULL`.
//! That is the whole loop-breaking mechanism on the relational side.
//!
//! Documents get the same treatment: the document writer puts the marker in
//! [`DOCUMENT_ORIGIN_FIELD`], and the change reader drops feed entries that
//! carry it, since they are our own writes coming back. Other clients replace
//! or remove the field when they write. CouchDB reserves top-level names
//! starting with `_`, hence the different spelling.
//!
//! The marker is a UUID minted once per database and kept in the meta table,
//! so it survives restarts. It is handed to the components that need it at
//! construction time; there is no process-wide marker.

use std::fmt;
use uuid::Uuid;

/// Prefix reserved for every object this crate creates in the relational store.
pub const RESERVED_PREFIX: &str = "_replicant";

/// Tracking column added to every tracked table.
pub const TRACKING_COLUMN: &str = "_replicant_origin";

/// Ordered outbox of captured local mutations.
pub const OUTBOX_TABLE: &str = "_replicant_log";

/// Single-row table holding the origin marker and checkpoint.
pub const META_TABLE: &str = "_replicant_meta";

/// Top-level document field holding the marker of the database that wrote it.
pub const DOCUMENT_ORIGIN_FIELD: &str = "replicant_origin";

/// Identity of one relational database, written into replicated rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OriginMarker(String);

impl OriginMarker {
    /// Mint a fresh marker for a database seen for the first time.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether a row's tracking value says it was written by replication.
    pub fn is_replicated(tracking: Option<&str>) -> bool {
        tracking.is_some()
    }

    /// Whether a tracking value carries this database's marker.
    pub fn is_own(&self, tracking: Option<&str>) -> bool {
        tracking == Some(self.0.as_str())
    }
}

impl fmt::Display for OriginMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
