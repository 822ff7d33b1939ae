// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document Writer: applies a resolved outbox entry to the document store.
//!
//! - delete: remove the document if present, absent is fine
//! - absent: create it with the row as `payload`
//! - present: merge the row into `payload` field by field, last writer wins
//!
//! If the merge changes nothing the document is left alone, so a value that
//! just arrived from the change feed is not written back a second time.
//!
//! Every revision we write carries our origin marker, so the change reader
//! can tell it apart from writes by other clients when it comes back.

use super::{DocId, Document, DocumentStore, Payload};
use crate::error::Result;
use crate::flow::ApplyOutcome;
use crate::origin::OriginMarker;
use std::sync::Arc;
use tracing::debug;

pub struct DocumentWriter<D: DocumentStore> {
    store: Arc<D>,
    origin: Option<OriginMarker>,
}

impl<D: DocumentStore> DocumentWriter<D> {
    /// A writer that leaves no origin marker.
    pub fn new(store: Arc<D>) -> Self {
        Self { store, origin: None }
    }

    /// Stamp every written revision with `origin`.
    pub fn with_origin(mut self, origin: OriginMarker) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Apply one row (or its absence) to `"<table>/<key>"`.
    ///
    /// A missing row is treated as a delete regardless of `is_delete`.
    pub async fn apply(
        &self,
        table: &str,
        key: &str,
        row: Option<&Payload>,
        is_delete: bool,
    ) -> Result<ApplyOutcome> {
        let id = DocId::new(table, key).to_string();
        let outcome = match row {
            Some(row) if !is_delete => self.upsert(&id, row).await?,
            _ => self.delete(&id).await?,
        };
        debug!(id = %id, outcome = ?outcome, "Applied change to document store");
        Ok(outcome)
    }

    async fn upsert(&self, id: &str, row: &Payload) -> Result<ApplyOutcome> {
        match self.store.get(id).await? {
            None => {
                let mut doc = Document::new(id, row.clone());
                doc.origin = self.stamp();
                self.store.put(doc).await?;
                Ok(ApplyOutcome::Created)
            }
            Some(mut doc) => {
                if !super::merge_payload(&mut doc.payload, row) {
                    return Ok(ApplyOutcome::Unchanged);
                }
                doc.origin = self.stamp();
                self.store.put(doc).await?;
                Ok(ApplyOutcome::Updated)
            }
        }
    }

    fn stamp(&self) -> Option<String> {
        self.origin.as_ref().map(|o| o.as_str().to_string())
    }

    async fn delete(&self, id: &str) -> Result<ApplyOutcome> {
        let Some(doc) = self.store.get(id).await? else {
            return Ok(ApplyOutcome::AlreadyAbsent);
        };
        let rev = doc.rev.unwrap_or_default();
        if self.store.delete(id, &rev).await? {
            Ok(ApplyOutcome::Deleted)
        } else {
            Ok(ApplyOutcome::AlreadyAbsent)
        }
    }
}
