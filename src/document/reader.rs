// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document Change Reader.
//!
//! Pulls the change feed after a checkpoint and hands each change to an apply
//! function, in feed order.
//!
//! ```text
//! changes(since) ──► split "table/key" ──► apply(change) ──► Flow
//!                         │                                   │
//!                         └─ unknown table: skip ─┐           ├─ Continue: candidate = seq, next
//!                            own write: skip ─────┤           │
//!                                                 ▼           ├─ StopSuccess: candidate = seq, stop
//!                                          candidate = seq    └─ StopFailure: stop, report failure
//! ```
//!
//! The reader never persists anything. The caller decides whether the
//! returned candidate becomes the new checkpoint (only when the whole batch
//! succeeded).

use super::{Change, DocId, DocumentStore, Payload, Sequence};
use crate::error::Result;
use crate::flow::Flow;
use crate::origin::OriginMarker;
use crate::schema::Schema;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// A decoded change ready to be applied to the relational store.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundChange {
    pub seq: Sequence,
    pub table: String,
    pub key: String,
    /// Column values; empty for deletes.
    pub payload: Payload,
    pub deleted: bool,
}

/// Result of one pass over the change feed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadReport {
    /// `false` if the apply function rejected a change.
    pub success: bool,
    /// Sequence of the last change that was applied or skipped.
    /// `None` if nothing was consumed.
    pub checkpoint: Option<Sequence>,
    /// Sequence of the rejected change, if any.
    pub failed_at: Option<Sequence>,
    pub applied: usize,
    /// Changes for ids outside the tracked tables, plus our own writes.
    pub skipped: usize,
}

/// Reads the change feed for the tables in a schema.
pub struct ChangeReader<D: DocumentStore> {
    store: Arc<D>,
    schema: Arc<Schema>,
    origin: Option<OriginMarker>,
}

impl<D: DocumentStore> ChangeReader<D> {
    pub fn new(store: Arc<D>, schema: Arc<Schema>) -> Self {
        Self {
            store,
            schema,
            origin: None,
        }
    }

    /// Skip revisions stamped with `origin`.
    pub fn with_origin(mut self, origin: OriginMarker) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Decode a raw change. `None` for ids that don't belong to a tracked
    /// table (design documents, foreign data) and for revisions we wrote.
    pub fn decode(&self, change: &Change) -> Option<InboundChange> {
        let id = DocId::parse(&change.id)?;
        if !self.schema.contains_table(&id.table) {
            return None;
        }
        if let Some(origin) = &self.origin {
            if !change.deleted && origin.is_own(change.origin()) {
                return None;
            }
        }
        Some(InboundChange {
            seq: change.seq.clone(),
            payload: if change.deleted {
                Payload::new()
            } else {
                change.payload()
            },
            table: id.table,
            key: id.key,
            deleted: change.deleted,
        })
    }

    /// Read everything after `since` and apply it in order.
    ///
    /// Returns `Err` only if the feed itself could not be fetched; a rejected
    /// change is reported through [`ReadReport::success`].
    pub async fn read<F, Fut>(&self, since: Option<&Sequence>, mut apply: F) -> Result<ReadReport>
    where
        F: FnMut(InboundChange) -> Fut,
        Fut: Future<Output = Flow>,
    {
        let start = Instant::now();
        let changes = self.store.changes(since).await?;
        crate::metrics::record_feed_read(changes.len(), start.elapsed());

        let mut report = ReadReport {
            success: true,
            ..Default::default()
        };

        for change in changes {
            let Some(inbound) = self.decode(&change) else {
                debug!(id = %change.id, seq = %change.seq, "Skipping foreign or own change");
                report.skipped += 1;
                report.checkpoint = Some(change.seq);
                continue;
            };

            let seq = inbound.seq.clone();
            let flow = apply(inbound).await;

            if !flow.consumed() {
                warn!(id = %change.id, seq = %seq, "Change rejected, stopping feed read");
                report.success = false;
                report.failed_at = Some(seq);
                break;
            }

            report.applied += 1;
            report.checkpoint = Some(seq);

            if !flow.proceed() {
                break;
            }
        }

        Ok(report)
    }
}
