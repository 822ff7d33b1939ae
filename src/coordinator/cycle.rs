// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication cycle.
//!
//! One cycle, always in this order:
//!
//! ```text
//! ┌─ Inbound ───────────────────────────────────────────────┐
//! │ changes(since checkpoint) → RelationalWriter per change │
//! │ whole batch ok? → persist checkpoint                    │
//! └─────────────────────────────────────────────────────────┘
//!                     │ (skipped if inbound failed)
//!                     ▼
//! ┌─ Outbound ──────────────────────────────────────────────┐
//! │ outbox head → resolve row → DocumentWriter → remove     │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Nothing is rolled back. A failure leaves the checkpoint and the outbox
//! exactly where the failing step found them, so the next cycle picks up from
//! there. Delivery is at-least-once inbound (a batch may be re-read) and
//! at-most-once per outbox entry outbound (an entry is gone once applied).
//!
//! A cycle returns `Err` only for infrastructure failures; a rejected change
//! shows up as [`CycleOutcome::InboundFailed`] / [`CycleOutcome::OutboundFailed`].
//!
//! Inbound never undoes a local change that is still queued. Our own document
//! revisions carry the origin marker and are skipped by the reader. Tombstones
//! carry nothing, so a delete for a row with a pending outbox entry is
//! deferred and the outbound half pushes the row as it is now.

use super::types::{CycleOutcome, CyclePhase, CycleReport};
use crate::document::{
    key_to_string, ChangeReader, DocumentStore, DocumentWriter, InboundChange, ReadReport, Sequence,
};
use crate::error::Result;
use crate::flow::{ApplyOutcome, Flow};
use crate::metrics;
use crate::origin::OriginMarker;
use crate::relational::{
    ChangeCapture, CheckpointStore, DrainReport, Outbox, RelationalStore, RelationalWriter,
};
use crate::schema::Schema;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, Instrument};

/// Inbound result plus what happened to the checkpoint.
#[derive(Debug, Clone)]
pub struct InboundReport {
    pub read: ReadReport,
    pub advanced: bool,
}

/// Runs cycles for one relational database / document database pair.
///
/// Cycles must not overlap; the internal lock serializes callers.
pub struct Replicator<D: DocumentStore> {
    pair_id: String,
    reader: ChangeReader<D>,
    documents: DocumentWriter<D>,
    relational: RelationalWriter,
    outbox: Outbox,
    checkpoints: CheckpointStore,
    /// One-shot `since` override, cleared by the first successful inbound.
    since_override: Mutex<Option<Sequence>>,
    /// Held for the duration of a cycle.
    cycle_lock: Mutex<()>,
}

impl<D: DocumentStore> Replicator<D> {
    /// Install capture on the schema's tables and load the checkpoint.
    pub async fn open(
        pair_id: impl Into<String>,
        store: RelationalStore,
        document_store: Arc<D>,
        schema: Arc<Schema>,
    ) -> Result<Self> {
        ChangeCapture::new(store.clone()).install(&schema).await?;
        let checkpoints = CheckpointStore::open(store.clone()).await?;
        let origin = checkpoints.origin().clone();

        Ok(Self {
            pair_id: pair_id.into(),
            reader: ChangeReader::new(document_store.clone(), schema.clone()).with_origin(origin.clone()),
            documents: DocumentWriter::new(document_store).with_origin(origin.clone()),
            relational: RelationalWriter::new(store.clone(), schema, origin),
            outbox: Outbox::new(store),
            checkpoints,
            since_override: Mutex::new(None),
            cycle_lock: Mutex::new(()),
        })
    }

    /// Read the feed from `since` on the next cycle instead of the checkpoint.
    pub async fn set_since_override(&self, since: Option<Sequence>) {
        *self.since_override.lock().await = since;
    }

    pub fn pair_id(&self) -> &str {
        &self.pair_id
    }

    pub fn origin(&self) -> &OriginMarker {
        self.checkpoints.origin()
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Run one full cycle.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let span = info_span!("cycle", pair = %self.pair_id);
        async {
            let _guard = self.cycle_lock.lock().await;
            let start = Instant::now();

            let result = self.cycle_inner(start).await;
            let outcome = match &result {
                Ok(report) => report.outcome,
                Err(_) => CycleOutcome::Errored,
            };
            metrics::record_cycle(outcome.as_str(), start.elapsed());

            match &result {
                Ok(report) if report.did_work() || !report.outcome.is_success() => info!(
                    outcome = outcome.as_str(),
                    inbound = report.inbound_applied,
                    skipped = report.inbound_skipped,
                    outbound = report.outbound_applied,
                    checkpoint = ?report.checkpoint.as_ref().map(Sequence::number),
                    duration_ms = report.duration.as_millis(),
                    "Cycle finished"
                ),
                Ok(_) => debug!("Cycle finished, nothing to do"),
                Err(e) => tracing::warn!(error = %e, "Cycle aborted"),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn cycle_inner(&self, start: Instant) -> Result<CycleReport> {
        let inbound = self.inbound().await?;
        let mut report = CycleReport {
            outcome: CycleOutcome::Completed,
            failed_phase: None,
            inbound_applied: inbound.read.applied,
            inbound_skipped: inbound.read.skipped,
            checkpoint: None,
            checkpoint_advanced: inbound.advanced,
            outbound_applied: 0,
            error: None,
            duration: start.elapsed(),
        };

        if !inbound.read.success {
            report.outcome = CycleOutcome::InboundFailed;
            report.failed_phase = Some(CyclePhase::Inbound);
        } else {
            let drained = self.outbound().await?;
            report.outbound_applied = drained.applied;
            if !drained.success {
                report.outcome = CycleOutcome::OutboundFailed;
                report.failed_phase = Some(CyclePhase::Outbound);
            }
        }

        report.checkpoint = self.checkpoints.get().await;
        report.duration = start.elapsed();
        Ok(report)
    }

    /// Pull the feed since the checkpoint and apply it locally. The checkpoint
    /// moves only if every change in the batch was applied.
    pub async fn inbound(&self) -> Result<InboundReport> {
        let mut override_slot = self.since_override.lock().await;
        let since = match override_slot.clone() {
            Some(seq) => {
                info!(since = %seq, "Reading change feed from override");
                Some(seq)
            }
            None => self.checkpoints.get().await,
        };

        let read = self
            .reader
            .read(since.as_ref(), move |change| async move {
                let result = self.apply_inbound(&change).await;
                record_outcome(Direction::Inbound, &change.table, &result);
                Flow::from_apply(&result)
            })
            .await?;

        let mut advanced = false;
        if read.success {
            *override_slot = None;
            if let Some(seq) = &read.checkpoint {
                advanced = self.checkpoints.set(seq).await?;
            }
        }

        Ok(InboundReport { read, advanced })
    }

    async fn apply_inbound(&self, change: &InboundChange) -> Result<ApplyOutcome> {
        if change.deleted {
            let key = self.relational.key_value(&change.table, &change.key);
            if self.outbox.has_pending(&change.table, &key).await? {
                debug!(table = %change.table, key = %change.key, "Local change pending, deferring delete");
                return Ok(ApplyOutcome::Deferred);
            }
        }
        self.relational
            .apply(&change.table, &change.key, &change.payload, change.deleted)
            .await
    }

    /// Drain the outbox into the document store.
    pub async fn outbound(&self) -> Result<DrainReport> {
        let writer = &self.documents;
        self.outbox
            .drain(move |pending| async move {
                let key = key_to_string(&pending.entry.key);
                let result = writer
                    .apply(&pending.entry.table, &key, pending.row.as_ref(), pending.is_delete)
                    .await;
                record_outcome(Direction::Outbound, &pending.entry.table, &result);
                Flow::from_apply(&result)
            })
            .await
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Inbound,
    Outbound,
}

fn record_outcome(direction: Direction, table: &str, result: &Result<ApplyOutcome>) {
    let label = match result {
        Ok(outcome) => outcome.as_str(),
        Err(_) => "failed",
    };
    match direction {
        Direction::Inbound => metrics::record_inbound_change(table, label),
        Direction::Outbound => metrics::record_outbound_change(table, label),
    }
}
