// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication cycle tests against the in-memory document store.
//!
//! # Running Tests
//! ```bash
//! cargo test --test replication_cycle
//! ```
//!
//! # Test Organization
//! - `outbound_*` - local mutations reaching the document store
//! - `inbound_*` - change feed reaching SQLite
//! - `loop_*` - origin marker and dedup keeping the two directions apart
//! - `cycle_*` - ordering and failure handling across both halves

mod common;

use common::{exec, memory_store, orders_schema, payload, FlakyDocumentStore, ORDERS_DDL};
use replicant::document::{ChangeReader, DocumentWriter, MemoryDocumentStore};
use replicant::relational::{Action, ChangeCapture, Outbox};
use replicant::{
    ApplyOutcome, CycleOutcome, CyclePhase, Flow, RelationalStore, Replicator, Sequence,
};
use serde_json::json;
use std::sync::Arc;

async fn replicator<D: replicant::DocumentStore>(
    store: &RelationalStore,
    docs: Arc<D>,
) -> Replicator<D> {
    Replicator::open("test", store.clone(), docs, Arc::new(orders_schema()))
        .await
        .unwrap()
}

// =============================================================================
// Outbound
// =============================================================================

/// Insert a row locally, drain, and find it as `orders/1`.
#[tokio::test]
async fn outbound_insert_creates_document() {
    let store = memory_store(ORDERS_DDL).await;
    let docs = Arc::new(MemoryDocumentStore::new());
    let replicator = replicator(&store, docs.clone()).await;

    exec(&store, "INSERT INTO orders (id, amount) VALUES (1, 10)").await;

    let entries = replicator.outbox().entries().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].key, json!(1));
    assert_eq!(entries[0].table, "orders");
    assert_eq!(entries[0].action, Action::Insert);

    let drained = replicator.outbound().await.unwrap();
    assert!(drained.success);
    assert_eq!(drained.applied, 1);

    assert_eq!(docs.payload("orders/1").await, Some(payload(json!({"id": 1, "amount": 10}))));
    assert!(replicator.outbox().is_empty().await.unwrap());
}

/// Insert, update and delete before a drain: one entry, one delete.
#[tokio::test]
async fn outbound_row_history_collapses_to_one_delete() {
    let store = memory_store(ORDERS_DDL).await;
    let docs = Arc::new(FlakyDocumentStore::new());
    let replicator = replicator(&store, docs.clone()).await;

    exec(&store, "INSERT INTO orders (id, amount) VALUES (1, 10)").await;
    exec(&store, "UPDATE orders SET amount = 11 WHERE id = 1").await;
    exec(&store, "DELETE FROM orders WHERE id = 1").await;

    let entries = replicator.outbox().entries().await.unwrap();
    assert_eq!(entries.len(), 1);
    let pending = replicator.outbox().resolve(entries[0].clone()).await.unwrap();
    assert!(pending.is_delete);

    let mut calls = Vec::new();
    let report = replicator
        .outbox()
        .drain(|pending| {
            calls.push((pending.entry.key.clone(), pending.is_delete));
            async { Flow::Continue }
        })
        .await
        .unwrap();
    assert!(report.success);
    assert_eq!(calls, vec![(json!(1), true)]);
}

/// Deleting a row that was never replicated is not an error.
#[tokio::test]
async fn outbound_delete_of_unknown_document_succeeds() {
    let store = memory_store(ORDERS_DDL).await;
    let docs = Arc::new(FlakyDocumentStore::new());
    let replicator = replicator(&store, docs.clone()).await;

    let outbox = Outbox::new(store.clone());
    outbox.push("orders", &json!(42), Action::Delete).await.unwrap();

    let report = replicator.run_cycle().await.unwrap();
    assert_eq!(report.outcome, CycleOutcome::Completed);
    assert_eq!(report.outbound_applied, 1);
    assert_eq!(docs.deletes(), 0);
    assert!(outbox.is_empty().await.unwrap());
}

/// Local update merges into the document and keeps foreign fields.
#[tokio::test]
async fn outbound_update_merges_into_existing_document() {
    let store = memory_store(ORDERS_DDL).await;
    let docs = Arc::new(MemoryDocumentStore::new());
    let replicator = replicator(&store, docs.clone()).await;

    docs.external_put("orders/3", payload(json!({"amount": 1, "note": "keep"}))).await;
    replicator.run_cycle().await.unwrap();
    assert_eq!(
        store.fetch_row("orders", &json!(3)).await.unwrap(),
        Some(payload(json!({"id": 3, "amount": 1})))
    );

    // Clear the stamp so the application's update is captured
    exec(&store, "UPDATE orders SET amount = 5, _replicant_origin = NULL WHERE id = 3").await;
    let report = replicator.run_cycle().await.unwrap();
    assert_eq!(report.outcome, CycleOutcome::Completed);
    assert_eq!(report.outbound_applied, 1);
    assert_eq!(
        docs.payload("orders/3").await,
        Some(payload(json!({"id": 3, "amount": 5, "note": "keep"})))
    );
}

// =============================================================================
// Inbound
// =============================================================================

/// Checkpoint 5, `orders/2` updated externally at 7: row updated, stamped,
/// checkpoint 7, nothing queued.
#[tokio::test]
async fn inbound_external_update_is_applied_and_stamped() {
    let store = memory_store(ORDERS_DDL).await;
    exec(&store, "INSERT INTO orders (id, amount) VALUES (2, 1)").await;

    let docs = Arc::new(MemoryDocumentStore::new());
    for n in 10..15 {
        docs.external_put(&format!("orders/{}", n), payload(json!({"amount": n}))).await;
    }
    let replicator = replicator(&store, docs.clone()).await;
    replicator.checkpoints().set(&Sequence::from_number(5)).await.unwrap();

    docs.external_put("orders/2", payload(json!({"amount": 50}))).await;
    let seq = docs.external_put("orders/2", payload(json!({"amount": 99}))).await;
    assert_eq!(seq.number(), 7);

    let report = replicator.run_cycle().await.unwrap();
    assert_eq!(report.outcome, CycleOutcome::Completed);
    assert_eq!(report.inbound_applied, 1);
    assert!(report.checkpoint_advanced);
    assert_eq!(report.checkpoint, Some(Sequence::from_number(7)));

    assert_eq!(
        store.fetch_row("orders", &json!(2)).await.unwrap(),
        Some(payload(json!({"id": 2, "amount": 99})))
    );
    assert_eq!(
        store.tracking_value("orders", &json!(2)).await.unwrap(),
        Some(Some(replicator.origin().as_str().to_string()))
    );
    assert!(replicator.outbox().is_empty().await.unwrap());

    // Rows behind the checkpoint were never pulled
    assert!(store.fetch_row("orders", &json!(10)).await.unwrap().is_none());
}

/// Documents outside the tracked tables are skipped but still advance the checkpoint.
#[tokio::test]
async fn inbound_foreign_documents_are_skipped() {
    let store = memory_store(ORDERS_DDL).await;
    let docs = Arc::new(MemoryDocumentStore::new());
    let replicator = replicator(&store, docs.clone()).await;

    docs.external_put("_design/views", payload(json!({}))).await;
    docs.external_put("customers/1", payload(json!({"name": "x"}))).await;
    docs.external_put("not-composite", payload(json!({}))).await;

    let report = replicator.run_cycle().await.unwrap();
    assert_eq!(report.outcome, CycleOutcome::Completed);
    assert_eq!(report.inbound_applied, 0);
    assert_eq!(report.inbound_skipped, 3);
    assert_eq!(report.checkpoint, Some(Sequence::from_number(3)));
}

/// External delete removes the row; deleting again is harmless.
#[tokio::test]
async fn inbound_delete_is_idempotent() {
    let store = memory_store(ORDERS_DDL).await;
    let docs = Arc::new(MemoryDocumentStore::new());
    let replicator = replicator(&store, docs.clone()).await;

    docs.external_put("orders/4", payload(json!({"amount": 4}))).await;
    replicator.run_cycle().await.unwrap();
    assert!(store.fetch_row("orders", &json!(4)).await.unwrap().is_some());

    docs.external_delete("orders/4").await.unwrap();
    let report = replicator.run_cycle().await.unwrap();
    assert_eq!(report.outcome, CycleOutcome::Completed);
    assert!(store.fetch_row("orders", &json!(4)).await.unwrap().is_none());

    // Same tombstone applied again
    let writer = replicant::RelationalWriter::new(
        store.clone(),
        Arc::new(orders_schema()),
        replicator.origin().clone(),
    );
    let outcome = writer
        .apply("orders", "4", &Default::default(), true)
        .await
        .unwrap();
    assert_eq!(outcome, ApplyOutcome::AlreadyAbsent);
}

/// A rejected 3rd change of 5 leaves the checkpoint alone and the same five
/// come back, in order, on the next read.
#[tokio::test]
async fn inbound_failure_midway_keeps_checkpoint_and_redelivers() {
    let store = memory_store(
        "CREATE TABLE orders (id INTEGER PRIMARY KEY, amount INTEGER CHECK (amount >= 0))",
    )
    .await;
    let docs = Arc::new(MemoryDocumentStore::new());
    let replicator = replicator(&store, docs.clone()).await;

    docs.external_put("orders/0", payload(json!({"amount": 0}))).await;
    replicator.run_cycle().await.unwrap();
    let before = replicator.checkpoints().get().await;
    assert_eq!(before, Some(Sequence::from_number(1)));

    for (n, amount) in [(1, 1), (2, 2), (3, -3), (4, 4), (5, 5)] {
        docs.external_put(&format!("orders/{}", n), payload(json!({"amount": amount}))).await;
    }

    let report = replicator.run_cycle().await.unwrap();
    assert_eq!(report.outcome, CycleOutcome::InboundFailed);
    assert_eq!(report.failed_phase, Some(CyclePhase::Inbound));
    assert_eq!(report.inbound_applied, 2);
    assert!(!report.checkpoint_advanced);
    assert_eq!(replicator.checkpoints().get().await, before);

    // Applied before the failure, not after
    assert!(store.fetch_row("orders", &json!(2)).await.unwrap().is_some());
    assert!(store.fetch_row("orders", &json!(4)).await.unwrap().is_none());

    let reader = ChangeReader::new(docs.clone(), Arc::new(orders_schema()));
    let mut keys = Vec::new();
    let reread = reader
        .read(before.as_ref(), |change| {
            keys.push(change.key.clone());
            async { Flow::Continue }
        })
        .await
        .unwrap();
    assert!(reread.success);
    assert_eq!(keys, vec!["1", "2", "3", "4", "5"]);

    // Fix the bad document; the next cycle catches up completely
    docs.external_put("orders/3", payload(json!({"amount": 3}))).await;
    let report = replicator.run_cycle().await.unwrap();
    assert_eq!(report.outcome, CycleOutcome::Completed);
    assert_eq!(replicator.checkpoints().get().await, Some(docs.last_seq().await));
    for n in 1..=5 {
        assert!(store.fetch_row("orders", &json!(n)).await.unwrap().is_some());
    }
}

// =============================================================================
// Loop prevention
// =============================================================================

/// Rows written by the Relational Writer never reach the outbox.
#[tokio::test]
async fn loop_replicated_writes_are_not_captured() {
    let store = memory_store(ORDERS_DDL).await;
    let docs = Arc::new(MemoryDocumentStore::new());
    let replicator = replicator(&store, docs.clone()).await;

    for n in 1..=10 {
        docs.external_put(&format!("orders/{}", n), payload(json!({"amount": n}))).await;
    }
    let inbound = replicator.inbound().await.unwrap();
    assert!(inbound.read.success);
    assert_eq!(inbound.read.applied, 10);

    assert!(replicator.outbox().is_empty().await.unwrap());
}

/// A local insert goes out once and comes back as a no-op.
#[tokio::test]
async fn loop_round_trip_settles() {
    let store = memory_store(ORDERS_DDL).await;
    let docs = Arc::new(FlakyDocumentStore::new());
    let replicator = replicator(&store, docs.clone()).await;

    exec(&store, "INSERT INTO orders (id, amount) VALUES (1, 10)").await;
    replicator.run_cycle().await.unwrap();
    assert_eq!(docs.puts(), 1);

    for _ in 0..3 {
        let report = replicator.run_cycle().await.unwrap();
        assert_eq!(report.outcome, CycleOutcome::Completed);
        assert_eq!(report.outbound_applied, 0);
    }
    assert_eq!(docs.puts(), 1);
    assert_eq!(store.tracking_value("orders", &json!(1)).await.unwrap(), Some(None));
}

/// A local update queued behind our own earlier write survives that write
/// coming back through the feed, and the row keeps being captured.
#[tokio::test]
async fn loop_local_update_survives_own_echo() {
    let store = memory_store(ORDERS_DDL).await;
    let docs = Arc::new(MemoryDocumentStore::new());
    let replicator = replicator(&store, docs.clone()).await;

    exec(&store, "INSERT INTO orders (id, amount) VALUES (1, 10)").await;
    replicator.run_cycle().await.unwrap();
    assert_eq!(docs.payload("orders/1").await, Some(payload(json!({"id": 1, "amount": 10}))));

    exec(&store, "UPDATE orders SET amount = 11 WHERE id = 1").await;
    let report = replicator.run_cycle().await.unwrap();
    assert_eq!(report.outcome, CycleOutcome::Completed);
    assert_eq!(report.inbound_applied, 0);
    assert_eq!(report.outbound_applied, 1);
    replicator.run_cycle().await.unwrap();

    let expected = payload(json!({"id": 1, "amount": 11}));
    assert_eq!(store.fetch_row("orders", &json!(1)).await.unwrap(), Some(expected.clone()));
    assert_eq!(docs.payload("orders/1").await, Some(expected));
    assert_eq!(store.tracking_value("orders", &json!(1)).await.unwrap(), Some(None));

    exec(&store, "UPDATE orders SET amount = 12 WHERE id = 1").await;
    assert_eq!(replicator.outbox().len().await.unwrap(), 1);
    replicator.run_cycle().await.unwrap();
    assert_eq!(docs.payload("orders/1").await, Some(payload(json!({"id": 1, "amount": 12}))));
}

/// Our own delete coming back as a tombstone does not remove a row the
/// application re-created in the meantime.
#[tokio::test]
async fn loop_reinsert_survives_own_tombstone() {
    let store = memory_store(ORDERS_DDL).await;
    let docs = Arc::new(MemoryDocumentStore::new());
    let replicator = replicator(&store, docs.clone()).await;

    exec(&store, "INSERT INTO orders (id, amount) VALUES (1, 5)").await;
    replicator.run_cycle().await.unwrap();
    exec(&store, "DELETE FROM orders WHERE id = 1").await;
    replicator.run_cycle().await.unwrap();
    assert!(docs.payload("orders/1").await.is_none());

    exec(&store, "INSERT INTO orders (id, amount) VALUES (1, 7)").await;
    let report = replicator.run_cycle().await.unwrap();
    assert_eq!(report.outcome, CycleOutcome::Completed);
    assert_eq!(report.outbound_applied, 1);

    let expected = payload(json!({"id": 1, "amount": 7}));
    assert_eq!(store.fetch_row("orders", &json!(1)).await.unwrap(), Some(expected.clone()));
    assert_eq!(docs.payload("orders/1").await, Some(expected));
    assert!(replicator.outbox().is_empty().await.unwrap());

    let report = replicator.run_cycle().await.unwrap();
    assert_eq!(report.inbound_applied, 0);
    assert_eq!(report.outbound_applied, 0);
    assert!(store.fetch_row("orders", &json!(1)).await.unwrap().is_some());
}

/// An external change that comes in is not pushed back out.
#[tokio::test]
async fn loop_external_change_is_not_echoed() {
    let store = memory_store(ORDERS_DDL).await;
    let docs = Arc::new(FlakyDocumentStore::new());
    let replicator = replicator(&store, docs.clone()).await;

    docs.inner.external_put("orders/8", payload(json!({"amount": 80}))).await;
    for _ in 0..3 {
        replicator.run_cycle().await.unwrap();
    }
    assert_eq!(docs.puts(), 0);
    assert_eq!(docs.inner.last_seq().await, Sequence::from_number(1));
}

// =============================================================================
// Cycle
// =============================================================================

/// Both directions in one cycle, inbound first.
#[tokio::test]
async fn cycle_moves_both_directions() {
    let store = memory_store(ORDERS_DDL).await;
    let docs = Arc::new(MemoryDocumentStore::new());
    let replicator = replicator(&store, docs.clone()).await;

    docs.external_put("orders/1", payload(json!({"amount": 1}))).await;
    exec(&store, "INSERT INTO orders (id, amount) VALUES (2, 2)").await;

    let report = replicator.run_cycle().await.unwrap();
    assert_eq!(report.outcome, CycleOutcome::Completed);
    assert_eq!(report.inbound_applied, 1);
    assert_eq!(report.outbound_applied, 1);
    assert!(report.did_work());

    assert!(store.fetch_row("orders", &json!(1)).await.unwrap().is_some());
    assert!(docs.payload("orders/2").await.is_some());
}

/// An outbox entry the document store rejects stays at the head.
#[tokio::test]
async fn cycle_outbound_failure_keeps_entry_at_head() {
    let store = memory_store(ORDERS_DDL).await;
    let docs = Arc::new(FlakyDocumentStore::new());
    let replicator = replicator(&store, docs.clone()).await;

    exec(&store, "INSERT INTO orders (id, amount) VALUES (1, 10)").await;
    exec(&store, "INSERT INTO orders (id, amount) VALUES (2, 20)").await;
    let head = replicator.outbox().peek().await.unwrap();

    docs.fail_puts_after(0);
    let report = replicator.run_cycle().await.unwrap();
    assert_eq!(report.outcome, CycleOutcome::OutboundFailed);
    assert_eq!(report.failed_phase, Some(CyclePhase::Outbound));
    assert_eq!(replicator.outbox().len().await.unwrap(), 2);
    assert_eq!(replicator.outbox().peek().await.unwrap(), head);

    docs.heal_puts();
    let report = replicator.run_cycle().await.unwrap();
    assert_eq!(report.outcome, CycleOutcome::Completed);
    assert_eq!(report.outbound_applied, 2);
}

/// A failed inbound half skips the outbound half.
#[tokio::test]
async fn cycle_inbound_failure_skips_outbound() {
    let store = memory_store(
        "CREATE TABLE orders (id INTEGER PRIMARY KEY, amount INTEGER CHECK (amount >= 0))",
    )
    .await;
    let docs = Arc::new(MemoryDocumentStore::new());
    let replicator = replicator(&store, docs.clone()).await;

    docs.external_put("orders/1", payload(json!({"amount": -1}))).await;
    exec(&store, "INSERT INTO orders (id, amount) VALUES (2, 2)").await;

    let report = replicator.run_cycle().await.unwrap();
    assert_eq!(report.outcome, CycleOutcome::InboundFailed);
    assert_eq!(report.outbound_applied, 0);
    assert_eq!(replicator.outbox().len().await.unwrap(), 1);
    assert!(docs.payload("orders/2").await.is_none());
}

/// Capture installation is idempotent across replicator restarts.
#[tokio::test]
async fn cycle_reopen_keeps_origin_and_capture() {
    let store = memory_store(ORDERS_DDL).await;
    let docs = Arc::new(MemoryDocumentStore::new());
    let first = replicator(&store, docs.clone()).await;
    let origin = first.origin().clone();
    drop(first);

    let second = replicator(&store, docs.clone()).await;
    assert_eq!(second.origin(), &origin);
    assert!(ChangeCapture::new(store.clone()).is_installed("orders").await.unwrap());

    exec(&store, "INSERT INTO orders (id, amount) VALUES (1, 1)").await;
    assert_eq!(second.outbox().len().await.unwrap(), 1);
}

/// The document writer on its own: create, merge, no-op, delete.
#[tokio::test]
async fn cycle_document_writer_outcomes() {
    let docs = Arc::new(MemoryDocumentStore::new());
    let writer = DocumentWriter::new(docs.clone());
    let row = payload(json!({"id": 1, "amount": 1}));

    assert_eq!(writer.apply("orders", "1", Some(&row), false).await.unwrap(), ApplyOutcome::Created);
    assert_eq!(writer.apply("orders", "1", Some(&row), false).await.unwrap(), ApplyOutcome::Unchanged);

    let changed = payload(json!({"id": 1, "amount": 2}));
    assert_eq!(writer.apply("orders", "1", Some(&changed), false).await.unwrap(), ApplyOutcome::Updated);
    assert_eq!(writer.apply("orders", "1", None, true).await.unwrap(), ApplyOutcome::Deleted);
    assert_eq!(writer.apply("orders", "1", None, true).await.unwrap(), ApplyOutcome::AlreadyAbsent);
}
