// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document store wrapper with switchable failures.
//!
//! Delegates to [`MemoryDocumentStore`] and counts calls. Failures are
//! reported as transport errors, the way an unreachable server would be.

use replicant::document::{BoxFuture, Change, Document, DocumentStore, MemoryDocumentStore, Sequence};
use replicant::ReplicationError;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Default)]
pub struct FlakyDocumentStore {
    pub inner: MemoryDocumentStore,
    /// Successful puts allowed before every further put fails.
    put_budget: AtomicUsize,
    put_budget_enabled: AtomicBool,
    feed_down: AtomicBool,
    puts: AtomicUsize,
    deletes: AtomicUsize,
    feed_reads: AtomicUsize,
}

impl FlakyDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let `n` more puts through, then fail the rest.
    pub fn fail_puts_after(&self, n: usize) {
        self.put_budget.store(n, Ordering::SeqCst);
        self.put_budget_enabled.store(true, Ordering::SeqCst);
    }

    pub fn heal_puts(&self) {
        self.put_budget_enabled.store(false, Ordering::SeqCst);
    }

    pub fn set_feed_down(&self, down: bool) {
        self.feed_down.store(down, Ordering::SeqCst);
    }

    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn feed_reads(&self) -> usize {
        self.feed_reads.load(Ordering::SeqCst)
    }

    fn take_put_budget(&self) -> bool {
        if !self.put_budget_enabled.load(Ordering::SeqCst) {
            return true;
        }
        self.put_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn injected<'a, T: Send + 'a>(operation: &'static str) -> BoxFuture<'a, T> {
    Box::pin(async move { Err(ReplicationError::transport_msg(operation, "connection refused (injected)")) })
}

impl DocumentStore for FlakyDocumentStore {
    fn get(&self, id: &str) -> BoxFuture<'_, Option<Document>> {
        self.inner.get(id)
    }

    fn put(&self, doc: Document) -> BoxFuture<'_, String> {
        if !self.take_put_budget() {
            return injected("put");
        }
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put(doc)
    }

    fn delete(&self, id: &str, rev: &str) -> BoxFuture<'_, bool> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete(id, rev)
    }

    fn changes(&self, since: Option<&Sequence>) -> BoxFuture<'_, Vec<Change>> {
        self.feed_reads.fetch_add(1, Ordering::SeqCst);
        if self.feed_down.load(Ordering::SeqCst) {
            return injected("changes");
        }
        self.inner.changes(since)
    }
}
