// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process document store.
//!
//! Behaves like a single CouchDB database as far as replication can tell:
//! revisions of the form `"<generation>-<hex>"`, conflicts on stale
//! revisions, tombstones for deletes, and a change feed that lists each
//! document once at its latest sequence.
//!
//! The `external_*` helpers write the way another client of the store would,
//! without going through replication.

use super::{BoxFuture, Change, Document, DocumentStore, Payload, Sequence};
use crate::error::{ReplicationError, Result};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct StoredDoc {
    doc: Document,
    rev: String,
    deleted: bool,
    seq: u64,
}

impl StoredDoc {
    fn generation(&self) -> u64 {
        super::rev_generation(&self.rev).unwrap_or(0)
    }

    /// Body as the change feed reports it.
    fn body(&self) -> Value {
        if self.deleted {
            return serde_json::json!({
                "_id": self.doc.id,
                "_rev": self.rev,
                "_deleted": true,
            });
        }
        let mut doc = self.doc.clone();
        doc.rev = Some(self.rev.clone());
        serde_json::to_value(doc).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Default)]
struct Inner {
    docs: HashMap<String, StoredDoc>,
    last_seq: u64,
}

impl Inner {
    fn next_seq(&mut self) -> u64 {
        self.last_seq += 1;
        self.last_seq
    }

    /// Store a new revision of `doc`, on top of whatever is there.
    fn write(&mut self, mut doc: Document, deleted: bool) -> String {
        let generation = self
            .docs
            .get(&doc.id)
            .map(StoredDoc::generation)
            .unwrap_or(0);
        let rev = new_rev(generation + 1);
        let seq = self.next_seq();
        doc.rev = None;
        self.docs.insert(
            doc.id.clone(),
            StoredDoc {
                doc,
                rev: rev.clone(),
                deleted,
                seq,
            },
        );
        rev
    }
}

fn new_rev(generation: u64) -> String {
    format!("{}-{}", generation, Uuid::new_v4().simple())
}

/// Document store held in memory.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    inner: RwLock<Inner>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or overwrite a document as an outside client would.
    ///
    /// Drops any origin marker. Returns the sequence of the resulting change.
    pub async fn external_put(&self, id: &str, payload: Payload) -> Sequence {
        let mut inner = self.inner.write().await;
        let mut doc = match inner.docs.get(id) {
            Some(stored) if !stored.deleted => stored.doc.clone(),
            _ => Document::new(id, Payload::new()),
        };
        doc.payload = payload;
        doc.origin = None;
        inner.write(doc, false);
        Sequence::from_number(inner.last_seq)
    }

    /// Delete a document as an outside client would.
    ///
    /// Returns `None` if there was nothing to delete.
    pub async fn external_delete(&self, id: &str) -> Option<Sequence> {
        let mut inner = self.inner.write().await;
        let doc = match inner.docs.get(id) {
            Some(stored) if !stored.deleted => stored.doc.clone(),
            _ => return None,
        };
        inner.write(doc, true);
        Some(Sequence::from_number(inner.last_seq))
    }

    /// Payload of a live document.
    pub async fn payload(&self, id: &str) -> Option<Payload> {
        let inner = self.inner.read().await;
        inner
            .docs
            .get(id)
            .filter(|stored| !stored.deleted)
            .map(|stored| stored.doc.payload.clone())
    }

    /// Origin marker of a live document.
    pub async fn origin(&self, id: &str) -> Option<String> {
        let inner = self.inner.read().await;
        inner
            .docs
            .get(id)
            .filter(|stored| !stored.deleted)
            .and_then(|stored| stored.doc.origin.clone())
    }

    /// Number of live (non-deleted) documents.
    pub async fn len(&self) -> usize {
        let inner = self.inner.read().await;
        inner.docs.values().filter(|stored| !stored.deleted).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Sequence of the most recent change.
    pub async fn last_seq(&self) -> Sequence {
        Sequence::from_number(self.inner.read().await.last_seq)
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn get(&self, id: &str) -> BoxFuture<'_, Option<Document>> {
        let id = id.to_string();
        Box::pin(async move {
            let inner = self.inner.read().await;
            Ok(inner.docs.get(&id).filter(|stored| !stored.deleted).map(|stored| {
                let mut doc = stored.doc.clone();
                doc.rev = Some(stored.rev.clone());
                doc
            }))
        })
    }

    fn put(&self, doc: Document) -> BoxFuture<'_, String> {
        Box::pin(async move {
            let mut inner = self.inner.write().await;
            match (inner.docs.get(&doc.id), doc.rev.as_deref()) {
                // Creating: fine if absent or a tombstone
                (None, None) => {}
                (Some(stored), None) if stored.deleted => {}
                // Updating: must name the current revision
                (Some(stored), Some(rev)) if !stored.deleted && stored.rev == rev => {}
                _ => return Err(ReplicationError::Conflict { id: doc.id }),
            }
            Ok(inner.write(doc, false))
        })
    }

    fn delete(&self, id: &str, rev: &str) -> BoxFuture<'_, bool> {
        let id = id.to_string();
        let rev = rev.to_string();
        Box::pin(async move {
            let mut inner = self.inner.write().await;
            let doc = match inner.docs.get(&id) {
                Some(stored) if !stored.deleted => {
                    if stored.rev != rev {
                        return Err(ReplicationError::Conflict { id });
                    }
                    stored.doc.clone()
                }
                _ => return Ok(false),
            };
            inner.write(doc, true);
            Ok(true)
        })
    }

    fn changes(&self, since: Option<&Sequence>) -> BoxFuture<'_, Vec<Change>> {
        let since = since.map(Sequence::number).unwrap_or(0);
        Box::pin(async move {
            let inner = self.inner.read().await;
            let mut changes: Vec<Change> = inner
                .docs
                .iter()
                .filter(|(_, stored)| stored.seq > since)
                .map(|(id, stored)| Change {
                    seq: Sequence::from_number(stored.seq),
                    id: id.clone(),
                    deleted: stored.deleted,
                    doc: Some(stored.body()),
                })
                .collect();
            changes.sort_by(|a, b| a.seq.cmp(&b.seq));
            Ok(changes)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_create_get_update() {
        let store = MemoryDocumentStore::new();
        assert!(store.get("orders/1").await.unwrap().is_none());

        let rev1 = store
            .put(Document::new("orders/1", payload(json!({"id": 1}))))
            .await
            .unwrap();
        assert!(rev1.starts_with("1-"));

        let mut doc = store.get("orders/1").await.unwrap().unwrap();
        assert_eq!(doc.rev.as_deref(), Some(rev1.as_str()));
        doc.payload.insert("amount".into(), json!(10));
        let rev2 = store.put(doc).await.unwrap();
        assert!(rev2.starts_with("2-"));

        assert_eq!(
            store.payload("orders/1").await,
            Some(payload(json!({"id": 1, "amount": 10})))
        );
    }

    #[tokio::test]
    async fn test_stale_revision_conflicts() {
        let store = MemoryDocumentStore::new();
        let rev1 = store
            .put(Document::new("orders/1", Payload::new()))
            .await
            .unwrap();
        store.external_put("orders/1", payload(json!({"a": 1}))).await;

        let mut doc = Document::new("orders/1", Payload::new());
        doc.rev = Some(rev1.clone());
        let err = store.put(doc).await.unwrap_err();
        assert!(matches!(err, ReplicationError::Conflict { .. }));

        // Blind create over a live document conflicts too
        let err = store
            .put(Document::new("orders/1", Payload::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Conflict { .. }));

        let err = store.delete("orders/1", &rev1).await.unwrap_err();
        assert!(matches!(err, ReplicationError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = MemoryDocumentStore::new();
        assert!(!store.delete("orders/1", "1-x").await.unwrap());

        let rev = store
            .put(Document::new("orders/1", Payload::new()))
            .await
            .unwrap();
        assert!(store.delete("orders/1", &rev).await.unwrap());
        assert!(store.get("orders/1").await.unwrap().is_none());
        assert!(!store.delete("orders/1", &rev).await.unwrap());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_external_put_drops_origin() {
        let store = MemoryDocumentStore::new();
        let mut doc = Document::new("orders/1", payload(json!({"id": 1})));
        doc.origin = Some("db-1".into());
        store.put(doc).await.unwrap();
        assert_eq!(store.origin("orders/1").await.as_deref(), Some("db-1"));

        let changes = store.changes(None).await.unwrap();
        assert_eq!(changes[0].origin(), Some("db-1"));

        store.external_put("orders/1", payload(json!({"id": 1, "amount": 2}))).await;
        assert_eq!(store.origin("orders/1").await, None);
    }

    #[tokio::test]
    async fn test_recreate_after_delete() {
        let store = MemoryDocumentStore::new();
        store.external_put("orders/1", Payload::new()).await;
        store.external_delete("orders/1").await.unwrap();

        let rev = store
            .put(Document::new("orders/1", payload(json!({"id": 1}))))
            .await
            .unwrap();
        assert!(rev.starts_with("3-"));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_changes_feed_lists_latest_per_doc() {
        let store = MemoryDocumentStore::new();
        store.external_put("orders/1", payload(json!({"id": 1}))).await; // seq 1
        store.external_put("orders/2", payload(json!({"id": 2}))).await; // seq 2
        store.external_put("orders/1", payload(json!({"id": 1, "a": 5}))).await; // seq 3
        store.external_delete("orders/2").await; // seq 4

        let all = store.changes(None).await.unwrap();
        let summary: Vec<(u64, &str, bool)> = all
            .iter()
            .map(|c| (c.seq.number(), c.id.as_str(), c.deleted))
            .collect();
        assert_eq!(summary, vec![(3, "orders/1", false), (4, "orders/2", true)]);
        assert_eq!(all[0].payload(), payload(json!({"id": 1, "a": 5})));
        assert!(all[1].payload().is_empty());

        let since = store.changes(Some(&Sequence::from_number(3))).await.unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].id, "orders/2");

        let none = store.changes(Some(&store.last_seq().await)).await.unwrap();
        assert!(none.is_empty());
    }
}
