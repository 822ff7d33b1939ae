// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Checkpoint persistence and origin identity.
//!
//! One row in `_replicant_meta` inside the replicated database:
//!
//! | Column | Meaning |
//! |--------|---------|
//! | `origin` | UUID generated on first open; the origin marker |
//! | `last_seq` | integer part of the last fully applied feed sequence |
//! | `last_seq_token` | the raw token, sent back as `since` |
//! | `updated_at` | epoch millis of the last write |
//!
//! ## Checkpoint Semantics
//!
//! The checkpoint is the **last fully applied** change feed position. Reads
//! resume strictly after it. Writes are synchronous (no debouncing): the
//! outbound half of a cycle must not start before the inbound position is on
//! disk.
//!
//! ```text
//! read batch → apply all → set(seq) → drain outbox
//!                          (crash before set = re-read batch, idempotent)
//! ```

use super::{execute_with_retry, RelationalStore};
use crate::document::Sequence;
use crate::error::Result;
use crate::origin::{OriginMarker, META_TABLE};
use sqlx::Row;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Last applied change feed position plus this database's origin marker.
pub struct CheckpointStore {
    store: RelationalStore,
    origin: OriginMarker,
    /// Mirrors the row; written only after the row is.
    cache: RwLock<Option<Sequence>>,
}

impl CheckpointStore {
    /// Create the meta row on first use and load it.
    pub async fn open(store: RelationalStore) -> Result<Self> {
        let pool = store.pool();

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{}" (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                origin TEXT NOT NULL,
                last_seq INTEGER,
                last_seq_token TEXT,
                updated_at INTEGER NOT NULL
            )
            "#,
            META_TABLE
        ))
        .execute(pool)
        .await?;

        let generated = OriginMarker::generate();
        let insert = format!(
            r#"INSERT OR IGNORE INTO "{}" (id, origin, updated_at) VALUES (1, ?, ?)"#,
            META_TABLE
        );
        let created = sqlx::query(&insert)
            .bind(generated.as_str())
            .bind(chrono::Utc::now().timestamp_millis())
            .execute(pool)
            .await?
            .rows_affected()
            > 0;

        let select = format!(
            r#"SELECT origin, last_seq, last_seq_token FROM "{}" WHERE id = 1"#,
            META_TABLE
        );
        let row = sqlx::query(&select).fetch_one(pool).await?;
        let origin = OriginMarker::new(row.try_get::<String, _>("origin")?);
        let last_seq: Option<i64> = row.try_get("last_seq")?;
        let token: Option<String> = row.try_get("last_seq_token")?;

        let checkpoint = last_seq.map(|n| {
            let number = n.max(0) as u64;
            match token {
                Some(token) => Sequence::new(number, token),
                None => Sequence::from_number(number),
            }
        });

        if created {
            info!(origin = %origin, "Generated origin marker");
        }
        match &checkpoint {
            Some(seq) => info!(origin = %origin, seq = %seq, "Restored checkpoint from previous run"),
            None => debug!(origin = %origin, "No checkpoint yet, first run"),
        }

        Ok(Self {
            store,
            origin,
            cache: RwLock::new(checkpoint),
        })
    }

    /// Marker stamped on rows written by replication.
    pub fn origin(&self) -> &OriginMarker {
        &self.origin
    }

    /// Last fully applied sequence. `None` on first run.
    pub async fn get(&self) -> Option<Sequence> {
        self.cache.read().await.clone()
    }

    /// Persist a new checkpoint.
    ///
    /// Refuses to move backwards: returns `false` (and writes nothing) if
    /// `seq` is behind the stored position.
    pub async fn set(&self, seq: &Sequence) -> Result<bool> {
        let mut cache = self.cache.write().await;
        if let Some(current) = cache.as_ref() {
            if seq.number() < current.number() {
                warn!(current = %current, requested = %seq, "Refusing to move checkpoint backwards");
                return Ok(false);
            }
            if seq == current {
                return Ok(true);
            }
        }

        let sql = format!(
            r#"UPDATE "{}" SET last_seq = ?, last_seq_token = ?, updated_at = ? WHERE id = 1"#,
            META_TABLE
        );
        let pool = self.store.pool();
        let number = i64::try_from(seq.number()).unwrap_or(i64::MAX);
        let token = seq.token().to_string();
        let now = chrono::Utc::now().timestamp_millis();

        execute_with_retry("checkpoint_set", || async {
            sqlx::query(&sql)
                .bind(number)
                .bind(&token)
                .bind(now)
                .execute(pool)
                .await
        })
        .await?;

        *cache = Some(seq.clone());
        crate::metrics::set_checkpoint(seq.number());
        debug!(seq = %seq, "Checkpoint persisted");
        Ok(true)
    }
}
