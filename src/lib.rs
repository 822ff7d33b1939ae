//! # Replicant
//!
//! Bidirectional replication between a SQLite database and a CouchDB database.
//!
//! ## Architecture
//!
//! Replicant sits between an application's SQLite tables and a CouchDB
//! database, moving row changes one way and document changes the other:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                               replicant                                   │
//! │                                                                           │
//! │  SQLite                                                    CouchDB        │
//! │  ┌──────────────┐  triggers  ┌────────┐  DocumentWriter  ┌────────────┐   │
//! │  │ app tables   │───────────►│ outbox │─────────────────►│ documents  │   │
//! │  │              │            └────────┘                  │            │   │
//! │  │              │◄───────────────────────────────────────│  _changes  │   │
//! │  └──────────────┘  RelationalWriter (origin-stamped)     └────────────┘   │
//! │         │                                                       │         │
//! │         ▼                                                       │         │
//! │  ┌──────────────┐          checkpoint (last applied seq)        │         │
//! │  │ _replicant_  │◄──────────────────────────────────────────────┘         │
//! │  │ meta         │                                                         │
//! │  └──────────────┘                                                         │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Loop Prevention
//!
//! 1. **Relational side**: rows written by replication carry the origin marker
//!    in `_replicant_origin`; the capture triggers ignore them.
//! 2. **Document side**: documents written by replication carry the same
//!    marker in `replicant_origin`; the change reader skips them, so our own
//!    outbound writes coming back through the feed never touch a row.
//! 3. **Tombstones** carry no marker. An inbound delete for a row that still
//!    has a queued local change is deferred; the outbound half wins.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use replicant::{ReplicationConfig, ReplicationEngine, Schema};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut config = ReplicationConfig::default();
//!     config.relational.sqlite_path = "app.db".to_string();
//!     config.schema = Schema::new().with_table("orders", &[("id", "INTEGER"), ("amount", "INTEGER")]);
//!
//!     let mut engine = ReplicationEngine::new(config).expect("valid config");
//!     engine.start().await.expect("Failed to start");
//!
//!     // Engine runs cycles until shutdown
//!     engine.shutdown().await;
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod document;
pub mod error;
pub mod flow;
pub mod metrics;
pub mod origin;
pub mod relational;
pub mod resilience;
pub mod schema;

// Re-exports for convenience
pub use config::{CycleConfig, DocumentStoreConfig, RelationalConfig, ReplicationConfig};
pub use coordinator::{
    CycleOutcome, CyclePhase, CycleReport, EngineState, HealthCheck, ReplicationEngine, Replicator,
};
pub use document::{
    ChangeReader, CouchDbStore, DocId, Document, DocumentStore, DocumentWriter, MemoryDocumentStore,
    Payload, Sequence,
};
pub use error::{ReplicationError, Result};
pub use flow::{ApplyOutcome, Flow};
pub use origin::OriginMarker;
pub use relational::{
    Action, ChangeCapture, CheckpointStore, Outbox, OutboxEntry, RelationalStore, RelationalWriter,
};
pub use resilience::RetryConfig;
pub use schema::{ColumnDef, Schema};
