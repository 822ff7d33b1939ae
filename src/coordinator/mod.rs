// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication engine coordinator.
//!
//! Owns one relational / document pair and drives cycles over it:
//! - Opens the SQLite store via [`crate::relational::RelationalStore`]
//! - Installs change capture and loads the checkpoint
//! - Waits for the document store to answer
//! - Runs cycles on a fixed interval (or one at a time via [`ReplicationEngine::run_once`])
//!
//! # Architecture
//!
//! ```text
//! start() ──► prepare ──► spawn cycle loop ──► Running
//!                              │
//!                   interval ──┤──► Replicator::run_cycle ──► cycle watch channel
//!                              │
//! shutdown() ─── signal ───────┘ (cycle in flight finishes first)
//! ```
//!
//! A failing cycle never stops the loop; the next tick starts over from the
//! persisted checkpoint and outbox.

mod cycle;
mod types;

pub use cycle::{InboundReport, Replicator};
pub use types::{CycleOutcome, CyclePhase, CycleReport, EngineState, HealthCheck};

use crate::config::ReplicationConfig;
use crate::document::{CouchDbStore, DocumentStore};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::relational::RelationalStore;
use crate::resilience::RetryConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// The replication engine for one relational / document pair.
///
/// # Document Store
///
/// Defaults to [`CouchDbStore`]. Any [`DocumentStore`] can be plugged in
/// with [`with_document_store`](Self::with_document_store), which is how the
/// tests run against [`MemoryDocumentStore`](crate::document::MemoryDocumentStore).
pub struct ReplicationEngine<D: DocumentStore = CouchDbStore> {
    config: ReplicationConfig,

    documents: Arc<D>,

    /// Opened on start, or supplied by the host.
    store: Option<RelationalStore>,

    /// Whether `store` was opened here and is ours to close.
    owns_store: bool,

    /// Built on start.
    replicator: Option<Arc<Replicator<D>>>,

    /// Engine state (broadcast to watchers)
    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    /// Last cycle report (broadcast to watchers)
    cycle_tx: Arc<watch::Sender<Option<CycleReport>>>,
    cycle_rx: watch::Receiver<Option<CycleReport>>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    cycles_run: Arc<AtomicU64>,

    loop_handle: Option<JoinHandle<()>>,
}

impl ReplicationEngine<CouchDbStore> {
    /// Create an engine talking to the CouchDB server in `config.document`.
    ///
    /// No I/O happens here. The engine starts in `Created` state; call
    /// [`start()`](Self::start) or [`run_once()`](Self::run_once).
    pub fn new(config: ReplicationConfig) -> Result<Self> {
        let documents = CouchDbStore::new(&config.document)?;
        Ok(Self::with_document_store(config, Arc::new(documents)))
    }
}

impl<D: DocumentStore> ReplicationEngine<D> {
    /// Create an engine over an arbitrary document store.
    pub fn with_document_store(config: ReplicationConfig, documents: Arc<D>) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (cycle_tx, cycle_rx) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            config,
            documents,
            store: None,
            owns_store: false,
            replicator: None,
            state_tx,
            state_rx,
            cycle_tx: Arc::new(cycle_tx),
            cycle_rx,
            shutdown_tx,
            shutdown_rx,
            cycles_run: Arc::new(AtomicU64::new(0)),
            loop_handle: None,
        }
    }

    /// Use a relational store the host already opened instead of opening
    /// `config.relational`. The host keeps ownership: shutdown leaves it open.
    pub fn with_relational_store(mut self, store: RelationalStore) -> Self {
        self.store = Some(store);
        self.owns_store = false;
        self
    }

    pub fn pair_id(&self) -> &str {
        &self.config.pair_id
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn document_store(&self) -> &Arc<D> {
        &self.documents
    }

    /// The relational store, once opened.
    pub fn relational_store(&self) -> Option<&RelationalStore> {
        self.store.as_ref()
    }

    /// The cycle runner, once the engine has started.
    pub fn replicator(&self) -> Option<&Arc<Replicator<D>>> {
        self.replicator.as_ref()
    }

    /// Get current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Get a receiver that sees every cycle report.
    pub fn cycle_receiver(&self) -> watch::Receiver<Option<CycleReport>> {
        self.cycle_rx.clone()
    }

    /// Check if the engine is ready to run cycles.
    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    /// Number of cycles run since creation.
    pub fn cycles_run(&self) -> u64 {
        self.cycles_run.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state_tx.send(state);
        metrics::set_engine_state(&state.to_string());
    }

    /// Open stores, install capture and load the checkpoint.
    ///
    /// Moves `Created → Starting → Running`, or to `Failed` on error.
    async fn prepare(&mut self) -> Result<Arc<Replicator<D>>> {
        if let Some(replicator) = &self.replicator {
            return Ok(Arc::clone(replicator));
        }
        if self.state() != EngineState::Created {
            return Err(ReplicationError::InvalidState {
                expected: "Created".to_string(),
                actual: format!("{:?}", self.state()),
            });
        }

        info!(
            pair_id = %self.config.pair_id,
            tables = self.config.schema.len(),
            sqlite = %self.config.relational.sqlite_path,
            "Starting replication engine"
        );
        self.set_state(EngineState::Starting);

        match self.open_pair().await {
            Ok(replicator) => {
                let replicator = Arc::new(replicator);
                self.replicator = Some(Arc::clone(&replicator));
                self.set_state(EngineState::Running);
                Ok(replicator)
            }
            Err(e) => {
                error!(pair_id = %self.config.pair_id, error = %e, "Replication engine failed to start");
                metrics::record_error(e.kind());
                self.set_state(EngineState::Failed);
                Err(e)
            }
        }
    }

    async fn open_pair(&mut self) -> Result<Replicator<D>> {
        self.config.validate()?;
        let since = self.config.cycle.since_sequence()?;

        let store = match &self.store {
            Some(store) => store.clone(),
            None => {
                let store = RelationalStore::open(&self.config.relational).await?;
                self.store = Some(store.clone());
                self.owns_store = true;
                store
            }
        };

        self.documents.ensure_ready(&RetryConfig::startup()).await?;

        let replicator = Replicator::open(
            self.config.pair_id.clone(),
            store,
            Arc::clone(&self.documents),
            Arc::new(self.config.schema.clone()),
        )
        .await?;

        if since.is_some() {
            replicator.set_since_override(since).await;
        }

        info!(
            pair_id = %self.config.pair_id,
            origin = %replicator.origin(),
            checkpoint = ?replicator.checkpoints().get().await.map(|s| s.number()),
            "Replication pair ready"
        );
        Ok(replicator)
    }

    /// Start the replication engine.
    ///
    /// 1. Opens the relational store
    /// 2. Waits for the document store
    /// 3. Installs change capture and loads the checkpoint
    /// 4. Spawns the cycle loop (first cycle runs immediately)
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(ReplicationError::InvalidState {
                expected: "Created".to_string(),
                actual: format!("{:?}", self.state()),
            });
        }

        let replicator = self.prepare().await?;
        let interval = self.config.cycle.interval_duration();
        let cycle_tx = Arc::clone(&self.cycle_tx);
        let cycles_run = Arc::clone(&self.cycles_run);
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        // Errors are already logged and published
                        let _ = run_and_publish(&replicator, &cycle_tx, &cycles_run).await;
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("Cycle loop stopping");
                            break;
                        }
                    }
                }
            }
        });
        self.loop_handle = Some(handle);

        info!(
            pair_id = %self.config.pair_id,
            interval_ms = interval.as_millis(),
            "Replication engine running"
        );
        Ok(())
    }

    /// Run exactly one cycle now.
    ///
    /// Prepares the pair on first use. Not allowed while the background loop
    /// from [`start()`](Self::start) is running.
    pub async fn run_once(&mut self) -> Result<CycleReport> {
        if self.loop_handle.is_some() {
            return Err(ReplicationError::InvalidState {
                expected: "no cycle loop".to_string(),
                actual: "cycle loop running".to_string(),
            });
        }
        let replicator = self.prepare().await?;
        run_and_publish(&replicator, &self.cycle_tx, &self.cycles_run).await
    }

    /// Get health status for monitoring endpoints.
    ///
    /// Performs no network I/O. The outbox depth is one local `COUNT(*)`.
    pub async fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let last = self.cycle_rx.borrow().clone();

        let (outbox_depth, checkpoint, origin) = match &self.replicator {
            Some(replicator) => (
                replicator.outbox().len().await.ok(),
                replicator.checkpoints().get().await,
                Some(replicator.origin().to_string()),
            ),
            None => (None, None, None),
        };

        let ready = state == EngineState::Running && self.replicator.is_some();
        let healthy = ready
            && last
                .as_ref()
                .map(|report| report.outcome.is_success())
                .unwrap_or(true);

        HealthCheck {
            pair_id: self.config.pair_id.clone(),
            state,
            ready,
            healthy,
            cycles_run: self.cycles_run(),
            last_outcome: last.as_ref().map(|report| report.outcome),
            last_error: last.and_then(|report| report.error),
            outbox_depth,
            checkpoint,
            origin,
        }
    }

    /// Shutdown the replication engine gracefully.
    ///
    /// 1. Signal the cycle loop to stop
    /// 2. Wait for the cycle in flight (with timeout)
    /// 3. Close the relational store, unless the host supplied it
    pub async fn shutdown(&mut self) {
        info!(pair_id = %self.config.pair_id, "Shutting down replication engine");
        self.set_state(EngineState::ShuttingDown);

        let _ = self.shutdown_tx.send(true);

        if let Some(mut handle) = self.loop_handle.take() {
            let wait = self.config.cycle.shutdown_timeout_duration();
            match tokio::time::timeout(wait, &mut handle).await {
                Ok(Ok(())) => debug!("Cycle loop completed gracefully"),
                Ok(Err(e)) => warn!(error = %e, "Cycle loop panicked during shutdown"),
                Err(_) => {
                    warn!("Cycle loop timed out during shutdown, aborting");
                    handle.abort();
                }
            }
        }

        self.replicator = None;
        if let Some(store) = self.store.take() {
            if std::mem::take(&mut self.owns_store) {
                store.close().await;
            } else {
                debug!("Leaving host-supplied relational store open");
            }
        }

        self.set_state(EngineState::Stopped);
        info!(
            pair_id = %self.config.pair_id,
            cycles = self.cycles_run(),
            "Replication engine stopped"
        );
    }
}

/// Run one cycle and publish its report, errored or not.
async fn run_and_publish<D: DocumentStore>(
    replicator: &Replicator<D>,
    cycle_tx: &watch::Sender<Option<CycleReport>>,
    cycles_run: &AtomicU64,
) -> Result<CycleReport> {
    let start = Instant::now();
    let result = replicator.run_cycle().await;
    cycles_run.fetch_add(1, Ordering::Relaxed);

    match &result {
        Ok(report) => {
            cycle_tx.send_replace(Some(report.clone()));
        }
        Err(e) => {
            metrics::record_error(e.kind());
            cycle_tx.send_replace(Some(CycleReport::errored(None, e, start.elapsed())));
        }
    }
    result
}
