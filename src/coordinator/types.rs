// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine and cycle state types.
//!
//! # State Transitions
//!
//! ```text
//!                  start() / run_once()
//! Created ───────────────────→ Starting
//!    │                              │
//!    │ (shutdown before start)      │ (stores open, capture installed)
//!    ↓                              ↓
//! Stopped                       Running
//!    ↑                              │
//!    │                    shutdown()│
//!    │                              ↓
//!    └────────────────── ShuttingDown
//!
//! Starting ──(store unreachable, missing table)──→ Failed
//! ```
//!
//! A failed *cycle* does not change the engine state; the next cycle starts
//! over from persisted state.

use crate::document::Sequence;
use std::time::Duration;

/// State of the replication engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Engine created but not started.
    ///
    /// Call [`start()`](super::ReplicationEngine::start) to begin replication.
    Created,

    /// Opening the relational store, installing capture, reaching the
    /// document store.
    Starting,

    /// Running cycles.
    Running,

    /// Shutting down gracefully.
    ///
    /// The cycle in flight (if any) is allowed to finish.
    ShuttingDown,

    /// Stopped.
    ///
    /// Engine has shut down cleanly. Safe to drop.
    Stopped,

    /// Failed to start.
    ///
    /// Check logs for error details.
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Starting => write!(f, "Starting"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}

/// The two halves of a cycle, always run in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    /// Change feed → relational store.
    Inbound,
    /// Outbox → document store.
    Outbound,
}

/// How a cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Both halves ran to the end.
    Completed,
    /// A change from the feed was rejected. Checkpoint unchanged, outbound skipped.
    InboundFailed,
    /// An outbox entry was rejected. It stays at the head of the queue.
    OutboundFailed,
    /// Infrastructure failure (feed unreachable, local database error).
    Errored,
}

impl CycleOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::InboundFailed => "inbound_failed",
            Self::OutboundFailed => "outbound_failed",
            Self::Errored => "errored",
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Summary of one cycle, published to watchers after every cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    /// Phase that failed, if any.
    pub failed_phase: Option<CyclePhase>,
    /// Feed changes applied to the relational store.
    pub inbound_applied: usize,
    /// Feed changes outside the tracked tables.
    pub inbound_skipped: usize,
    /// Checkpoint after the cycle.
    pub checkpoint: Option<Sequence>,
    /// Whether this cycle moved the checkpoint.
    pub checkpoint_advanced: bool,
    /// Outbox entries applied to the document store.
    pub outbound_applied: usize,
    /// Error message for `Errored` cycles.
    pub error: Option<String>,
    pub duration: Duration,
}

impl CycleReport {
    /// Report for a cycle that hit an infrastructure error.
    pub fn errored(phase: Option<CyclePhase>, error: impl ToString, duration: Duration) -> Self {
        Self {
            outcome: CycleOutcome::Errored,
            failed_phase: phase,
            inbound_applied: 0,
            inbound_skipped: 0,
            checkpoint: None,
            checkpoint_advanced: false,
            outbound_applied: 0,
            error: Some(error.to_string()),
            duration,
        }
    }

    /// Whether anything moved in either direction.
    pub fn did_work(&self) -> bool {
        self.inbound_applied > 0 || self.outbound_applied > 0 || self.checkpoint_advanced
    }
}

/// Health snapshot for monitoring endpoints.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub pair_id: String,
    pub state: EngineState,
    /// Stores open and capture installed.
    pub ready: bool,
    /// Ready and the last cycle (if any) completed.
    pub healthy: bool,
    pub cycles_run: u64,
    pub last_outcome: Option<CycleOutcome>,
    pub last_error: Option<String>,
    /// Pending outbox entries; `None` before the store is open.
    pub outbox_depth: Option<u64>,
    pub checkpoint: Option<Sequence>,
    /// Origin marker of the relational database.
    pub origin: Option<String>,
}
