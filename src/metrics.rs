// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports metrics through the `metrics` facade; the host decides which
//! recorder (Prometheus, statsd, none) receives them.
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replicant_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a change pulled from the document store and its outcome.
pub fn record_inbound_change(table: &str, outcome: &str) {
    counter!(
        "replicant_inbound_changes_total",
        "table" => table.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record an outbox entry pushed to the document store and its outcome.
pub fn record_outbound_change(table: &str, outcome: &str) {
    counter!(
        "replicant_outbound_changes_total",
        "table" => table.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a change feed fetch.
pub fn record_feed_read(changes: usize, duration: Duration) {
    counter!("replicant_feed_reads_total").increment(1);
    counter!("replicant_feed_changes_read_total").increment(changes as u64);
    histogram!("replicant_feed_read_duration_seconds").record(duration.as_secs_f64());
}

/// Current number of pending outbox entries.
pub fn set_outbox_depth(depth: u64) {
    gauge!("replicant_outbox_depth").set(depth as f64);
}

/// Last persisted change feed sequence.
pub fn set_checkpoint(seq: u64) {
    gauge!("replicant_checkpoint_seq").set(seq as f64);
}

/// Record a finished replication cycle.
pub fn record_cycle(outcome: &str, duration: Duration) {
    counter!("replicant_cycles_total", "outcome" => outcome.to_string()).increment(1);
    histogram!("replicant_cycle_duration_seconds").record(duration.as_secs_f64());
}

/// Record errors by type.
pub fn record_error(error_type: &str) {
    counter!("replicant_errors_total", "error_type" => error_type.to_string()).increment(1);
}

/// Record SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn sqlite_retries_total(operation: &str) {
    counter!("replicant_sqlite_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Record change capture installed on a table.
pub fn record_capture_installed(table: &str) {
    counter!("replicant_capture_installs_total", "table" => table.to_string()).increment(1);
}

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("replicant_engine_state").set(value);
}
