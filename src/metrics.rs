//! Metrics for observability.
//!
//! Emitted through the `metrics` facade. Nothing is exported unless the
//! embedding process installs a recorder, in which case these become
//! Prometheus-style series:
//! - Store connectivity
//! - Full-sync throughput and bulk flush latency
//! - Change-log events by outcome
//! - Checkpoint writes
//! - Engine and tailer state
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replicator_`:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use oplog_replicator::metrics;
//! use std::time::Duration;
//!
//! metrics::record_documents_copied("user_v2", 10_000);
//! metrics::record_bulk_flush("user_v2", 10_000, true, Duration::from_millis(850));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a store connection attempt (`side` is `source` or `destination`).
pub fn record_store_connection(side: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("replicator_store_connections_total", "side" => side.to_string(), "status" => status).increment(1);
}

// =============================================================================
// Full Sync Metrics
// =============================================================================

/// Record documents read from the source during full sync.
pub fn record_documents_copied(collection: &str, count: usize) {
    counter!("replicator_documents_copied_total", "collection" => collection.to_string())
        .increment(count as u64);
}

/// Record one bulk write flush.
pub fn record_bulk_flush(collection: &str, ops: usize, success: bool, duration: Duration) {
    let coll = collection.to_string();
    let status = if success { "success" } else { "failure" };

    counter!("replicator_bulk_flushes_total", "collection" => coll.clone(), "status" => status)
        .increment(1);
    histogram!("replicator_bulk_flush_duration_seconds", "collection" => coll.clone())
        .record(duration.as_secs_f64());
    histogram!("replicator_bulk_size", "collection" => coll).record(ops as f64);
}

/// Record index definitions copied to the destination.
pub fn record_indexes_copied(collection: &str, count: usize) {
    counter!("replicator_indexes_copied_total", "collection" => collection.to_string())
        .increment(count as u64);
}

/// Record a finished full sync of one collection.
pub fn record_full_sync_complete(collection: &str, documents: u64, batches: u64, duration: Duration) {
    let coll = collection.to_string();
    gauge!("replicator_full_sync_documents", "collection" => coll.clone()).set(documents as f64);
    gauge!("replicator_full_sync_batches", "collection" => coll.clone()).set(batches as f64);
    histogram!("replicator_full_sync_duration_seconds", "collection" => coll)
        .record(duration.as_secs_f64());
}

// =============================================================================
// Change Log Metrics
// =============================================================================

/// Record one change-log event by outcome (`applied`, `skipped`, `failed`).
pub fn record_change_event(outcome: &str) {
    counter!("replicator_change_events_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record a destination failure while applying a change event.
pub fn record_apply_error(collection: &str, code: Option<i32>) {
    let code = code.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string());
    counter!(
        "replicator_apply_errors_total",
        "collection" => collection.to_string(),
        "code" => code
    )
    .increment(1);
}

/// Record the change-log position the tailer has completed through (seconds part).
pub fn set_tail_position(seconds: u32) {
    gauge!("replicator_tail_position_seconds").set(seconds as f64);
}

/// Record lag between wall clock and the last completed change event.
pub fn record_tail_lag(lag_seconds: f64) {
    gauge!("replicator_tail_lag_seconds").set(lag_seconds);
}

/// Gauge for tailer state.
pub fn set_tailer_state(state: &str) {
    let value = match state {
        "Positioning" => 0.0,
        "Streaming" => 1.0,
        "Waiting" => 2.0,
        "Stopped" => 3.0,
        _ => -1.0,
    };
    gauge!("replicator_tailer_state").set(value);
}

// =============================================================================
// Checkpoint Metrics
// =============================================================================

/// Record a checkpoint write (`kind` is `start` or `shutdown`).
pub fn record_checkpoint_write(kind: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("replicator_checkpoint_writes_total", "kind" => kind.to_string(), "status" => status)
        .increment(1);
}

/// Record a retried checkpoint I/O operation.
pub fn checkpoint_retries_total(operation: &str) {
    counter!("replicator_checkpoint_retries_total", "operation" => operation.to_string()).increment(1);
}

// =============================================================================
// Engine Metrics
// =============================================================================

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Checkpointing" => 1.0,
        "FullSync" => 2.0,
        "Tailing" => 3.0,
        "ShuttingDown" => 4.0,
        "Stopped" => 5.0,
        "Failed" => 6.0,
        _ => -1.0,
    };
    gauge!("replicator_engine_state").set(value);
}
