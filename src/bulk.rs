//! Bulk writer for destination operations.
//!
//! Accumulates writes in arrival order and hands them to the destination
//! as one `bulk_write` call.
//!
//! # Design
//!
//! ```text
//! push(op) ──▶ pending: Vec<WriteOp> ──(len == threshold)──▶ bulk_write(ns, pending)
//!                    ▲                                             │
//!                    │                      Ok  ◀──────────────────┤ clear
//!                    └───────────── unchanged ◀── Err ─────────────┘
//! ```
//!
//! - Flushes exactly when the batch reaches the threshold, or on `flush()`.
//! - A failed flush leaves the batch as it was; the caller retries or
//!   calls `discard()`. Nothing is retried here.
//! - Not shared: each phase owns its own writer, so at most one batch is
//!   ever in flight.

use crate::error::{ReplicationError, Result};
use crate::store::{DocumentStore, Namespace, WriteAck, WriteOp};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Result of one successful flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushResult {
    /// Operations sent.
    pub ops: usize,
    /// What the destination acknowledged.
    pub ack: WriteAck,
    pub duration: Duration,
}

/// Accumulates operations for one namespace and flushes them in batches.
pub struct BulkWriter<D: DocumentStore> {
    store: Arc<D>,
    namespace: Namespace,
    threshold: usize,
    pending: Vec<WriteOp>,
    batches: u64,
}

impl<D: DocumentStore> BulkWriter<D> {
    /// Create a writer. A threshold of 0 is treated as 1.
    pub fn new(store: Arc<D>, namespace: Namespace, threshold: usize) -> Self {
        let threshold = threshold.max(1);
        Self {
            store,
            namespace,
            threshold,
            pending: Vec::with_capacity(threshold.min(16_384)),
            batches: 0,
        }
    }

    /// Add an operation, flushing if the batch is now full.
    ///
    /// Returns the flush result when a flush happened.
    pub async fn push(&mut self, op: WriteOp) -> Result<Option<FlushResult>> {
        self.pending.push(op);
        if self.pending.len() >= self.threshold {
            return self.flush().await.map(Some);
        }
        Ok(None)
    }

    /// Send everything pending as one bulk write.
    ///
    /// An empty batch is a no-op and does not reach the store.
    pub async fn flush(&mut self) -> Result<FlushResult> {
        if self.pending.is_empty() {
            return Ok(FlushResult::default());
        }

        let ops = self.pending.len();
        let start = Instant::now();
        let result = self.store.bulk_write(&self.namespace, &self.pending).await;
        let duration = start.elapsed();

        crate::metrics::record_bulk_flush(&self.namespace.collection, ops, result.is_ok(), duration);

        match result {
            Ok(ack) => {
                self.pending.clear();
                self.batches += 1;
                debug!(
                    namespace = %self.namespace,
                    batch_size = ops,
                    duration_ms = duration.as_millis() as u64,
                    "Bulk write flushed"
                );
                Ok(FlushResult { ops, ack, duration })
            }
            Err(e) => {
                warn!(
                    namespace = %self.namespace,
                    batch_size = ops,
                    error = %e,
                    "Bulk write failed"
                );
                Err(ReplicationError::store("bulkWrite", e))
            }
        }
    }

    /// Drop everything pending. Returns how many operations were dropped.
    pub fn discard(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    /// Operations waiting for the next flush.
    pub fn pending(&self) -> &[WriteOp] {
        &self.pending
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Successful flushes so far.
    pub fn batches_flushed(&self) -> u64 {
        self.batches
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }
}
