// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication orchestrator.
//!
//! Ties together:
//! - Checkpointing via [`crate::checkpoint::CheckpointStore`]
//! - Full sync via [`crate::full_sync::FullSyncRunner`]
//! - Change-log tailing via [`crate::tailer::ChangeLogTailer`]
//!
//! # Lifecycle
//!
//! 1. Take a start anchor (now) and persist it as the resume point
//! 2. Full-sync every configured collection, in configuration order
//! 3. Tail the change log from the anchor until shutdown
//! 4. On shutdown, write the last completed position to the `.end` marker
//!
//! Every run re-anchors and re-copies; an earlier resume point is only
//! logged. Writes made during the full sync are replayed by the tailer,
//! so the destination converges (at-least-once).
//!
//! # Shutdown
//!
//! The caller owns the shutdown channel and sends `true` on it (the binary
//! does so on SIGINT/SIGTERM). Every phase watches it at each suspension
//! point. Dropping the sender also counts as shutdown.

mod types;

pub use types::{EngineState, RunReport};

use crate::checkpoint::{CheckpointStore, LogicalTime};
use crate::codec::CodecRegistry;
use crate::config::ReplicatorConfig;
use crate::error::{ReplicationError, Result};
use crate::full_sync::FullSyncRunner;
use crate::metrics;
use crate::store::DocumentStore;
use crate::tailer::ChangeLogTailer;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, info_span, Instrument};

/// Resolves once shutdown has been requested or the sender is gone.
///
/// Cancel-safe; meant to be the first branch of a `biased` select.
pub async fn shutdown_requested(shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow_and_update() {
            return;
        }
        if shutdown_rx.changed().await.is_err() {
            return;
        }
    }
}

/// The replicator: one full sync followed by continuous tailing.
pub struct Replicator<S: DocumentStore, D: DocumentStore> {
    config: Arc<ReplicatorConfig>,
    source: Arc<S>,
    dest: Arc<D>,
    codecs: Arc<CodecRegistry>,
    checkpoint: CheckpointStore,
    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,
}

impl<S: DocumentStore, D: DocumentStore> Replicator<S, D> {
    /// Create a replicator. Starts in `Created`; nothing touches the stores
    /// or the checkpoint file until [`run`](Self::run).
    pub fn new(config: Arc<ReplicatorConfig>, source: Arc<S>, dest: Arc<D>, codecs: CodecRegistry) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let checkpoint = CheckpointStore::new(&config.timestamp_file);
        Self {
            config,
            source,
            dest,
            codecs: Arc::new(codecs),
            checkpoint,
            state_tx,
            state_rx,
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn config(&self) -> &ReplicatorConfig {
        &self.config
    }

    pub fn checkpoint(&self) -> &CheckpointStore {
        &self.checkpoint
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state_tx.send(state);
        metrics::set_engine_state(&state.to_string());
    }

    fn fail(&self, e: ReplicationError) -> ReplicationError {
        error!(error = %e, "Replication failed");
        self.set_state(EngineState::Failed);
        e
    }

    /// Run anchored at the current time until shutdown.
    pub async fn run(&self, shutdown_rx: watch::Receiver<bool>) -> Result<RunReport> {
        self.run_at(LogicalTime::now(), shutdown_rx).await
    }

    /// Run anchored at `anchor` until shutdown.
    ///
    /// Returns `Ok` after a clean shutdown (marker written) and `Err` on any
    /// fatal error. Can only be called once.
    pub async fn run_at(&self, anchor: LogicalTime, mut shutdown_rx: watch::Receiver<bool>) -> Result<RunReport> {
        if self.state() != EngineState::Created {
            return Err(ReplicationError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        info!(
            db = %self.config.db,
            collections = self.config.collections.len(),
            flush_count = self.config.flush_count,
            "Starting replicator"
        );

        let mut report = RunReport {
            anchor,
            ..Default::default()
        };

        // 1. Start checkpoint
        self.set_state(EngineState::Checkpointing);
        if let Err(e) = self.checkpoint.record_start(anchor).await {
            return Err(self.fail(e));
        }

        // 2. Full sync, one collection at a time
        self.set_state(EngineState::FullSync);
        let runner = FullSyncRunner::new(
            Arc::clone(&self.source),
            Arc::clone(&self.dest),
            Arc::clone(&self.config),
            Arc::clone(&self.codecs),
        );
        for spec in &self.config.collections {
            let span = info_span!("full_sync", collection = %spec.name);
            match runner.run(spec, &mut shutdown_rx).instrument(span).await {
                Ok(collection) => report.collections.push(collection),
                Err(ReplicationError::Shutdown) => {
                    info!(collection = %spec.name, "Shutdown during full sync");
                    return self.shut_down(report, anchor).await;
                }
                Err(e) => return Err(self.fail(e)),
            }
        }
        info!(
            collections = report.collections.len(),
            documents = report.documents_copied(),
            "Full sync finished, switching to change log"
        );

        // 3. Tail until shutdown
        self.set_state(EngineState::Tailing);
        let mut tailer = ChangeLogTailer::new(
            Arc::clone(&self.source),
            Arc::clone(&self.dest),
            Arc::clone(&self.config),
            Arc::clone(&self.codecs),
        );
        let tailed = tailer
            .run(anchor, &mut shutdown_rx)
            .instrument(info_span!("tail", from = %anchor))
            .await;

        match tailed {
            Ok(tail_report) => {
                report.tailer = Some(tail_report);
                self.shut_down(report, tail_report.position).await
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Log, persist the shutdown marker, stop.
    async fn shut_down(&self, mut report: RunReport, position: LogicalTime) -> Result<RunReport> {
        self.set_state(EngineState::ShuttingDown);
        info!(%position, "Exit");

        if let Err(e) = self.checkpoint.record_shutdown(position).await {
            return Err(self.fail(e));
        }

        report.shutdown_position = position;
        self.set_state(EngineState::Stopped);
        info!("Replicator stopped");
        Ok(report)
    }
}
