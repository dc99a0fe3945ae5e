// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change-log tailer: applies source changes to the destination as they happen.
//!
//! # State Machine
//!
//! ```text
//! Positioning ──open query──▶ Streaming ◀──entry──┐
//!                                 │               │
//!                                 └─no entry──▶ Waiting
//!
//! any state ──shutdown──▶ Stopped
//! ```
//!
//! There is no error state. Per-event failures are logged and the event is
//! dropped; failing to open the tail query or to advance the cursor ends the
//! run with an error.
//!
//! # Per-Event Pipeline
//!
//! 1. Split `ns`; skip other databases and unconfigured collections
//! 2. Skip `fromMigrate` entries
//! 3. Encode through the collection's codec into exactly one write
//! 4. Apply it as a single-operation bulk write
//!
//! # Position
//!
//! `position()` is the timestamp of the last event whose processing
//! finished (applied, skipped or dropped). An event interrupted by shutdown
//! does not advance it, so reading again from `ts > position` repeats it.

use crate::bulk::BulkWriter;
use crate::change_log::ChangeEvent;
use crate::checkpoint::LogicalTime;
use crate::codec::CodecRegistry;
use crate::config::ReplicatorConfig;
use crate::coordinator::shutdown_requested;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::store::{DocumentStore, DocumentStream, Namespace, QueryOptions, StoreError};
use bson::{doc, Document, Timestamp};
use futures::StreamExt;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Tailer lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailerState {
    /// Opening the tail query at the start position.
    Positioning,
    /// Reading and applying entries.
    Streaming,
    /// Caught up, awaiting new entries.
    Waiting,
    /// Shut down.
    Stopped,
}

impl fmt::Display for TailerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TailerState::Positioning => "Positioning",
            TailerState::Streaming => "Streaming",
            TailerState::Waiting => "Waiting",
            TailerState::Stopped => "Stopped",
        };
        f.write_str(s)
    }
}

/// Why an entry was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// `ns` is empty or has no collection part (no-ops).
    NoNamespace,
    OtherDatabase,
    UnconfiguredCollection,
    FromMigrate,
    /// Commands and other entries that don't map to a document write.
    NotAWrite,
}

/// What happened to one change-log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Applied,
    Skipped(SkipReason),
    /// Could not be parsed, encoded or written. Logged and dropped.
    Failed,
}

impl EventOutcome {
    fn label(&self) -> &'static str {
        match self {
            EventOutcome::Applied => "applied",
            EventOutcome::Skipped(_) => "skipped",
            EventOutcome::Failed => "failed",
        }
    }
}

/// Counters returned when the tailer stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TailerReport {
    /// Last fully processed position (the start position if none).
    pub position: LogicalTime,
    /// Entries read.
    pub events: u64,
    pub applied: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// Tails the source change log and applies relevant entries.
pub struct ChangeLogTailer<S: DocumentStore, D: DocumentStore> {
    source: Arc<S>,
    dest: Arc<D>,
    config: Arc<ReplicatorConfig>,
    codecs: Arc<CodecRegistry>,
    state_tx: watch::Sender<TailerState>,
    state_rx: watch::Receiver<TailerState>,
    report: TailerReport,
}

impl<S: DocumentStore, D: DocumentStore> ChangeLogTailer<S, D> {
    pub fn new(
        source: Arc<S>,
        dest: Arc<D>,
        config: Arc<ReplicatorConfig>,
        codecs: Arc<CodecRegistry>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(TailerState::Positioning);
        Self {
            source,
            dest,
            config,
            codecs,
            state_tx,
            state_rx,
            report: TailerReport::default(),
        }
    }

    /// Watch state transitions.
    pub fn state_receiver(&self) -> watch::Receiver<TailerState> {
        self.state_rx.clone()
    }

    pub fn state(&self) -> TailerState {
        *self.state_rx.borrow()
    }

    /// Last fully processed position.
    pub fn position(&self) -> LogicalTime {
        self.report.position
    }

    pub fn report(&self) -> TailerReport {
        self.report
    }

    fn set_state(&self, state: TailerState) {
        let current = *self.state_rx.borrow();
        if current != state {
            debug!(from = %current, to = %state, "Tailer state change");
            let _ = self.state_tx.send(state);
            metrics::set_tailer_state(&state.to_string());
        }
    }

    /// Tail from `from` (exclusive) until shutdown.
    ///
    /// Returns the report on shutdown; errors only when the change log
    /// cannot be opened or read.
    pub async fn run(&mut self, from: LogicalTime, shutdown_rx: &mut watch::Receiver<bool>) -> Result<TailerReport> {
        self.set_state(TailerState::Positioning);
        self.report = TailerReport {
            position: from,
            ..Default::default()
        };

        let change_log = self.config.tailer.change_log()?;
        let await_timeout = self.config.tailer.await_timeout_duration();

        info!(change_log = %change_log, %from, "Opening change log");

        let mut stream = tokio::select! {
            biased;
            _ = shutdown_requested(shutdown_rx) => {
                self.set_state(TailerState::Stopped);
                return Ok(self.report);
            }
            opened = self.open(&change_log, from) => opened?,
        };

        self.set_state(TailerState::Streaming);
        info!("Tailing change log");

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown_requested(shutdown_rx) => break,
                next = timeout(await_timeout, stream.next()) => next,
            };

            let raw = match next {
                Err(_elapsed) => {
                    self.set_state(TailerState::Waiting);
                    continue;
                }
                Ok(Some(Ok(raw))) => raw,
                Ok(Some(Err(e))) => return Err(ReplicationError::store("getMore", e)),
                Ok(None) => {
                    return Err(ReplicationError::store(
                        "getMore",
                        StoreError::new(format!("change log cursor on {} was closed", change_log)),
                    ))
                }
            };

            self.set_state(TailerState::Streaming);

            let outcome = tokio::select! {
                biased;
                _ = shutdown_requested(shutdown_rx) => {
                    info!(position = %self.report.position, "Shutdown while applying an event, it will be replayed");
                    break;
                }
                outcome = self.handle_event(raw) => outcome,
            };
            self.record(outcome);
        }

        self.set_state(TailerState::Stopped);
        info!(
            position = %self.report.position,
            events = self.report.events,
            applied = self.report.applied,
            skipped = self.report.skipped,
            failed = self.report.failed,
            "Tailer stopped"
        );
        Ok(self.report)
    }

    async fn open(&self, change_log: &Namespace, from: LogicalTime) -> Result<DocumentStream> {
        let filter = doc! { "ts": { "$gt": Timestamp::from(from) } };
        let options = QueryOptions::tailing(self.config.tailer.await_timeout_duration());
        self.source
            .query(change_log, filter, options)
            .await
            .map_err(|e| ReplicationError::store("find", e))
    }

    fn record(&mut self, outcome: EventOutcome) {
        self.report.events += 1;
        match outcome {
            EventOutcome::Applied => self.report.applied += 1,
            EventOutcome::Skipped(_) => self.report.skipped += 1,
            EventOutcome::Failed => self.report.failed += 1,
        }
        metrics::record_change_event(outcome.label());

        if self.report.events % self.config.tailer.progress_every.max(1) == 0 {
            info!(
                events = self.report.events,
                applied = self.report.applied,
                position = %self.report.position,
                "Change log progress"
            );
        }
    }

    /// Process one raw change-log entry and advance the position past it.
    pub async fn handle_event(&mut self, raw: Document) -> EventOutcome {
        let ts = raw.get_timestamp("ts").ok().map(LogicalTime::from);
        let outcome = self.apply(raw).await;

        if let Some(ts) = ts {
            if ts > self.report.position {
                self.report.position = ts;
                metrics::set_tail_position(ts.seconds);
                metrics::record_tail_lag(ts.lag_seconds());
            }
        }
        outcome
    }

    async fn apply(&self, raw: Document) -> EventOutcome {
        let event = match ChangeEvent::from_document(raw) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Malformed change log entry, dropping it");
                return EventOutcome::Failed;
            }
        };

        let namespace = match event.split_namespace() {
            Some(ns) => ns,
            None => return EventOutcome::Skipped(SkipReason::NoNamespace),
        };
        if namespace.database != self.config.db {
            return EventOutcome::Skipped(SkipReason::OtherDatabase);
        }
        let codec = match self.codecs.get(&namespace.collection) {
            Some(codec) => Arc::clone(codec),
            None => return EventOutcome::Skipped(SkipReason::UnconfiguredCollection),
        };
        if event.from_migrate {
            debug!(namespace = %namespace, ts = %event.timestamp, "Skipping migration entry");
            return EventOutcome::Skipped(SkipReason::FromMigrate);
        }

        let op = match event.to_write(codec.as_ref()) {
            Ok(Some(op)) => op,
            Ok(None) => return EventOutcome::Skipped(SkipReason::NotAWrite),
            Err(e) => {
                warn!(error = %e, event = %event.to_json(), "Failed to encode change event, dropping it");
                return EventOutcome::Failed;
            }
        };

        let mut writer = BulkWriter::new(Arc::clone(&self.dest), namespace.clone(), 1);
        match writer.push(op).await {
            Ok(_) => EventOutcome::Applied,
            Err(e) => {
                writer.discard();
                metrics::record_apply_error(&namespace.collection, e.code());
                warn!(
                    code = e.code().unwrap_or_default(),
                    message = %e,
                    event = %event.to_json(),
                    "Failed to apply change event, dropping it"
                );
                EventOutcome::Failed
            }
        }
    }
}
