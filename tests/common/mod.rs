//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - In-memory DocumentStore with failure injection
//! - Change-log entry builders
//! - A harness that runs the replicator against two memory stores

#![allow(dead_code)]

pub mod mock_store;

pub use mock_store::*;

use bson::{doc, Document, Timestamp};
use oplog_replicator::checkpoint::LogicalTime;
use oplog_replicator::codec::CodecRegistry;
use oplog_replicator::config::ReplicatorConfig;
use oplog_replicator::coordinator::{EngineState, Replicator, RunReport};
use oplog_replicator::store::Namespace;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub const DB: &str = "usercenter";

/// Anchor used by harness runs; change-log entries must be after it.
pub const ANCHOR: LogicalTime = LogicalTime::new(1_700_000_000, 0);

pub fn ns(collection: &str) -> Namespace {
    Namespace::new(DB, collection)
}

/// Timestamp `n` ticks after [`ANCHOR`].
pub fn ts(n: u32) -> Timestamp {
    Timestamp {
        time: ANCHOR.seconds + n,
        increment: 0,
    }
}

// =============================================================================
// Change-log entries
// =============================================================================

pub fn insert_entry(at: Timestamp, namespace: &str, o: Document) -> Document {
    doc! { "ts": at, "op": "i", "ns": namespace, "o": o }
}

pub fn update_entry(at: Timestamp, namespace: &str, o2: Document, o: Document) -> Document {
    doc! { "ts": at, "op": "u", "ns": namespace, "o2": o2, "o": o }
}

pub fn delete_entry(at: Timestamp, namespace: &str, o: Document) -> Document {
    doc! { "ts": at, "op": "d", "ns": namespace, "o": o }
}

pub fn noop_entry(at: Timestamp) -> Document {
    doc! { "ts": at, "op": "n", "ns": "", "o": { "msg": "periodic noop" } }
}

// =============================================================================
// Harness
// =============================================================================

/// Config pointing the checkpoint into `dir`, with a short tail await.
pub fn test_config(dir: &Path, collections: &[&str]) -> ReplicatorConfig {
    let mut config = ReplicatorConfig::for_testing(DB, collections);
    config.timestamp_file = dir.join("timestamp.bin");
    config.tailer.await_timeout = "20ms".to_string();
    config
}

/// Replicator over two memory stores plus the handles a test needs.
pub struct Harness {
    pub source: Arc<MemoryStore>,
    pub dest: Arc<MemoryStore>,
    pub replicator: Replicator<MemoryStore, MemoryStore>,
    shutdown: Option<(watch::Sender<bool>, watch::Receiver<bool>)>,
}

impl Harness {
    pub fn new(config: ReplicatorConfig) -> Self {
        Self::with_stores(config, Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new()))
    }

    pub fn with_stores(config: ReplicatorConfig, source: Arc<MemoryStore>, dest: Arc<MemoryStore>) -> Self {
        let codecs = CodecRegistry::identity(&config);
        Self::with_codecs(config, source, dest, codecs)
    }

    pub fn with_codecs(
        config: ReplicatorConfig,
        source: Arc<MemoryStore>,
        dest: Arc<MemoryStore>,
        codecs: CodecRegistry,
    ) -> Self {
        let replicator = Replicator::new(Arc::new(config), Arc::clone(&source), Arc::clone(&dest), codecs);
        Self {
            source,
            dest,
            replicator,
            shutdown: Some(watch::channel(false)),
        }
    }

    /// Run the replicator at [`ANCHOR`] alongside `driver`.
    ///
    /// `driver` gets the engine state receiver and the shutdown sender.
    /// Dropping the sender counts as shutdown, so a driver that expects a
    /// failure should wait for it before returning.
    pub async fn run_with<F, Fut>(&mut self, driver: F) -> oplog_replicator::Result<RunReport>
    where
        F: FnOnce(watch::Receiver<EngineState>, watch::Sender<bool>) -> Fut,
        Fut: Future<Output = ()>,
    {
        let (shutdown_tx, shutdown_rx) = self.shutdown.take().expect("harness runs once");
        let state_rx = self.replicator.state_receiver();

        let run = self.replicator.run_at(ANCHOR, shutdown_rx);
        let (result, ()) = tokio::time::timeout(Duration::from_secs(30), async {
            tokio::join!(run, driver(state_rx, shutdown_tx))
        })
        .await
        .expect("replicator run timed out");
        result
    }

    /// Run until the engine is tailing, let `during_tail` act, then shut down.
    pub async fn run_tailing<F, Fut>(&mut self, during_tail: F) -> oplog_replicator::Result<RunReport>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        self.run_with(|mut state_rx, shutdown_tx| async move {
            if wait_for_state(&mut state_rx, EngineState::Tailing).await == EngineState::Tailing {
                during_tail().await;
            }
            let _ = shutdown_tx.send(true);
        })
        .await
    }
}

/// Wait until the engine reaches `target` (or any terminal state).
pub async fn wait_for_state(state_rx: &mut watch::Receiver<EngineState>, target: EngineState) -> EngineState {
    loop {
        let current = *state_rx.borrow_and_update();
        if current == target || current.is_terminal() {
            return current;
        }
        if state_rx.changed().await.is_err() {
            return *state_rx.borrow();
        }
    }
}

/// Poll `check` every 5ms until it returns true, panicking after `limit`.
pub async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + limit;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met within {:?}", limit);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
