//! # Oplog Replicator
//!
//! Copies a set of collections from a source document store to a
//! destination, then keeps the destination in sync by tailing the source's
//! change log.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                              Replicator                                  │
//! │                                                                          │
//! │  ┌────────────────┐   ┌────────────────┐   ┌─────────────────────────┐   │
//! │  │ CheckpointStore│   │ FullSyncRunner │──►│ BulkWriter (flushCount) │──►│──► destination
//! │  │ (anchor, .end) │   │ (per collection│   └─────────────────────────┘   │
//! │  └────────────────┘   │  + indexes)    │                                 │
//! │                       └────────────────┘                                 │
//! │                       ┌────────────────┐   ┌─────────────────────────┐   │
//! │     source ──────────►│ ChangeLogTailer│──►│ BulkWriter (1 op)       │──►│──► destination
//! │   (local.oplog.rs)    │ (filter+codec) │   └─────────────────────────┘   │
//! │                       └────────────────┘                                 │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Two Phases
//!
//! 1. **Full sync**: every configured collection, in order, in natural order,
//!    flushed in batches of `flushCount`, then its indexes.
//! 2. **Tailing**: change-log entries after the start anchor, one write each.
//!    A failing entry is logged and dropped; tailing continues.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use oplog_replicator::codec::{CodecRegistry, PassthroughCodecFactory, SecretSource};
//! use oplog_replicator::mongo::MongoStore;
//! use oplog_replicator::resilience::RetryConfig;
//! use oplog_replicator::{Replicator, ReplicatorConfig};
//! use std::sync::Arc;
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() -> oplog_replicator::Result<()> {
//!     let config = Arc::new(ReplicatorConfig::load("replicator.json")?);
//!     let secret = SecretSource::from_env(&config);
//!     let codecs = CodecRegistry::build(&config, &PassthroughCodecFactory, secret.as_ref())?;
//!
//!     let retry = RetryConfig::startup();
//!     let source = Arc::new(MongoStore::connect(&config.source_uri, "source", &retry).await?);
//!     let dest = Arc::new(MongoStore::connect(&config.dest_uri, "destination", &retry).await?);
//!
//!     let (_shutdown_tx, shutdown_rx) = watch::channel(false);
//!     let replicator = Replicator::new(config, source, dest, codecs);
//!     replicator.run(shutdown_rx).await?;
//!     Ok(())
//! }
//! ```

pub mod bulk;
pub mod change_log;
pub mod checkpoint;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod full_sync;
pub mod metrics;
pub mod mongo;
pub mod resilience;
pub mod store;
pub mod tailer;

// Re-exports for convenience
pub use bulk::BulkWriter;
pub use change_log::{ChangeEvent, ChangeOp};
pub use checkpoint::{CheckpointStore, LogicalTime};
pub use codec::{CodecRegistry, DocumentCodec};
pub use config::{CollectionSpec, ReplicatorConfig, TailerSettings};
pub use coordinator::{EngineState, Replicator, RunReport};
pub use error::{ReplicationError, Result};
pub use full_sync::{FullSyncReport, FullSyncRunner};
pub use mongo::MongoStore;
pub use store::{DocumentStore, Namespace, StoreError, WriteOp};
pub use tailer::{ChangeLogTailer, TailerReport, TailerState};
