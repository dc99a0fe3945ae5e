// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document store capability.
//!
//! The replicator never talks to a driver directly. It needs three things
//! from each side of the replication and nothing else:
//!
//! 1. `query` - a (possibly tailable) read in natural order
//! 2. `bulk_write` - an ordered batch of insert/update/delete operations
//! 3. `run_command` - opaque administrative commands (`listIndexes`, `createIndexes`)
//!
//! [`crate::mongo::MongoStore`] implements this over the MongoDB driver; the
//! test suite implements it in memory.
//!
//! # Example
//!
//! ```rust,no_run
//! use oplog_replicator::store::{
//!     BoxFuture, DocumentStore, DocumentStream, Namespace, QueryOptions, WriteAck, WriteOp,
//! };
//! use bson::Document;
//! use futures::StreamExt;
//!
//! struct Discard;
//!
//! impl DocumentStore for Discard {
//!     fn query<'a>(
//!         &'a self,
//!         _ns: &'a Namespace,
//!         _filter: Document,
//!         _opts: QueryOptions,
//!     ) -> BoxFuture<'a, DocumentStream> {
//!         Box::pin(async { Ok(futures::stream::empty().boxed()) })
//!     }
//!
//!     fn bulk_write<'a>(&'a self, _ns: &'a Namespace, ops: &'a [WriteOp]) -> BoxFuture<'a, WriteAck> {
//!         Box::pin(async move { Ok(WriteAck::for_ops(ops)) })
//!     }
//!
//!     fn run_command<'a>(&'a self, _db: &'a str, _command: Document) -> BoxFuture<'a, Document> {
//!         Box::pin(async { Ok(bson::doc! { "ok": 1 }) })
//!     }
//! }
//! ```

use bson::Document;
use futures::stream::BoxStream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

/// A stream of documents produced by [`DocumentStore::query`].
///
/// Owns whatever cursor state it needs, so it outlives the call that opened it.
pub type DocumentStream = BoxStream<'static, StoreResult<Document>>;

/// Error reported by a store.
///
/// `code` carries the server error code when the store reported one
/// (e.g. `11000` for a duplicate key), so tail-time failures can be logged
/// with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreError {
    pub code: Option<i32>,
    pub message: String,
}

impl StoreError {
    /// Error without a server code (network, client-side, ...).
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    /// Error with a server code.
    pub fn with_code(code: i32, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "[{}] {}", code, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for StoreError {}

/// A `database.collection` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub database: String,
    pub collection: String,
}

impl Namespace {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// Split `"db.collection"` at the first dot.
    ///
    /// Collection names may themselves contain dots (`local.oplog.rs`), the
    /// database name may not. Returns `None` when either half is empty.
    pub fn parse(ns: &str) -> Option<Self> {
        let (database, collection) = ns.split_once('.')?;
        if database.is_empty() || collection.is_empty() {
            return None;
        }
        Some(Self::new(database, collection))
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

/// One destination write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Insert a document.
    Insert(Document),
    /// Replace the single document matching `filter` with `replacement`.
    Update {
        filter: Document,
        replacement: Document,
    },
    /// Delete the single document matching `filter`.
    Delete { filter: Document },
}

impl WriteOp {
    /// Short name used in logs and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            WriteOp::Insert(_) => "insert",
            WriteOp::Update { .. } => "update",
            WriteOp::Delete { .. } => "delete",
        }
    }
}

/// Acknowledgement of a successful [`DocumentStore::bulk_write`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteAck {
    pub inserted: u64,
    pub matched: u64,
    pub deleted: u64,
}

impl WriteAck {
    /// Ack that assumes every operation took effect. For stores that don't
    /// report per-kind counts.
    pub fn for_ops(ops: &[WriteOp]) -> Self {
        let mut ack = Self::default();
        for op in ops {
            match op {
                WriteOp::Insert(_) => ack.inserted += 1,
                WriteOp::Update { .. } => ack.matched += 1,
                WriteOp::Delete { .. } => ack.deleted += 1,
            }
        }
        ack
    }

    /// Merge another ack into this one.
    pub fn absorb(&mut self, other: WriteAck) {
        self.inserted += other.inserted;
        self.matched += other.matched;
        self.deleted += other.deleted;
    }
}

/// How a query reads its collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryOptions {
    /// Sort by `$natural` (insertion order).
    pub natural_order: bool,
    /// Keep the cursor open at the end of the data and block for more
    /// (tailable + awaitData + no cursor timeout).
    pub tailable: bool,
    /// Upper bound for one server-side await on a tailable cursor.
    pub max_await_time: Option<Duration>,
}

impl QueryOptions {
    /// Finite read in insertion order (full sync).
    pub fn natural() -> Self {
        Self {
            natural_order: true,
            tailable: false,
            max_await_time: None,
        }
    }

    /// Never-ending read in insertion order (change log).
    pub fn tailing(max_await_time: Duration) -> Self {
        Self {
            natural_order: true,
            tailable: true,
            max_await_time: Some(max_await_time),
        }
    }
}

/// What the replicator needs from a document store.
///
/// One implementation serves both the source and the destination side.
pub trait DocumentStore: Send + Sync + 'static {
    /// Open a read over `namespace` filtered by `filter`.
    ///
    /// An error from the returned future means the query could not be
    /// opened; errors inside the stream mean the cursor could not advance.
    /// Both are fatal to the caller.
    fn query<'a>(
        &'a self,
        namespace: &'a Namespace,
        filter: Document,
        options: QueryOptions,
    ) -> BoxFuture<'a, DocumentStream>;

    /// Apply `ops` in order.
    ///
    /// All-or-nothing from the caller's perspective: an `Err` means the
    /// batch as a whole failed and the caller decides what to do with it.
    fn bulk_write<'a>(
        &'a self,
        namespace: &'a Namespace,
        ops: &'a [WriteOp],
    ) -> BoxFuture<'a, WriteAck>;

    /// Run an administrative command against `database`.
    fn run_command<'a>(&'a self, database: &'a str, command: Document) -> BoxFuture<'a, Document>;
}
