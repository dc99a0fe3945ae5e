// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Full sync: copy every matching document, then the index definitions.
//!
//! # Algorithm
//!
//! ```text
//! source.find(filter, $natural) ──▶ codec.encode ──▶ BulkWriter(flushCount) ──▶ destination
//!                                                          │
//!                                   end of cursor ──▶ flush remainder
//!                                                          │
//!                     listIndexes(source) ──▶ createIndexes(destination)
//! ```
//!
//! Documents land in the destination in the order the source returned them.
//! A collection with no matching documents still gets its indexes.
//!
//! # Error Policy
//!
//! Everything is fatal: a source read error, a codec error and a destination
//! write error all abort the run. There is no retry; the next run starts over.
//! The one exception is a missing source collection during index copy, which
//! means there is nothing to copy.

use crate::bulk::BulkWriter;
use crate::codec::{CodecRegistry, DocumentCodec};
use crate::config::{CollectionSpec, ReplicatorConfig};
use crate::coordinator::shutdown_requested;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::store::{DocumentStore, DocumentStream, Namespace, QueryOptions, WriteOp};
use bson::{doc, Bson, Document};
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Server code for a missing namespace.
pub const NAMESPACE_NOT_FOUND: i32 = 26;

/// Outcome of syncing one collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FullSyncReport {
    pub collection: String,
    /// Documents written to the destination.
    pub documents: u64,
    /// Bulk writes issued.
    pub batches: u64,
    /// Index definitions copied.
    pub indexes: usize,
    pub duration: Duration,
}

/// Copies collections from source to destination.
pub struct FullSyncRunner<S: DocumentStore, D: DocumentStore> {
    source: Arc<S>,
    dest: Arc<D>,
    config: Arc<ReplicatorConfig>,
    codecs: Arc<CodecRegistry>,
}

impl<S: DocumentStore, D: DocumentStore> FullSyncRunner<S, D> {
    pub fn new(
        source: Arc<S>,
        dest: Arc<D>,
        config: Arc<ReplicatorConfig>,
        codecs: Arc<CodecRegistry>,
    ) -> Self {
        Self {
            source,
            dest,
            config,
            codecs,
        }
    }

    /// Sync one collection.
    ///
    /// Returns [`ReplicationError::Shutdown`] if shutdown is requested
    /// before the collection is done.
    pub async fn run(
        &self,
        spec: &CollectionSpec,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<FullSyncReport> {
        let start = Instant::now();
        let namespace = self.config.namespace(&spec.name);
        let codec = self.codecs.require(&spec.name)?;

        info!(namespace = %namespace, "Starting full sync");

        let mut stream = tokio::select! {
            biased;
            _ = shutdown_requested(shutdown_rx) => return Err(ReplicationError::Shutdown),
            opened = self.source.query(&namespace, spec.filter.clone(), QueryOptions::natural()) => {
                opened.map_err(|e| ReplicationError::store("find", e))?
            }
        };

        let mut writer = BulkWriter::new(Arc::clone(&self.dest), namespace.clone(), self.config.flush_count);
        let mut documents: u64 = 0;

        loop {
            let finished = tokio::select! {
                biased;
                _ = shutdown_requested(shutdown_rx) => return Err(ReplicationError::Shutdown),
                step = copy_next(&mut stream, &mut writer, codec.as_ref(), &mut documents) => step?,
            };
            if finished {
                break;
            }
        }

        // Final partial batch
        if !writer.is_empty() {
            let flushed = tokio::select! {
                biased;
                _ = shutdown_requested(shutdown_rx) => return Err(ReplicationError::Shutdown),
                flushed = writer.flush() => flushed?,
            };
            metrics::record_documents_copied(&namespace.collection, flushed.ops);
            info!(namespace = %namespace, batch_size = flushed.ops, documents, "Flushed final batch");
        }

        let indexes = tokio::select! {
            biased;
            _ = shutdown_requested(shutdown_rx) => return Err(ReplicationError::Shutdown),
            copied = self.copy_indexes(&namespace) => copied?,
        };

        let report = FullSyncReport {
            collection: spec.name.clone(),
            documents,
            batches: writer.batches_flushed(),
            indexes,
            duration: start.elapsed(),
        };

        metrics::record_full_sync_complete(&spec.name, report.documents, report.batches, report.duration);
        info!(
            namespace = %namespace,
            documents = report.documents,
            batches = report.batches,
            indexes = report.indexes,
            duration_ms = report.duration.as_millis() as u64,
            "Full sync complete"
        );
        Ok(report)
    }

    /// Copy index definitions of `namespace` from source to destination.
    ///
    /// Returns how many definitions were sent.
    pub async fn copy_indexes(&self, namespace: &Namespace) -> Result<usize> {
        let list = doc! { "listIndexes": namespace.collection.clone() };
        let reply = match self.source.run_command(&namespace.database, list).await {
            Ok(reply) => reply,
            Err(e) if e.code == Some(NAMESPACE_NOT_FOUND) => {
                warn!(namespace = %namespace, "Source collection does not exist, no indexes to copy");
                return Ok(0);
            }
            Err(e) => return Err(ReplicationError::store("listIndexes", e)),
        };

        let indexes = index_definitions(&reply)?;
        if indexes.is_empty() {
            debug!(namespace = %namespace, "No indexes to copy");
            return Ok(0);
        }

        let count = indexes.len();
        let create = doc! {
            "createIndexes": namespace.collection.clone(),
            "indexes": indexes.into_iter().map(Bson::Document).collect::<Vec<_>>(),
        };
        self.dest
            .run_command(&namespace.database, create)
            .await
            .map_err(|e| ReplicationError::store("createIndexes", e))?;

        metrics::record_indexes_copied(&namespace.collection, count);
        info!(namespace = %namespace, count, "Copied indexes");
        Ok(count)
    }
}

/// Read one document and queue it. `Ok(true)` once the cursor is exhausted.
async fn copy_next<D: DocumentStore>(
    stream: &mut DocumentStream,
    writer: &mut BulkWriter<D>,
    codec: &dyn DocumentCodec,
    documents: &mut u64,
) -> Result<bool> {
    match stream.next().await {
        Some(Ok(document)) => {
            let encoded = codec.encode(document)?;
            *documents += 1;
            if let Some(flushed) = writer.push(WriteOp::Insert(encoded)).await? {
                metrics::record_documents_copied(&writer.namespace().collection, flushed.ops);
                info!(
                    namespace = %writer.namespace(),
                    batch_size = flushed.ops,
                    documents = *documents,
                    "Flushed batch"
                );
            }
            Ok(false)
        }
        Some(Err(e)) => Err(ReplicationError::store("find", e)),
        None => Ok(true),
    }
}

/// Index definitions from a `listIndexes` reply, without the legacy `ns` field.
pub fn index_definitions(reply: &Document) -> Result<Vec<Document>> {
    let batch = reply
        .get_document("cursor")
        .and_then(|c| c.get_array("firstBatch"))
        .map_err(|e| ReplicationError::Internal(format!("malformed listIndexes reply: {}", e)))?;

    Ok(batch
        .iter()
        .filter_map(Bson::as_document)
        .map(|d| {
            let mut d = d.clone();
            d.remove("ns");
            d
        })
        .collect())
}
