//! MongoDB implementation of [`DocumentStore`].
//!
//! One [`MongoStore`] per side (source and destination), each owning a
//! driver [`Client`] and its connection pool.
//!
//! # Query Mapping
//!
//! | `QueryOptions` | Driver |
//! |----------------|--------|
//! | `natural_order` | `sort: { $natural: 1 }` |
//! | `tailable` | `CursorType::TailableAwait` + `noCursorTimeout` |
//! | `max_await_time` | `maxAwaitTimeMS` on each `getMore` |
//!
//! # Bulk Writes
//!
//! Operations are applied in order. Consecutive inserts go out as one
//! ordered `insert_many` (the driver splits it to fit message size limits);
//! updates and deletes are single-document calls. The first failure stops
//! the batch and is returned with its server code.

use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::resilience::{retry_with_backoff, RetryConfig};
use crate::store::{
    BoxFuture, DocumentStore, DocumentStream, Namespace, QueryOptions, StoreError, WriteAck, WriteOp,
};
use bson::{doc, Document};
use futures::{StreamExt, TryStreamExt};
use mongodb::error::{Error as MongoError, ErrorKind, WriteFailure};
use mongodb::options::{ClientOptions, CursorType, FindOptions};
use mongodb::Client;
use tracing::{debug, info};

/// Convert a driver error, keeping the server code when there is one.
pub fn store_error(e: MongoError) -> StoreError {
    let code = match e.kind.as_ref() {
        ErrorKind::Command(c) => Some(c.code),
        ErrorKind::Write(WriteFailure::WriteError(w)) => Some(w.code),
        ErrorKind::Write(WriteFailure::WriteConcernError(w)) => Some(w.code),
        ErrorKind::BulkWrite(b) => b
            .write_errors
            .as_ref()
            .and_then(|errs| errs.first())
            .map(|w| w.code)
            .or_else(|| b.write_concern_error.as_ref().map(|w| w.code)),
        _ => None,
    };
    StoreError {
        code,
        message: e.to_string(),
    }
}

/// `true` for update bodies like `{ $set: {...} }` as opposed to replacements.
fn is_operator_document(document: &Document) -> bool {
    document.keys().next().map_or(false, |k| k.starts_with('$'))
}

/// A bulk write split into driver calls.
#[derive(Debug, PartialEq)]
enum Step<'a> {
    Inserts(Vec<&'a Document>),
    Single(&'a WriteOp),
}

fn plan(ops: &[WriteOp]) -> Vec<Step<'_>> {
    let mut steps = Vec::new();
    let mut inserts: Vec<&Document> = Vec::new();

    for op in ops {
        match op {
            WriteOp::Insert(d) => inserts.push(d),
            other => {
                if !inserts.is_empty() {
                    steps.push(Step::Inserts(std::mem::take(&mut inserts)));
                }
                steps.push(Step::Single(other));
            }
        }
    }
    if !inserts.is_empty() {
        steps.push(Step::Inserts(inserts));
    }
    steps
}

/// MongoDB-backed document store.
#[derive(Clone)]
pub struct MongoStore {
    client: Client,
    label: String,
}

impl MongoStore {
    /// Connect and verify the server answers `ping`.
    ///
    /// `label` names the side (`source`, `destination`) in logs and metrics.
    pub async fn connect(uri: &str, label: &str, retry_config: &RetryConfig) -> Result<Self> {
        let options = ClientOptions::parse(uri)
            .await
            .map_err(|e| ReplicationError::Config(format!("invalid {} URI: {}", label, e)))?;
        let hosts: Vec<String> = options.hosts.iter().map(|h| h.to_string()).collect();
        info!(side = label, ?hosts, "Connecting to store");

        let client = Client::with_options(options)
            .map_err(|e| ReplicationError::Config(format!("invalid {} client options: {}", label, e)))?;

        let result = retry_with_backoff("ping", retry_config, || {
            let client = client.clone();
            async move {
                client
                    .database("admin")
                    .run_command(doc! { "ping": 1 }, None)
                    .await
                    .map_err(store_error)
            }
        })
        .await;

        metrics::record_store_connection(label, result.is_ok());
        result?;

        info!(side = label, "Connected to store");
        Ok(Self {
            client,
            label: label.to_string(),
        })
    }

    /// Wrap an existing client without checking connectivity.
    pub fn from_client(client: Client, label: &str) -> Self {
        Self {
            client,
            label: label.to_string(),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    async fn apply(&self, namespace: &Namespace, ops: &[WriteOp]) -> std::result::Result<WriteAck, MongoError> {
        let coll = self
            .client
            .database(&namespace.database)
            .collection::<Document>(&namespace.collection);
        let mut ack = WriteAck::default();

        for step in plan(ops) {
            match step {
                Step::Inserts(docs) => {
                    let result = coll.insert_many(docs, None).await?;
                    ack.inserted += result.inserted_ids.len() as u64;
                }
                Step::Single(WriteOp::Update { filter, replacement }) => {
                    let result = if is_operator_document(replacement) {
                        coll.update_one(filter.clone(), replacement.clone(), None).await?
                    } else {
                        coll.replace_one(filter.clone(), replacement, None).await?
                    };
                    ack.matched += result.matched_count;
                }
                Step::Single(WriteOp::Delete { filter }) => {
                    let result = coll.delete_one(filter.clone(), None).await?;
                    ack.deleted += result.deleted_count;
                }
                Step::Single(WriteOp::Insert(d)) => {
                    coll.insert_one(d, None).await?;
                    ack.inserted += 1;
                }
            }
        }
        Ok(ack)
    }
}

impl DocumentStore for MongoStore {
    fn query<'a>(
        &'a self,
        namespace: &'a Namespace,
        filter: Document,
        options: QueryOptions,
    ) -> BoxFuture<'a, DocumentStream> {
        Box::pin(async move {
            let coll = self
                .client
                .database(&namespace.database)
                .collection::<Document>(&namespace.collection);

            let mut find = FindOptions::default();
            if options.natural_order {
                find.sort = Some(doc! { "$natural": 1 });
            }
            if options.tailable {
                find.cursor_type = Some(CursorType::TailableAwait);
                find.no_cursor_timeout = Some(true);
                find.max_await_time = options.max_await_time;
            }

            debug!(side = %self.label, %namespace, tailable = options.tailable, "Opening query");
            let cursor = coll.find(filter, find).await.map_err(store_error)?;
            Ok(cursor.map_err(store_error).boxed())
        })
    }

    fn bulk_write<'a>(&'a self, namespace: &'a Namespace, ops: &'a [WriteOp]) -> BoxFuture<'a, WriteAck> {
        Box::pin(async move { self.apply(namespace, ops).await.map_err(store_error) })
    }

    fn run_command<'a>(&'a self, database: &'a str, command: Document) -> BoxFuture<'a, Document> {
        Box::pin(async move {
            self.client
                .database(database)
                .run_command(command, None)
                .await
                .map_err(store_error)
        })
    }
}
