//! In-memory DocumentStore for testing.
//!
//! Behaves like a small single-node server: collections keep insertion
//! order, `_id` is unique (code 11000), bulk writes are all-or-nothing and
//! `listIndexes`/`createIndexes` are understood. The change log is a channel
//! fed by the test and read through a tailable query.
//!
//! Every bulk write and command is recorded for assertions, and failures can
//! be injected on the read path, the write path and per `_id`.

#![allow(dead_code)]

use bson::{doc, Bson, Document};
use futures::channel::mpsc;
use futures::StreamExt;
use oplog_replicator::checkpoint::LogicalTime;
use oplog_replicator::store::{
    BoxFuture, DocumentStore, DocumentStream, Namespace, QueryOptions, StoreError, WriteAck, WriteOp,
};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

pub const DUPLICATE_KEY: i32 = 11000;
pub const NAMESPACE_NOT_FOUND: i32 = 26;
pub const COMMAND_NOT_FOUND: i32 = 59;
pub const VALIDATION_FAILED: i32 = 121;

/// A recorded bulk write.
#[derive(Debug, Clone)]
pub struct BatchCall {
    pub namespace: String,
    pub ops: Vec<WriteOp>,
    pub succeeded: bool,
}

/// A recorded command.
#[derive(Debug, Clone)]
pub struct CommandCall {
    pub database: String,
    pub command: Document,
}

/// Documents in insertion order plus an `_id` index.
#[derive(Default, Clone)]
struct Collection {
    docs: Vec<Document>,
    ids: HashSet<String>,
}

/// Hashable form of an `_id`; keeps the BSON type so `1` and `1_i64` differ.
fn id_key(id: &Bson) -> String {
    format!("{:?}", id)
}

impl Collection {
    fn extend(&mut self, docs: impl IntoIterator<Item = Document>) {
        for d in docs {
            if let Some(id) = d.get("_id") {
                self.ids.insert(id_key(id));
            }
            self.docs.push(d);
        }
    }

    /// Apply `ops` in order, all or nothing.
    fn apply(&mut self, ops: &[WriteOp]) -> Result<WriteAck, StoreError> {
        if ops.iter().all(|op| matches!(op, WriteOp::Insert(_))) {
            return self.insert_all(ops);
        }
        // Mixed batches are small (tailing); stage on a copy.
        let mut staged = self.clone();
        let ack = staged.apply_in_place(ops)?;
        *self = staged;
        Ok(ack)
    }

    fn insert_all(&mut self, ops: &[WriteOp]) -> Result<WriteAck, StoreError> {
        let mut batch_ids = HashSet::new();
        for op in ops {
            if let WriteOp::Insert(d) = op {
                if let Some(id) = d.get("_id") {
                    let key = id_key(id);
                    if self.ids.contains(&key) || !batch_ids.insert(key) {
                        return Err(duplicate_key(id));
                    }
                }
            }
        }
        let docs = ops.iter().filter_map(|op| match op {
            WriteOp::Insert(d) => Some(d.clone()),
            _ => None,
        });
        self.extend(docs);
        Ok(WriteAck {
            inserted: ops.len() as u64,
            ..WriteAck::default()
        })
    }

    fn apply_in_place(&mut self, ops: &[WriteOp]) -> Result<WriteAck, StoreError> {
        let mut ack = WriteAck::default();
        for op in ops {
            match op {
                WriteOp::Insert(d) => {
                    if let Some(id) = d.get("_id") {
                        if !self.ids.insert(id_key(id)) {
                            return Err(duplicate_key(id));
                        }
                    }
                    self.docs.push(d.clone());
                    ack.inserted += 1;
                }
                WriteOp::Update { filter, replacement } => {
                    if let Some(target) = self.docs.iter_mut().find(|d| matches(d, filter)) {
                        apply_update(target, replacement)?;
                        ack.matched += 1;
                    }
                }
                WriteOp::Delete { filter } => {
                    if let Some(pos) = self.docs.iter().position(|d| matches(d, filter)) {
                        let removed = self.docs.remove(pos);
                        if let Some(id) = removed.get("_id") {
                            self.ids.remove(&id_key(id));
                        }
                        ack.deleted += 1;
                    }
                }
            }
        }
        Ok(ack)
    }
}

fn duplicate_key(id: &Bson) -> StoreError {
    StoreError::with_code(
        DUPLICATE_KEY,
        format!("E11000 duplicate key error dup key: {{ _id: {} }}", id),
    )
}

#[derive(Default)]
struct State {
    collections: HashMap<String, Collection>,
    indexes: HashMap<String, Vec<Document>>,
    batches: Vec<BatchCall>,
    commands: Vec<CommandCall>,
    queries: Vec<(String, Document, QueryOptions)>,

    // Failure injection
    fail_writes: Option<StoreError>,
    fail_writes_after: Option<usize>,
    reject_ids: Vec<Bson>,
    fail_query: Option<StoreError>,
    fail_stream_after: Option<(usize, StoreError)>,
    fail_commands: Option<StoreError>,
}

/// In-memory store, usable as source and destination.
pub struct MemoryStore {
    state: Mutex<State>,
    change_log_tx: Mutex<Option<mpsc::UnboundedSender<Document>>>,
    change_log_rx: Mutex<Option<mpsc::UnboundedReceiver<Document>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded();
        Self {
            state: Mutex::new(State::default()),
            change_log_tx: Mutex::new(Some(tx)),
            change_log_rx: Mutex::new(Some(rx)),
        }
    }

    // =========================================================================
    // Seeding
    // =========================================================================

    /// Append documents to a collection, bypassing the write path.
    pub fn seed(&self, namespace: &Namespace, docs: impl IntoIterator<Item = Document>) {
        let mut state = self.state.lock().unwrap();
        state.collections.entry(namespace.to_string()).or_default().extend(docs);
    }

    /// `count` documents `{_id: i, n: i}` for `i` in `0..count`.
    pub fn seed_numbered(&self, namespace: &Namespace, count: i64) {
        self.seed(namespace, (0..count).map(|i| doc! { "_id": i, "n": i }));
    }

    /// Create an empty collection (so `listIndexes` succeeds on it).
    pub fn create_collection(&self, namespace: &Namespace) {
        self.seed(namespace, std::iter::empty());
    }

    /// Declare a secondary index on a collection.
    pub fn add_index(&self, namespace: &Namespace, index: Document) {
        let mut state = self.state.lock().unwrap();
        state.collections.entry(namespace.to_string()).or_default();
        state.indexes.entry(namespace.to_string()).or_default().push(index);
    }

    /// Append a raw change-log entry. Readable by a tailable query opened
    /// before or after the call.
    pub fn push_change(&self, entry: Document) {
        if let Some(tx) = self.change_log_tx.lock().unwrap().as_ref() {
            let _ = tx.unbounded_send(entry);
        }
    }

    /// Close the change log: a running tailable cursor ends.
    pub fn close_change_log(&self) {
        self.change_log_tx.lock().unwrap().take();
    }

    // =========================================================================
    // Failure injection
    // =========================================================================

    /// Every bulk write fails with `error`.
    pub fn fail_writes(&self, error: StoreError) {
        self.state.lock().unwrap().fail_writes = Some(error);
    }

    /// Stop failing bulk writes.
    pub fn heal_writes(&self) {
        let mut state = self.state.lock().unwrap();
        state.fail_writes = None;
        state.fail_writes_after = None;
    }

    /// Bulk writes fail once `n` have succeeded.
    pub fn fail_writes_after(&self, n: usize) {
        self.state.lock().unwrap().fail_writes_after = Some(n);
    }

    /// Any batch touching a document with this `_id` fails validation.
    pub fn reject_id(&self, id: impl Into<Bson>) {
        self.state.lock().unwrap().reject_ids.push(id.into());
    }

    /// Opening any query fails.
    pub fn fail_queries(&self, error: StoreError) {
        self.state.lock().unwrap().fail_query = Some(error);
    }

    /// Finite queries yield `n` documents, then `error`.
    pub fn fail_stream_after(&self, n: usize, error: StoreError) {
        self.state.lock().unwrap().fail_stream_after = Some((n, error));
    }

    /// Every command fails.
    pub fn fail_commands(&self, error: StoreError) {
        self.state.lock().unwrap().fail_commands = Some(error);
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn documents(&self, namespace: &Namespace) -> Vec<Document> {
        let state = self.state.lock().unwrap();
        state
            .collections
            .get(&namespace.to_string())
            .map(|c| c.docs.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, namespace: &Namespace) -> usize {
        let state = self.state.lock().unwrap();
        state.collections.get(&namespace.to_string()).map_or(0, |c| c.docs.len())
    }

    /// Document with the given `_id`, if any.
    pub fn find_by_id(&self, namespace: &Namespace, id: impl Into<Bson>) -> Option<Document> {
        let id = id.into();
        self.documents(namespace)
            .into_iter()
            .find(|d| d.get("_id") == Some(&id))
    }

    pub fn indexes(&self, namespace: &Namespace) -> Vec<Document> {
        let state = self.state.lock().unwrap();
        state.indexes.get(&namespace.to_string()).cloned().unwrap_or_default()
    }

    /// All bulk writes, failed ones included.
    pub fn batches(&self) -> Vec<BatchCall> {
        self.state.lock().unwrap().batches.clone()
    }

    /// Sizes of the successful bulk writes against `namespace`, in order.
    pub fn batch_sizes(&self, namespace: &Namespace) -> Vec<usize> {
        let ns = namespace.to_string();
        self.batches()
            .into_iter()
            .filter(|b| b.namespace == ns && b.succeeded)
            .map(|b| b.ops.len())
            .collect()
    }

    pub fn commands(&self) -> Vec<CommandCall> {
        self.state.lock().unwrap().commands.clone()
    }

    /// Names of the commands run, in order (`"listIndexes"`, ...).
    pub fn command_names(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter_map(|c| c.command.keys().next().cloned())
            .collect()
    }

    pub fn queries(&self) -> Vec<(String, Document, QueryOptions)> {
        self.state.lock().unwrap().queries.clone()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn tail(&self, filter: &Document) -> Result<DocumentStream, StoreError> {
        let rx = self
            .change_log_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| StoreError::new("change log already tailed"))?;

        let after = filter
            .get_document("ts")
            .and_then(|ts| ts.get_timestamp("$gt"))
            .map(LogicalTime::from)
            .ok();

        let stream = rx
            .filter(move |entry| {
                let keep = match (after, entry.get_timestamp("ts")) {
                    (Some(after), Ok(ts)) => LogicalTime::from(ts) > after,
                    _ => true,
                };
                futures::future::ready(keep)
            })
            .map(Ok);
        Ok(stream.boxed())
    }

    fn scan(&self, namespace: &Namespace, filter: &Document) -> DocumentStream {
        let state = self.state.lock().unwrap();
        let matching: Vec<Document> = state
            .collections
            .get(&namespace.to_string())
            .map(|c| c.docs.iter().filter(|d| matches(d, filter)).cloned().collect())
            .unwrap_or_default();

        let mut items: Vec<Result<Document, StoreError>> = matching.into_iter().map(Ok).collect();
        if let Some((n, error)) = state.fail_stream_after.clone() {
            items.truncate(n);
            items.push(Err(error));
        }
        futures::stream::iter(items).boxed()
    }

    fn write(&self, namespace: &Namespace, ops: &[WriteOp]) -> Result<WriteAck, StoreError> {
        let mut state = self.state.lock().unwrap();
        let ns = namespace.to_string();

        let existed = state.collections.contains_key(&ns);
        let result = check_injected(&state, ops)
            .and_then(|()| state.collections.entry(ns.clone()).or_default().apply(ops));

        // A rejected write does not create the collection
        if result.is_err() && !existed {
            state.collections.remove(&ns);
        }
        state.batches.push(BatchCall {
            namespace: ns,
            ops: ops.to_vec(),
            succeeded: result.is_ok(),
        });
        result
    }

    fn command(&self, database: &str, command: Document) -> Result<Document, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.commands.push(CommandCall {
            database: database.to_string(),
            command: command.clone(),
        });
        if let Some(error) = state.fail_commands.clone() {
            return Err(error);
        }

        if let Ok(collection) = command.get_str("listIndexes") {
            let ns = format!("{}.{}", database, collection);
            if !state.collections.contains_key(&ns) {
                return Err(StoreError::with_code(
                    NAMESPACE_NOT_FOUND,
                    format!("ns does not exist: {}", ns),
                ));
            }
            let mut batch = vec![Bson::Document(doc! {
                "v": 2, "key": { "_id": 1 }, "name": "_id_", "ns": ns.clone(),
            })];
            batch.extend(
                state
                    .indexes
                    .get(&ns)
                    .into_iter()
                    .flatten()
                    .cloned()
                    .map(Bson::Document),
            );
            return Ok(doc! { "cursor": { "id": 0_i64, "ns": ns, "firstBatch": batch }, "ok": 1.0 });
        }

        if let Ok(collection) = command.get_str("createIndexes") {
            let ns = format!("{}.{}", database, collection);
            let requested = command
                .get_array("indexes")
                .map_err(|e| StoreError::with_code(2, e.to_string()))?
                .clone();
            state.collections.entry(ns.clone()).or_default();
            let existing = state.indexes.entry(ns).or_default();
            for index in requested.into_iter().filter_map(|b| b.as_document().cloned()) {
                if matches!(index.get_str("name"), Ok("_id_")) {
                    continue;
                }
                if !existing.iter().any(|e| e.get("name") == index.get("name")) {
                    existing.push(index);
                }
            }
            return Ok(doc! { "ok": 1.0 });
        }

        Err(StoreError::with_code(COMMAND_NOT_FOUND, "no such command"))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentStore for MemoryStore {
    fn query<'a>(
        &'a self,
        namespace: &'a Namespace,
        filter: Document,
        options: QueryOptions,
    ) -> BoxFuture<'a, DocumentStream> {
        Box::pin(async move {
            let injected = {
                let mut state = self.state.lock().unwrap();
                state.queries.push((namespace.to_string(), filter.clone(), options));
                state.fail_query.clone()
            };
            if let Some(error) = injected {
                return Err(error);
            }
            if options.tailable {
                self.tail(&filter)
            } else {
                Ok(self.scan(namespace, &filter))
            }
        })
    }

    fn bulk_write<'a>(&'a self, namespace: &'a Namespace, ops: &'a [WriteOp]) -> BoxFuture<'a, WriteAck> {
        Box::pin(async move { self.write(namespace, ops) })
    }

    fn run_command<'a>(&'a self, database: &'a str, command: Document) -> BoxFuture<'a, Document> {
        Box::pin(async move { self.command(database, command) })
    }
}

/// Top-level equality match. Empty filter matches everything.
fn matches(doc: &Document, filter: &Document) -> bool {
    filter.iter().all(|(k, v)| doc.get(k) == Some(v))
}

fn op_id(op: &WriteOp) -> Option<&Bson> {
    match op {
        WriteOp::Insert(d) => d.get("_id"),
        WriteOp::Update { filter, .. } => filter.get("_id"),
        WriteOp::Delete { filter } => filter.get("_id"),
    }
}

fn check_injected(state: &State, ops: &[WriteOp]) -> Result<(), StoreError> {
    if let Some(error) = &state.fail_writes {
        return Err(error.clone());
    }
    if let Some(n) = state.fail_writes_after {
        let succeeded = state.batches.iter().filter(|b| b.succeeded).count();
        if succeeded >= n {
            return Err(StoreError::new("connection reset by peer"));
        }
    }
    for op in ops {
        if let Some(id) = op_id(op) {
            if state.reject_ids.contains(id) {
                return Err(StoreError::with_code(
                    VALIDATION_FAILED,
                    format!("Document failed validation: _id {}", id),
                ));
            }
        }
    }
    Ok(())
}

/// `$set`/`$unset` operator updates, otherwise full replacement keeping `_id`.
fn apply_update(target: &mut Document, update: &Document) -> Result<(), StoreError> {
    let is_operator = update.keys().next().map_or(false, |k| k.starts_with('$'));
    if !is_operator {
        let id = target.get("_id").cloned();
        *target = update.clone();
        if let Some(id) = id {
            target.insert("_id", id);
        }
        return Ok(());
    }

    for (operator, fields) in update {
        let fields = fields
            .as_document()
            .ok_or_else(|| StoreError::with_code(9, format!("{} expects a document", operator)))?;
        match operator.as_str() {
            "$set" => {
                for (k, v) in fields {
                    target.insert(k.clone(), v.clone());
                }
            }
            "$unset" => {
                for k in fields.keys() {
                    target.remove(k);
                }
            }
            other => {
                return Err(StoreError::with_code(9, format!("Unknown modifier: {}", other)));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns() -> Namespace {
        Namespace::new("usercenter", "user_v2")
    }

    #[tokio::test]
    async fn test_insert_and_duplicate_key() {
        let store = MemoryStore::new();
        store
            .bulk_write(&ns(), &[WriteOp::Insert(doc! { "_id": 1 })])
            .await
            .unwrap();

        let err = store
            .bulk_write(&ns(), &[WriteOp::Insert(doc! { "_id": 2 }), WriteOp::Insert(doc! { "_id": 1 })])
            .await
            .unwrap_err();
        assert_eq!(err.code, Some(DUPLICATE_KEY));
        // All-or-nothing: _id 2 was not kept
        assert_eq!(store.count(&ns()), 1);
    }

    #[tokio::test]
    async fn test_duplicate_within_batch_and_reinsert_after_delete() {
        let store = MemoryStore::new();
        let err = store
            .bulk_write(&ns(), &[WriteOp::Insert(doc! { "_id": 1 }), WriteOp::Insert(doc! { "_id": 1 })])
            .await
            .unwrap_err();
        assert_eq!(err.code, Some(DUPLICATE_KEY));
        assert_eq!(store.count(&ns()), 0);

        store.seed(&ns(), [doc! { "_id": 1 }]);
        store
            .bulk_write(
                &ns(),
                &[WriteOp::Delete { filter: doc! { "_id": 1 } }, WriteOp::Insert(doc! { "_id": 1, "v": 2 })],
            )
            .await
            .unwrap();
        assert_eq!(store.documents(&ns()), vec![doc! { "_id": 1, "v": 2 }]);
    }

    #[tokio::test]
    async fn test_large_insert_batches_stay_fast() {
        let store = MemoryStore::new();
        let start = std::time::Instant::now();
        for batch in 0..5_i64 {
            let ops: Vec<WriteOp> = (batch * 10_000..(batch + 1) * 10_000)
                .map(|i| WriteOp::Insert(doc! { "_id": i }))
                .collect();
            store.bulk_write(&ns(), &ops).await.unwrap();
        }
        assert_eq!(store.count(&ns()), 50_000);
        assert!(start.elapsed() < std::time::Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_list_indexes_missing_collection() {
        let store = MemoryStore::new();
        let err = store
            .run_command("usercenter", doc! { "listIndexes": "nope" })
            .await
            .unwrap_err();
        assert_eq!(err.code, Some(NAMESPACE_NOT_FOUND));
    }

    #[tokio::test]
    async fn test_update_operator_and_replacement() {
        let store = MemoryStore::new();
        store.seed(&ns(), [doc! { "_id": 7, "name": "a", "age": 3 }]);

        store
            .bulk_write(
                &ns(),
                &[WriteOp::Update { filter: doc! { "_id": 7 }, replacement: doc! { "$set": { "age": 4 } } }],
            )
            .await
            .unwrap();
        assert_eq!(store.find_by_id(&ns(), 7).unwrap(), doc! { "_id": 7, "name": "a", "age": 4 });

        store
            .bulk_write(
                &ns(),
                &[WriteOp::Update { filter: doc! { "_id": 7 }, replacement: doc! { "_id": 7, "name": "x" } }],
            )
            .await
            .unwrap();
        assert_eq!(store.find_by_id(&ns(), 7).unwrap(), doc! { "_id": 7, "name": "x" });
    }

    #[tokio::test]
    async fn test_tail_filters_by_timestamp() {
        let store = MemoryStore::new();
        store.push_change(doc! { "ts": bson::Timestamp { time: 5, increment: 0 }, "op": "n" });
        store.push_change(doc! { "ts": bson::Timestamp { time: 15, increment: 0 }, "op": "n" });

        let oplog = Namespace::new("local", "oplog.rs");
        let filter = doc! { "ts": { "$gt": bson::Timestamp { time: 10, increment: 0 } } };
        let mut stream = store
            .query(&oplog, filter, QueryOptions::tailing(std::time::Duration::from_millis(10)))
            .await
            .unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.get_timestamp("ts").unwrap().time, 15);
    }

    #[tokio::test]
    async fn test_fail_writes_after() {
        let store = MemoryStore::new();
        store.fail_writes_after(1);
        assert!(store.bulk_write(&ns(), &[WriteOp::Insert(doc! { "_id": 1 })]).await.is_ok());
        assert!(store.bulk_write(&ns(), &[WriteOp::Insert(doc! { "_id": 2 })]).await.is_err());
        assert_eq!(store.batch_sizes(&ns()), vec![1]);
    }
}
