// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change-log entries and their mapping to destination writes.
//!
//! The source's change log (`local.oplog.rs` on a replica set) is a capped
//! collection of entries shaped like:
//!
//! ```text
//! { ts: Timestamp(1700000000, 3), op: "u", ns: "usercenter.user_v2",
//!   o2: { _id: 7 }, o: { _id: 7, name: "x" }, fromMigrate: false }
//! ```
//!
//! | `op` | Meaning | Destination write |
//! |------|---------|-------------------|
//! | `i` | insert | insert(encode(o)) |
//! | `u` | update | update(o2, encode(o)) |
//! | `d` | delete | delete(o), untransformed |
//! | other | no-op, command, ... | none |
//!
//! Updates are applied as whatever `o` holds: a full replacement document
//! or an operator document such as `{ $set: {...} }`. The store decides.

use crate::checkpoint::LogicalTime;
use crate::codec::DocumentCodec;
use crate::error::{ReplicationError, Result};
use crate::store::{Namespace, WriteOp};
use bson::{Bson, Document};
use std::fmt;

/// Change-log operation type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
    /// Any other entry (`n` no-op, `c` command, ...). Never applied.
    Other(String),
}

impl ChangeOp {
    fn from_code(code: &str) -> Self {
        match code {
            "i" => ChangeOp::Insert,
            "u" => ChangeOp::Update,
            "d" => ChangeOp::Delete,
            other => ChangeOp::Other(other.to_string()),
        }
    }

    /// The one-letter code as it appears in the change log.
    pub fn code(&self) -> &str {
        match self {
            ChangeOp::Insert => "i",
            ChangeOp::Update => "u",
            ChangeOp::Delete => "d",
            ChangeOp::Other(code) => code,
        }
    }
}

impl fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A parsed change-log entry.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// Raw `ns` field (`"db.collection"`).
    pub namespace: String,
    pub op: ChangeOp,
    /// `o`: the inserted document, the update body, or the delete key.
    pub document: Document,
    /// `o2` for updates, `o` for deletes.
    pub match_key: Option<Document>,
    /// `ts`: position in the change log.
    pub timestamp: LogicalTime,
    /// Entry was written by an internal chunk migration, not by a client.
    pub from_migrate: bool,
    raw: Document,
}

fn parse_err(field: &str, raw: &Document, e: impl fmt::Display) -> ReplicationError {
    let ts = raw
        .get_timestamp("ts")
        .map(|t| LogicalTime::from(t).to_string())
        .unwrap_or_else(|_| "unknown ts".to_string());
    ReplicationError::ChangeLogParse(format!("{} ({}): {}", field, ts, e))
}

impl ChangeEvent {
    /// Parse a raw change-log entry.
    pub fn from_document(raw: Document) -> Result<Self> {
        let timestamp = raw.get_timestamp("ts").map_err(|e| parse_err("ts", &raw, e))?.into();
        let namespace = raw.get_str("ns").map_err(|e| parse_err("ns", &raw, e))?.to_string();
        let op = ChangeOp::from_code(raw.get_str("op").map_err(|e| parse_err("op", &raw, e))?);
        let from_migrate = matches!(raw.get("fromMigrate"), Some(Bson::Boolean(true)));

        let document = match (&op, raw.get_document("o")) {
            (_, Ok(o)) => o.clone(),
            (ChangeOp::Other(_), Err(_)) => Document::new(),
            (_, Err(e)) => return Err(parse_err("o", &raw, e)),
        };

        let match_key = match op {
            ChangeOp::Update => Some(
                raw.get_document("o2")
                    .map_err(|e| parse_err("o2", &raw, e))?
                    .clone(),
            ),
            ChangeOp::Delete => Some(document.clone()),
            _ => None,
        };

        Ok(Self {
            namespace,
            op,
            document,
            match_key,
            timestamp,
            from_migrate,
            raw,
        })
    }

    /// Split the namespace at the first dot, `None` if malformed.
    pub fn split_namespace(&self) -> Option<Namespace> {
        Namespace::parse(&self.namespace)
    }

    /// The single destination write this event maps to, `None` for entries
    /// that are never applied.
    pub fn to_write(&self, codec: &dyn DocumentCodec) -> Result<Option<WriteOp>> {
        let write = match self.op {
            ChangeOp::Insert => WriteOp::Insert(codec.encode(self.document.clone())?),
            ChangeOp::Update => WriteOp::Update {
                filter: self.match_key.clone().unwrap_or_default(),
                replacement: codec.encode(self.document.clone())?,
            },
            ChangeOp::Delete => WriteOp::Delete {
                filter: self.document.clone(),
            },
            ChangeOp::Other(_) => return Ok(None),
        };
        Ok(Some(write))
    }

    /// The raw entry as relaxed extended JSON, for logs.
    pub fn to_json(&self) -> String {
        Bson::Document(self.raw.clone()).into_relaxed_extjson().to_string()
    }

    pub fn raw(&self) -> &Document {
        &self.raw
    }
}
