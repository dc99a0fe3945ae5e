//! Configuration for the replicator.
//!
//! Configuration is loaded once at startup, validated, wrapped in an `Arc`
//! and handed to every component. Nothing mutates it afterwards.
//!
//! # Quick Start
//!
//! ```rust
//! use oplog_replicator::config::ReplicatorConfig;
//!
//! let config = ReplicatorConfig::for_testing("usercenter", &["user_v2"]);
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicatorConfig
//! ├── sourceURI: String            # Source store connection string
//! ├── destURI: String              # Destination store connection string
//! ├── db: String                   # Database replicated on both sides
//! ├── flushCount: usize            # Bulk write threshold (default 10000)
//! ├── secretHost / secretKeyName   # Remote secret service (field transforms)
//! ├── timestampFile: path          # Checkpoint file (default "timestamp.bin")
//! ├── collections: [CollectionSpec]
//! │   ├── name
//! │   ├── filter                   # Source-side query filter
//! │   └── fields                   # [[["e","m"], "security"], ...]
//! └── tailer: TailerSettings
//!     ├── progressEvery            # Progress log interval in events (default 5)
//!     ├── awaitTimeout             # Tail await per read (default "1s")
//!     └── changeLogNamespace       # Default "local.oplog.rs"
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "sourceURI": "mongodb://src:27017/?replicaSet=rs0",
//!   "destURI": "mongodb://dst:27017",
//!   "db": "usercenter",
//!   "flushCount": 10000,
//!   "collections": [
//!     { "name": "user_v2", "filter": { "deleted": false } }
//!   ]
//! }
//! ```
//!
//! TOML files use the same keys.

use crate::codec::FieldTransform;
use crate::error::{ReplicationError, Result};
use crate::store::Namespace;
use bson::Document;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReplicatorConfig {
    /// Source store connection string.
    #[serde(rename = "sourceURI")]
    pub source_uri: String,

    /// Destination store connection string.
    #[serde(rename = "destURI")]
    pub dest_uri: String,

    /// Database replicated on both sides.
    pub db: String,

    /// Number of operations accumulated before a full-sync bulk write.
    #[serde(default = "default_flush_count")]
    pub flush_count: usize,

    /// Remote secret service host (for field transforms).
    #[serde(default)]
    pub secret_host: Option<String>,

    /// Key name on the remote secret service.
    #[serde(default)]
    pub secret_key_name: Option<String>,

    /// Collections to replicate, in sync order.
    pub collections: Vec<CollectionSpec>,

    /// Checkpoint file; the shutdown marker lives at `<timestampFile>.end`.
    #[serde(default = "default_timestamp_file")]
    pub timestamp_file: PathBuf,

    #[serde(default)]
    pub tailer: TailerSettings,
}

fn default_flush_count() -> usize {
    10_000
}

fn default_timestamp_file() -> PathBuf {
    PathBuf::from("timestamp.bin")
}

impl ReplicatorConfig {
    /// Load from a `.json` or `.toml` file and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ReplicationError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;

        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&raw)?,
            Some("toml") => Self::from_toml(&raw)?,
            _ => {
                return Err(ReplicationError::Config(format!(
                    "unsupported config format for {} (expected .json or .toml)",
                    path.display()
                )))
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Parse JSON without validating.
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| ReplicationError::Config(format!("invalid JSON config: {}", e)))
    }

    /// Parse TOML without validating.
    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| ReplicationError::Config(format!("invalid TOML config: {}", e)))
    }

    /// Check everything serde cannot.
    pub fn validate(&self) -> Result<()> {
        if self.db.is_empty() {
            return Err(ReplicationError::Config("db must not be empty".into()));
        }
        if self.source_uri.is_empty() {
            return Err(ReplicationError::Config("sourceURI must not be empty".into()));
        }
        if self.dest_uri.is_empty() {
            return Err(ReplicationError::Config("destURI must not be empty".into()));
        }
        if self.flush_count == 0 {
            return Err(ReplicationError::Config("flushCount must be greater than 0".into()));
        }
        if self.secret_host.is_some() != self.secret_key_name.is_some() {
            return Err(ReplicationError::Config(
                "secretHost and secretKeyName must be set together".into(),
            ));
        }

        let mut seen = HashSet::new();
        for spec in &self.collections {
            if spec.name.is_empty() {
                return Err(ReplicationError::Config("collection name must not be empty".into()));
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(ReplicationError::Config(format!(
                    "collection {} is configured more than once",
                    spec.name
                )));
            }
            if spec.fields.iter().any(|t| t.fields.is_empty() || t.kind.is_empty()) {
                return Err(ReplicationError::Config(format!(
                    "collection {} has an empty field transform",
                    spec.name
                )));
            }
        }

        self.tailer.validate()
    }

    /// Look up a configured collection.
    pub fn collection(&self, name: &str) -> Option<&CollectionSpec> {
        self.collections.iter().find(|c| c.name == name)
    }

    /// Namespace of a collection inside the replicated database.
    pub fn namespace(&self, collection: &str) -> Namespace {
        Namespace::new(self.db.clone(), collection)
    }

    /// Create a minimal valid config for testing.
    pub fn for_testing(db: &str, collections: &[&str]) -> Self {
        Self {
            source_uri: "mongodb://source.test:27017".to_string(),
            dest_uri: "mongodb://dest.test:27017".to_string(),
            db: db.to_string(),
            flush_count: default_flush_count(),
            secret_host: None,
            secret_key_name: None,
            collections: collections.iter().map(|n| CollectionSpec::named(n)).collect(),
            timestamp_file: default_timestamp_file(),
            tailer: TailerSettings::default(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CollectionSpec: one entry per replicated collection
// ═══════════════════════════════════════════════════════════════════════════════

/// One collection to replicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollectionSpec {
    pub name: String,

    /// Source-side query filter for the full sync. Empty matches everything.
    #[serde(default)]
    pub filter: Document,

    /// Field-transform directives handed to the codec factory.
    #[serde(default)]
    pub fields: Vec<FieldTransform>,
}

impl CollectionSpec {
    /// Spec with no filter and no transforms.
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            filter: Document::new(),
            fields: Vec::new(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TailerSettings: change-log tailing
// ═══════════════════════════════════════════════════════════════════════════════

/// Change-log tailing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TailerSettings {
    /// Log progress every N change events.
    #[serde(default = "default_progress_every")]
    pub progress_every: u64,

    /// How long one tail read waits for new entries (e.g. `"1s"`).
    #[serde(default = "default_await_timeout")]
    pub await_timeout: String,

    /// Namespace of the source's change log.
    #[serde(default = "default_change_log_namespace")]
    pub change_log_namespace: String,
}

fn default_progress_every() -> u64 {
    5
}

fn default_await_timeout() -> String {
    "1s".to_string()
}

fn default_change_log_namespace() -> String {
    "local.oplog.rs".to_string()
}

impl Default for TailerSettings {
    fn default() -> Self {
        Self {
            progress_every: default_progress_every(),
            await_timeout: default_await_timeout(),
            change_log_namespace: default_change_log_namespace(),
        }
    }
}

impl TailerSettings {
    /// Parse `await_timeout`, falling back to one second.
    pub fn await_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.await_timeout).unwrap_or(Duration::from_secs(1))
    }

    /// The change log as a namespace.
    pub fn change_log(&self) -> Result<Namespace> {
        Namespace::parse(&self.change_log_namespace).ok_or_else(|| {
            ReplicationError::Config(format!(
                "tailer.changeLogNamespace '{}' is not of the form db.collection",
                self.change_log_namespace
            ))
        })
    }

    fn validate(&self) -> Result<()> {
        if self.progress_every == 0 {
            return Err(ReplicationError::Config("tailer.progressEvery must be greater than 0".into()));
        }
        match humantime::parse_duration(&self.await_timeout) {
            Ok(d) if !d.is_zero() => {}
            _ => {
                return Err(ReplicationError::Config(format!(
                    "tailer.awaitTimeout '{}' is not a positive duration",
                    self.await_timeout
                )))
            }
        }
        self.change_log().map(|_| ())
    }
}
