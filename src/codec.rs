//! Document transformation applied between source and destination.
//!
//! Every replicated document passes through the [`DocumentCodec`] registered
//! for its collection. The engine treats the codec as opaque: it hands over
//! a raw source document and writes whatever comes back.
//!
//! Collections may declare field transforms in configuration:
//!
//! ```json
//! { "name": "user_v2", "fields": [[["e", "m"], "security"]] }
//! ```
//!
//! meaning "apply the `security` transform to fields `e` and `m`". The
//! transforms themselves (and the key material they need, see
//! [`SecretSource`]) live outside this crate and are plugged in through a
//! [`CodecFactory`]. The bundled [`PassthroughCodecFactory`] only handles
//! collections without field transforms.

use crate::config::{CollectionSpec, ReplicatorConfig};
use crate::error::{ReplicationError, Result};
use bson::Document;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Transforms one document on its way to the destination.
pub trait DocumentCodec: Send + Sync {
    fn encode(&self, document: Document) -> Result<Document>;
}

/// Returns documents unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityCodec;

impl DocumentCodec for IdentityCodec {
    fn encode(&self, document: Document) -> Result<Document> {
        Ok(document)
    }
}

/// One field-transform directive: apply `kind` to each of `fields`.
///
/// Serialized as a two-element array `[[field, ...], kind]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(Vec<String>, String)", into = "(Vec<String>, String)")]
pub struct FieldTransform {
    pub fields: Vec<String>,
    pub kind: String,
}

impl From<(Vec<String>, String)> for FieldTransform {
    fn from((fields, kind): (Vec<String>, String)) -> Self {
        Self { fields, kind }
    }
}

impl From<FieldTransform> for (Vec<String>, String) {
    fn from(t: FieldTransform) -> Self {
        (t.fields, t.kind)
    }
}

/// Where transform key material comes from.
#[derive(Clone, PartialEq, Eq)]
pub enum SecretSource {
    /// A literal secret (from `DEBUG_SECRET_KEY`).
    Fixed(String),
    /// A remote secret service.
    Remote { host: String, key_name: String },
}

impl SecretSource {
    /// Environment variable that overrides the remote secret service.
    pub const ENV_OVERRIDE: &'static str = "DEBUG_SECRET_KEY";

    /// Pick a secret source: a non-empty override wins, then the configured
    /// remote service. `None` if neither is available.
    pub fn resolve(env_override: Option<String>, config: &ReplicatorConfig) -> Option<Self> {
        if let Some(secret) = env_override.filter(|s| !s.is_empty()) {
            return Some(Self::Fixed(secret));
        }
        match (&config.secret_host, &config.secret_key_name) {
            (Some(host), Some(key_name)) => Some(Self::Remote {
                host: host.clone(),
                key_name: key_name.clone(),
            }),
            _ => None,
        }
    }

    /// [`resolve`](Self::resolve) reading the override from the process environment.
    pub fn from_env(config: &ReplicatorConfig) -> Option<Self> {
        Self::resolve(std::env::var(Self::ENV_OVERRIDE).ok(), config)
    }
}

impl fmt::Debug for SecretSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(_) => f.write_str("Fixed(<redacted>)"),
            Self::Remote { host, key_name } => f
                .debug_struct("Remote")
                .field("host", host)
                .field("key_name", key_name)
                .finish(),
        }
    }
}

/// Builds the codec for one collection.
pub trait CodecFactory {
    fn build(
        &self,
        spec: &CollectionSpec,
        secret: Option<&SecretSource>,
    ) -> Result<Arc<dyn DocumentCodec>>;
}

/// Factory for deployments without field transforms.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughCodecFactory;

impl CodecFactory for PassthroughCodecFactory {
    fn build(
        &self,
        spec: &CollectionSpec,
        _secret: Option<&SecretSource>,
    ) -> Result<Arc<dyn DocumentCodec>> {
        if let Some(transform) = spec.fields.first() {
            return Err(ReplicationError::Config(format!(
                "collection {} declares a '{}' field transform but no transform codec is installed",
                spec.name, transform.kind
            )));
        }
        Ok(Arc::new(IdentityCodec))
    }
}

/// Codec per configured collection.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    codecs: HashMap<String, Arc<dyn DocumentCodec>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one codec per configured collection.
    ///
    /// Collections with field transforms need a secret source.
    pub fn build(
        config: &ReplicatorConfig,
        factory: &dyn CodecFactory,
        secret: Option<&SecretSource>,
    ) -> Result<Self> {
        let mut registry = Self::new();
        for spec in &config.collections {
            if !spec.fields.is_empty() && secret.is_none() {
                return Err(ReplicationError::Config(format!(
                    "collection {} declares field transforms but no secret source is configured \
                     (set secretHost/secretKeyName or {})",
                    spec.name,
                    SecretSource::ENV_OVERRIDE
                )));
            }
            let codec = factory.build(spec, secret)?;
            debug!(collection = %spec.name, transforms = spec.fields.len(), "Codec ready");
            registry.insert(spec.name.clone(), codec);
        }
        Ok(registry)
    }

    /// Identity codec for every configured collection.
    pub fn identity(config: &ReplicatorConfig) -> Self {
        let mut registry = Self::new();
        for spec in &config.collections {
            registry.insert(spec.name.clone(), Arc::new(IdentityCodec));
        }
        registry
    }

    pub fn insert(&mut self, collection: impl Into<String>, codec: Arc<dyn DocumentCodec>) {
        self.codecs.insert(collection.into(), codec);
    }

    pub fn get(&self, collection: &str) -> Option<&Arc<dyn DocumentCodec>> {
        self.codecs.get(collection)
    }

    /// Codec for `collection`, or a configuration error if none is registered.
    pub fn require(&self, collection: &str) -> Result<Arc<dyn DocumentCodec>> {
        self.get(collection).cloned().ok_or_else(|| {
            ReplicationError::Config(format!("no codec registered for collection {}", collection))
        })
    }

    pub fn contains(&self, collection: &str) -> bool {
        self.codecs.contains_key(collection)
    }

    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.codecs.keys().collect();
        names.sort();
        f.debug_struct("CodecRegistry").field("collections", &names).finish()
    }
}
