// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replicator.
//!
//! Errors are grouped by where they come from (a store, the checkpoint
//! file, configuration, a codec, the change log) and carry enough context
//! to be logged without the caller adding more.
//!
//! # Variants
//!
//! | Variant | Raised by | Retryable |
//! |---------|-----------|-----------|
//! | `Store` | any source/destination call (carries the server code) | yes |
//! | `Checkpoint` | reading or writing the checkpoint file | no |
//! | `CheckpointFormat` | a checkpoint file that does not decode | no |
//! | `Config` | loading or validating configuration | no |
//! | `Codec` | a collection codec rejecting a document | no |
//! | `ChangeLogParse` | a change-log entry missing `ts`/`ns`/`op`/`o`/`o2` | no |
//! | `InvalidState` | calling `run` on a replicator that already ran | no |
//! | `Shutdown` | a phase noticing the shutdown signal | no |
//! | `Internal` | malformed server replies, encoding bugs | no |
//!
//! # Fatal vs. Dropped
//!
//! During full sync every error is fatal. During tailing, errors raised
//! while *applying* one event are logged and the event is dropped; errors
//! raised while *reading* the change log are fatal. The tailer decides this
//! by where the error came from, not by its variant.

use crate::store::StoreError;
use thiserror::Error;

/// Shorthand used throughout the crate.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Everything that can go wrong while replicating.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// A source or destination store call failed.
    ///
    /// `operation` names the call (`find`, `bulkWrite`, `listIndexes`, ...).
    #[error("Store error ({operation}): {source}")]
    Store {
        operation: String,
        #[source]
        source: StoreError,
    },

    /// Reading or writing the checkpoint file failed.
    #[error("Checkpoint error ({path}): {source}")]
    Checkpoint {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The checkpoint file exists but does not hold a logical time.
    #[error("Checkpoint file {path} is malformed: {message}")]
    CheckpointFormat { path: String, message: String },

    /// Rejected configuration. The message names the offending key.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A Transform Codec rejected a document.
    #[error("Codec error ({collection}): {message}")]
    Codec { collection: String, message: String },

    /// A change-log entry is missing fields or has the wrong types.
    #[error("Change log parse error: {0}")]
    ChangeLogParse(String),

    /// The replicator is not in a state that allows the call
    /// (a second `run`, for instance).
    #[error("Replicator is {actual}, expected {expected}")]
    InvalidState { expected: String, actual: String },

    /// A termination signal was observed.
    ///
    /// Returned by long-running phases so the caller can run the
    /// shutdown routine instead of treating it as a failure.
    #[error("Shutdown requested")]
    Shutdown,

    /// Something that should not happen: an unexpected reply shape, a
    /// value that failed to serialize.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Wrap a store error with the name of the failing operation.
    pub fn store(operation: impl Into<String>, source: StoreError) -> Self {
        Self::Store {
            operation: operation.into(),
            source,
        }
    }

    /// Wrap a checkpoint I/O error with the file path.
    pub fn checkpoint(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Checkpoint {
            path: path.into(),
            source,
        }
    }

    /// Server error code, when the failure came from a store reply.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Store { source, .. } => source.code,
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store { .. } => true,
            Self::Checkpoint { .. } => false,
            Self::CheckpointFormat { .. } => false,
            Self::Config(_) => false,
            Self::Codec { .. } => false,
            Self::ChangeLogParse(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Check if this is the shutdown marker rather than a real failure.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }
}
