// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Checkpoint persistence for change-log positions.
//!
//! Two files, both holding a single [`LogicalTime`] as JSON:
//!
//! | File | Written | Meaning |
//! |------|---------|---------|
//! | `<timestampFile>` | once per run, before full sync | resume point (start anchor) |
//! | `<timestampFile>.end` | on clean shutdown | last change event fully processed |
//!
//! The resume point is never moved backward: if the file already holds a
//! later time than the one being recorded, the later time is kept.
//!
//! ## Semantics
//!
//! ```text
//! anchor = now ─► write resume file ─► full sync ─► tail (ts > anchor)
//!                                                    │
//!                        SIGTERM ─► write .end = last completed ts
//! ```
//!
//! A crash never writes `.end`, so the only persisted point is the older
//! anchor. Replaying from it re-applies events (at-least-once).
//!
//! ## Atomic Writes
//!
//! Each write goes to `<file>.tmp` and is renamed into place, so a reader
//! never sees a half-written file. Transient I/O errors are retried with
//! capped exponential backoff.

use crate::error::{ReplicationError, Result};
use bson::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const CHECKPOINT_RETRY_MAX_ATTEMPTS: u32 = 5;
const CHECKPOINT_RETRY_BASE_DELAY_MS: u64 = 10;
const CHECKPOINT_RETRY_MAX_DELAY_MS: u64 = 500;

/// A position in the change log.
///
/// Ordered by `seconds`, then by `ordinal` within the same second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct LogicalTime {
    /// Seconds since the Unix epoch.
    pub seconds: u32,
    /// Ordinal of the operation within that second.
    pub ordinal: u32,
}

impl LogicalTime {
    pub const fn new(seconds: u32, ordinal: u32) -> Self {
        Self { seconds, ordinal }
    }

    /// Wall clock now, ordinal 0.
    ///
    /// Any event logged during the current second with a non-zero ordinal
    /// sorts after this value.
    pub fn now() -> Self {
        let secs = chrono::Utc::now().timestamp().clamp(0, u32::MAX as i64) as u32;
        Self::new(secs, 0)
    }

    /// Seconds between this time and the wall clock (0 if in the future).
    pub fn lag_seconds(&self) -> f64 {
        let now = chrono::Utc::now().timestamp();
        (now - self.seconds as i64).max(0) as f64
    }
}

impl From<Timestamp> for LogicalTime {
    fn from(ts: Timestamp) -> Self {
        Self::new(ts.time, ts.increment)
    }
}

impl From<LogicalTime> for Timestamp {
    fn from(t: LogicalTime) -> Self {
        Timestamp {
            time: t.seconds,
            increment: t.ordinal,
        }
    }
}

impl fmt::Display for LogicalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}, {})", self.seconds, self.ordinal)
    }
}

/// I/O errors worth another attempt.
fn is_transient_io_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Run an I/O operation, retrying transient failures.
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> io::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = io::Result<T>>,
{
    let mut attempts = 0;
    let mut delay_ms = CHECKPOINT_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "Checkpoint I/O succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_transient_io_error(&e) && attempts < CHECKPOINT_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = CHECKPOINT_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    error = %e,
                    "Checkpoint I/O failed, retrying"
                );
                crate::metrics::checkpoint_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(CHECKPOINT_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

async fn write_replace(path: &Path, tmp: &Path, body: &[u8]) -> io::Result<()> {
    tokio::fs::write(tmp, body).await?;
    tokio::fs::rename(tmp, path).await
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// File-backed checkpoint store.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    resume_path: PathBuf,
    shutdown_path: PathBuf,
}

impl CheckpointStore {
    /// Checkpoint store rooted at `path`; the shutdown marker lives at `<path>.end`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        let resume_path = path.as_ref().to_path_buf();
        let shutdown_path = with_suffix(&resume_path, ".end");
        Self {
            resume_path,
            shutdown_path,
        }
    }

    pub fn resume_path(&self) -> &Path {
        &self.resume_path
    }

    pub fn shutdown_path(&self) -> &Path {
        &self.shutdown_path
    }

    /// Load the resume point, `None` if never written.
    pub async fn load_resume(&self) -> Result<Option<LogicalTime>> {
        read_point(&self.resume_path).await
    }

    /// Load the shutdown marker, `None` if never written.
    pub async fn load_shutdown(&self) -> Result<Option<LogicalTime>> {
        read_point(&self.shutdown_path).await
    }

    /// Persist the start anchor as the resume point.
    ///
    /// Returns the value the resume file holds afterwards: `anchor`, or the
    /// already persisted value if that one is later.
    pub async fn record_start(&self, anchor: LogicalTime) -> Result<LogicalTime> {
        let previous = match self.load_resume().await {
            Ok(previous) => previous,
            Err(ReplicationError::CheckpointFormat { path, message }) => {
                warn!(%path, error = %message, "Resume file is unreadable, overwriting it");
                None
            }
            Err(e) => return Err(e),
        };

        if let Some(previous) = previous {
            if previous > anchor {
                warn!(
                    path = %self.resume_path.display(),
                    %previous,
                    %anchor,
                    "Persisted resume point is ahead of the new anchor, keeping it"
                );
                return Ok(previous);
            }
            info!(%previous, "Previous resume point found (not resuming from it)");
        }

        let result = write_point(&self.resume_path, anchor).await;
        crate::metrics::record_checkpoint_write("start", result.is_ok());
        result?;

        info!(path = %self.resume_path.display(), %anchor, "Recorded start checkpoint");
        Ok(anchor)
    }

    /// Persist the shutdown marker. The resume file is not touched.
    pub async fn record_shutdown(&self, position: LogicalTime) -> Result<()> {
        let result = write_point(&self.shutdown_path, position).await;
        crate::metrics::record_checkpoint_write("shutdown", result.is_ok());
        result?;

        info!(path = %self.shutdown_path.display(), %position, "Recorded shutdown checkpoint");
        Ok(())
    }
}

async fn read_point(path: &Path) -> Result<Option<LogicalTime>> {
    let path_str = path.display().to_string();
    let bytes = match execute_with_retry("checkpoint_read", || tokio::fs::read(path)).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ReplicationError::checkpoint(path_str, e)),
    };

    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| ReplicationError::CheckpointFormat {
            path: path_str,
            message: e.to_string(),
        })
}

async fn write_point(path: &Path, point: LogicalTime) -> Result<()> {
    let body = serde_json::to_vec(&point)
        .map_err(|e| ReplicationError::Internal(format!("Failed to encode checkpoint: {}", e)))?;
    let tmp = with_suffix(path, ".tmp");

    execute_with_retry("checkpoint_write", || write_replace(path, &tmp, &body))
        .await
        .map_err(|e| ReplicationError::checkpoint(path.display().to_string(), e))
}
