//! Retry with exponential backoff for startup connectivity.
//!
//! Replication itself never retries (a failed full-sync batch is fatal, a
//! failed tail write is dropped). The only retried step is establishing
//! that both stores answer at all, which is where transient DNS, failover
//! and container start-order problems show up.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> oplog_replicator::Result<()> {
//! use oplog_replicator::resilience::{retry_with_backoff, RetryConfig};
//! use oplog_replicator::store::StoreError;
//!
//! let answer = retry_with_backoff("ping", &RetryConfig::startup(), || async {
//!     Ok::<_, StoreError>(42)
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{ReplicationError, Result};
use crate::store::{StoreError, StoreResult};
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, warn};

/// How hard to try before declaring a store unreachable.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts including the first one.
    pub attempts: usize,
    /// Pause after the first failure.
    pub first_delay: Duration,
    /// Pauses never grow beyond this.
    pub delay_cap: Duration,
    /// Growth of the pause per failed attempt.
    pub multiplier: f64,
    /// Bound on a single attempt; a hung attempt counts as a failure.
    pub attempt_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 10,
            first_delay: Duration::from_millis(100),
            delay_cap: Duration::from_secs(30),
            multiplier: 2.0,
            attempt_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Used by the binary when connecting to source and destination.
    ///
    /// Pauses start at 500ms and grow by half each time up to 30s, so the
    /// 20 attempts span a few minutes of a store being down or restarting.
    pub fn startup() -> Self {
        Self {
            attempts: 20,
            first_delay: Duration::from_millis(500),
            delay_cap: Duration::from_secs(30),
            multiplier: 1.5,
            attempt_timeout: Duration::from_secs(10),
        }
    }

    /// Three quick attempts.
    pub fn testing() -> Self {
        Self {
            attempts: 3,
            first_delay: Duration::from_millis(10),
            delay_cap: Duration::from_millis(100),
            multiplier: 2.0,
            attempt_timeout: Duration::from_millis(500),
        }
    }

    /// Pause after failed attempt number `attempt` (1-based; 0 is treated as 1).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as usize) as i32;
        let secs = self.first_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.delay_cap.as_secs_f64() {
            return self.delay_cap;
        }
        Duration::from_secs_f64(secs)
    }
}

/// Call `f` until it returns `Ok`, bounding each call by `attempt_timeout`.
///
/// After `attempts` failures the last error is returned as a store error for
/// `operation`, keeping its server code.
pub async fn retry_with_backoff<F, Fut, T>(operation: &str, config: &RetryConfig, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        let failure = match timeout(config.attempt_timeout, f()).await {
            Ok(Ok(value)) => {
                if attempt > 1 {
                    info!(operation, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Ok(Err(e)) => e,
            Err(_) => StoreError::new(format!("timed out after {:?}", config.attempt_timeout)),
        };

        if attempt >= config.attempts {
            error!(operation, attempt, error = %failure, "Store unreachable, giving up");
            return Err(ReplicationError::store(
                operation,
                StoreError {
                    code: failure.code,
                    message: format!("failed after {} attempts: {}", attempt, failure.message),
                },
            ));
        }

        let delay = config.delay_for_attempt(attempt);
        warn!(
            operation,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %failure,
            "Store not reachable yet"
        );
        tokio::time::sleep(delay).await;
    }
}
