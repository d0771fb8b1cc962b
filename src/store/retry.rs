//! Bounded retry of busy store operations

use std::thread;
use std::time::{Duration, Instant};

use rusqlite::ErrorCode;
use tracing::trace;

use super::errors::{StoreError, StoreResult};
use crate::config::IndexConfig;

/// Sleep interval and total budget for retrying a busy operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &IndexConfig) -> Self {
        Self {
            interval: config.busy_retry_interval(),
            timeout: config.busy_timeout(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&IndexConfig::default())
    }
}

/// True for the transient "database is busy/locked" conditions
pub fn is_busy(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        }
        _ => false,
    }
}

/// Run `op`, retrying while the store reports busy.
///
/// Non-busy errors are returned at once. Once `policy.timeout` has elapsed
/// the busy condition surfaces as [`StoreError::Busy`].
pub fn with_busy_retry<T, F>(policy: &RetryPolicy, operation: &str, mut op: F) -> StoreResult<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    let started = Instant::now();
    let mut attempts = 0u32;

    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if is_busy(&err) => {
                attempts += 1;
                let waited = started.elapsed();
                if waited >= policy.timeout {
                    return Err(StoreError::Busy {
                        operation: operation.to_string(),
                        waited_ms: waited.as_millis() as u64,
                    });
                }
                trace!(operation, attempts, "store busy, retrying");
                thread::sleep(policy.interval);
            }
            Err(err) => return Err(err.into()),
        }
    }
}
