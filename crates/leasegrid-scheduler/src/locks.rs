//! Named lock registry.
//!
//! Issues fair locks keyed by arbitrary strings — used to serialize
//! co-scheduling group additions against group finalization. Tokio
//! mutexes queue waiters FIFO, giving fairness; guards are scoped so
//! release is guaranteed on every exit path. Acquisition is bounded by a
//! timeout, and a timeout maps to a caller-visible denial rather than an
//! indefinite wait.
//!
//! The locks are not reentrant: a guard is held for the whole critical
//! section, and no code path re-acquires a key it already holds.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;

use crate::error::{SchedulerError, SchedulerResult};

const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Registry of named, fair async locks.
pub struct LockRegistry {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    acquire_timeout: Duration,
}

impl Default for LockRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_ACQUIRE_TIMEOUT)
    }
}

impl LockRegistry {
    pub fn new(acquire_timeout: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            acquire_timeout,
        }
    }

    /// Acquire the lock for `key`, waiting at most the configured timeout.
    /// A timeout maps to `Denied` — the caller sees a retryable refusal,
    /// and other waiters are not wedged.
    pub async fn lock(&self, key: &str) -> SchedulerResult<OwnedMutexGuard<()>> {
        let mutex = {
            let mut locks = self.locks.lock().expect("lock registry poisoned");
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };

        tokio::time::timeout(self.acquire_timeout, mutex.lock_owned())
            .await
            .map_err(|_| {
                SchedulerError::Denied(format!("timed out waiting for lock '{key}'"))
            })
    }

    /// Drop registry entries nobody currently holds or waits on.
    pub fn gc(&self) {
        let mut locks = self.locks.lock().expect("lock registry poisoned");
        locks.retain(|_, m| Arc::strong_count(m) > 1);
    }

    /// Number of registered keys (for tests and diagnostics).
    pub fn len(&self) -> usize {
        self.locks.lock().expect("lock registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
