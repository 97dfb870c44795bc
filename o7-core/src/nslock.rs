// Copyright 2026 O7 Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Named lock service.
//!
//! Subsystems use named locks to elect a single actor for cluster-wide,
//! one-time work (the IAM format migration elects its migrator this way).
//! In a distributed deployment the service is backed by the cluster's
//! lock manager; `LocalNsLock` serves single-node setups.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::error::StoreError;

/// Named reader/writer lock service.
#[async_trait]
pub trait NsLockService: Send + Sync {
    /// Acquires the named lock, waiting up to `timeout`.
    ///
    /// Fails with `StoreError::LockTimeout` when the lock is still held
    /// elsewhere once the timeout elapses.
    async fn acquire(&self, bucket: &str, object: &str, timeout: Duration)
        -> Result<(), StoreError>;

    /// Releases a previously acquired lock. Releasing a lock that is not
    /// held is a no-op.
    async fn release(&self, bucket: &str, object: &str);
}

fn lock_name(bucket: &str, object: &str) -> String {
    format!("{}/{}", bucket, object)
}

/// Process-local lock service.
pub struct LocalNsLock {
    held: Mutex<HashSet<String>>,
}

impl LocalNsLock {
    pub fn new() -> Self {
        Self {
            held: Mutex::new(HashSet::new()),
        }
    }
}

impl Default for LocalNsLock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NsLockService for LocalNsLock {
    async fn acquire(
        &self,
        bucket: &str,
        object: &str,
        timeout: Duration,
    ) -> Result<(), StoreError> {
        let name = lock_name(bucket, object);
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut held = self.held.lock().await;
                if held.insert(name.clone()) {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(StoreError::LockTimeout { name });
            }
            sleep(Duration::from_millis(25)).await;
        }
    }

    async fn release(&self, bucket: &str, object: &str) {
        let mut held = self.held.lock().await;
        held.remove(&lock_name(bucket, object));
    }
}

/// Lock timeout that adapts to observed contention.
///
/// Starts at `initial` and converges toward `minimum` while acquisitions
/// succeed; each timeout doubles the wait back up to `initial`.
pub struct DynamicTimeout {
    initial: Duration,
    minimum: Duration,
    current: Mutex<Duration>,
}

impl DynamicTimeout {
    pub fn new(initial: Duration, minimum: Duration) -> Self {
        Self {
            initial,
            minimum,
            current: Mutex::new(initial),
        }
    }

    /// Current timeout value.
    pub async fn timeout(&self) -> Duration {
        *self.current.lock().await
    }

    /// Records a successful acquisition, shrinking the timeout.
    pub async fn log_success(&self) {
        let mut current = self.current.lock().await;
        *current = (*current * 3 / 4).max(self.minimum);
    }

    /// Records a timed-out acquisition, growing the timeout.
    pub async fn log_failure(&self) {
        let mut current = self.current.lock().await;
        *current = (*current * 2).min(self.initial * 4);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exclusive_acquire() {
        let locks = LocalNsLock::new();
        locks.acquire("meta", "iam-lock", Duration::from_millis(50)).await.unwrap();

        // Second acquire of the same name times out while held.
        let err = locks
            .acquire("meta", "iam-lock", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout { .. }));

        locks.release("meta", "iam-lock").await;
        locks.acquire("meta", "iam-lock", Duration::from_millis(50)).await.unwrap();
    }

    #[tokio::test]
    async fn test_release_unheld_is_noop() {
        let locks = LocalNsLock::new();
        locks.release("meta", "nothing").await;
    }

    #[tokio::test]
    async fn test_dynamic_timeout_adapts() {
        let dt = DynamicTimeout::new(Duration::from_secs(5), Duration::from_secs(3));
        assert_eq!(dt.timeout().await, Duration::from_secs(5));

        dt.log_success().await;
        let shrunk = dt.timeout().await;
        assert!(shrunk < Duration::from_secs(5));
        assert!(shrunk >= Duration::from_secs(3));

        dt.log_failure().await;
        assert!(dt.timeout().await > shrunk);
    }
}
