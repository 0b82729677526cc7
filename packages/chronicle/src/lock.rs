//! Advisory locks keyed by application-chosen strings.
//!
//! Derivation code takes locks such as `"account:42"` to keep two commands
//! from concurrently deciding on the same state. The pipeline hands every
//! command a [`TrackingLockProvider`](crate::TrackingLockProvider) over the
//! repository's provider, so locks are released even when derivation forgets.

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};

use crate::lifecycle::{Lifecycle, LifecycleError, Service, ServiceState};

/// Errors from lock acquisition.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock provider is {state}")]
    NotRunning { state: Lifecycle },

    /// The backing lock service failed.
    #[error("lock provider unavailable: {0}")]
    Unavailable(anyhow::Error),
}

/// One held lock.
pub trait LockHandle: Send + Sync + fmt::Debug {
    /// Key this lock was acquired for.
    fn key(&self) -> &str;

    /// Release the lock. Calling this more than once has no further effect.
    fn unlock(&self);

    /// Whether the lock is still held.
    fn is_locked(&self) -> bool;
}

/// Shared handle to a held lock.
pub type Lock = Arc<dyn LockHandle>;

/// Source of keyed mutual exclusion.
///
/// `lock` waits until the key is free. Implementations must be usable
/// concurrently from many tasks.
#[async_trait]
pub trait LockProvider: Service {
    async fn lock(&self, key: &str) -> Result<Lock, LockError>;
}

// =============================================================================
// Local Lock Provider
// =============================================================================

type KeyTable = DashMap<String, Arc<tokio::sync::Mutex<()>>>;

/// In-process lock provider backed by one async mutex per key.
///
/// A key's entry lives only while someone holds or waits for it.
pub struct LocalLockProvider {
    state: ServiceState,
    locks: Arc<KeyTable>,
}

impl LocalLockProvider {
    pub fn new() -> Self {
        Self {
            state: ServiceState::new(),
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Number of keys currently held or waited on.
    pub fn key_count(&self) -> usize {
        self.locks.len()
    }
}

impl Default for LocalLockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LocalLockProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalLockProvider")
            .field("state", &self.state.get())
            .field("keys", &self.locks.len())
            .finish()
    }
}

impl Service for LocalLockProvider {
    fn lifecycle(&self) -> Lifecycle {
        self.state.get()
    }

    fn start(&self) -> Result<(), LifecycleError> {
        self.state.start()?;
        info!("local lock provider started");
        Ok(())
    }

    fn stop(&self) -> Result<(), LifecycleError> {
        if self.state.stop()? {
            info!(keys = self.locks.len(), "local lock provider stopped");
        }
        Ok(())
    }
}

#[async_trait]
impl LockProvider for LocalLockProvider {
    async fn lock(&self, key: &str) -> Result<Lock, LockError> {
        let state = self.state.get();
        if state != Lifecycle::Running {
            return Err(LockError::NotRunning { state });
        }

        // Clone the Arc out so the DashMap shard is not held across the await.
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();

        let guard = mutex.lock_owned().await;
        Ok(Arc::new(LocalLock {
            key: key.to_string(),
            guard: Mutex::new(Some(guard)),
            table: self.locks.clone(),
        }))
    }
}

/// Handle returned by [`LocalLockProvider`]. Dropping it also releases.
struct LocalLock {
    key: String,
    guard: Mutex<Option<OwnedMutexGuard<()>>>,
    table: Arc<KeyTable>,
}

impl LocalLock {
    fn slot(&self) -> std::sync::MutexGuard<'_, Option<OwnedMutexGuard<()>>> {
        match self.guard.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!(key = %self.key, "lock handle mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn release(&self) {
        let Some(guard) = self.slot().take() else {
            return;
        };
        drop(guard);

        // The table's own reference is the last one: no holder, no waiter.
        self.table
            .remove_if(self.key.as_str(), |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

impl Drop for LocalLock {
    fn drop(&mut self) {
        self.release();
    }
}

impl LockHandle for LocalLock {
    fn key(&self) -> &str {
        &self.key
    }

    fn unlock(&self) {
        self.release();
    }

    fn is_locked(&self) -> bool {
        self.slot().is_some()
    }
}

impl fmt::Debug for LocalLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalLock")
            .field("key", &self.key)
            .field("locked", &self.is_locked())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn running() -> LocalLockProvider {
        let provider = LocalLockProvider::new();
        provider.start().unwrap();
        provider
    }

    #[tokio::test]
    async fn test_lock_and_unlock() {
        let provider = running();
        let lock = provider.lock("a").await.unwrap();
        assert_eq!(lock.key(), "a");
        assert!(lock.is_locked());

        lock.unlock();
        assert!(!lock.is_locked());
    }

    #[tokio::test]
    async fn test_unlock_is_idempotent() {
        let provider = running();
        let lock = provider.lock("a").await.unwrap();
        lock.unlock();
        lock.unlock();
        assert!(!lock.is_locked());

        // Still acquirable exactly once more.
        let again = provider.lock("a").await.unwrap();
        assert!(again.is_locked());
    }

    #[tokio::test]
    async fn test_same_key_excludes() {
        let provider = Arc::new(running());
        let held = provider.lock("x").await.unwrap();

        let contender = {
            let provider = provider.clone();
            tokio::spawn(async move { provider.lock("x").await.map(|l| l.is_locked()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        held.unlock();
        let acquired = tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .expect("contender should acquire after unlock")
            .unwrap()
            .unwrap();
        assert!(acquired);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let provider = running();
        let _a = provider.lock("a").await.unwrap();
        let b = tokio::time::timeout(Duration::from_millis(100), provider.lock("b"))
            .await
            .expect("different key should not block")
            .unwrap();
        assert!(b.is_locked());
        assert_eq!(provider.key_count(), 2);
    }

    #[tokio::test]
    async fn test_released_keys_are_forgotten() {
        let provider = running();
        for n in 0..10_000 {
            let lock = provider.lock(&format!("account:{n}")).await.unwrap();
            if n % 2 == 0 {
                lock.unlock();
            }
        }
        assert_eq!(provider.key_count(), 0);
    }

    #[tokio::test]
    async fn test_key_with_waiter_is_kept() {
        let provider = Arc::new(running());
        let held = provider.lock("x").await.unwrap();

        let waiter = {
            let provider = provider.clone();
            tokio::spawn(async move { provider.lock("x").await.unwrap() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        held.unlock();
        let next = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should acquire after unlock")
            .unwrap();
        assert!(next.is_locked());
        assert_eq!(provider.key_count(), 1);

        // A later caller still waits on the new holder.
        let blocked = tokio::time::timeout(Duration::from_millis(50), provider.lock("x")).await;
        assert!(blocked.is_err());

        next.unlock();
        assert_eq!(provider.key_count(), 0);
    }

    #[tokio::test]
    async fn test_drop_releases() {
        let provider = running();
        drop(provider.lock("a").await.unwrap());
        let again = tokio::time::timeout(Duration::from_millis(100), provider.lock("a")).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn test_not_running_is_rejected() {
        let provider = LocalLockProvider::new();
        let err = provider.lock("a").await.unwrap_err();
        assert!(matches!(
            err,
            LockError::NotRunning {
                state: Lifecycle::NotStarted
            }
        ));

        provider.start().unwrap();
        provider.stop().unwrap();
        assert!(provider.lock("a").await.is_err());
    }
}
