//! Per-command lock tracking.
//!
//! The pipeline creates one [`TrackingLockProvider`] per command, hands it to
//! derivation, and calls [`close`](TrackingLockProvider::close) exactly once
//! after the unit finishes. Whatever derivation locked is released on every
//! path (success, rejection, fault or panic), and a clone that escaped
//! derivation cannot lock anything afterwards.

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::lifecycle::{Lifecycle, LifecycleError, Service, ServiceState};
use crate::lock::{Lock, LockError, LockProvider};

/// Lock provider that remembers every lock acquired through it.
///
/// Cloning shares the tracked set, so the pipeline can keep one handle while
/// derivation holds another.
#[derive(Clone)]
pub struct TrackingLockProvider {
    inner: Arc<dyn LockProvider>,
    state: Arc<ServiceState>,
    held: Arc<Mutex<Vec<Lock>>>,
}

impl TrackingLockProvider {
    pub fn new(inner: Arc<dyn LockProvider>) -> Self {
        Self {
            inner,
            state: Arc::new(ServiceState::new()),
            held: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Unlock every recorded lock that is still held and forget them all.
    ///
    /// Locks already released individually are skipped, so the underlying
    /// resource is never unlocked twice. Calling this again is a no-op.
    /// Returns the number of locks this call released.
    pub fn release_all(&self) -> usize {
        let drained: Vec<Lock> = std::mem::take(&mut *self.held_locks());

        let mut released = 0;
        for lock in drained {
            if lock.is_locked() {
                lock.unlock();
                released += 1;
            }
        }

        if released > 0 {
            debug!(released, "released tracked locks");
        }
        released
    }

    /// Stop taking new locks, then release everything tracked.
    ///
    /// Returns the number of locks this call released.
    pub fn close(&self) -> usize {
        if let Err(e) = self.state.stop() {
            warn!(error = %e, "lock tracker did not stop cleanly");
        }
        self.release_all()
    }

    /// Number of locks currently recorded (held or individually released).
    pub fn tracked(&self) -> usize {
        self.held_locks().len()
    }

    fn held_locks(&self) -> std::sync::MutexGuard<'_, Vec<Lock>> {
        match self.held.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("tracking lock set was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

impl fmt::Debug for TrackingLockProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackingLockProvider")
            .field("state", &self.state.get())
            .field("tracked", &self.tracked())
            .finish_non_exhaustive()
    }
}

impl Service for TrackingLockProvider {
    fn lifecycle(&self) -> Lifecycle {
        self.state.get()
    }

    fn start(&self) -> Result<(), LifecycleError> {
        self.state.start()
    }

    /// Stops accepting new locks and releases everything tracked.
    fn stop(&self) -> Result<(), LifecycleError> {
        self.state.stop()?;
        self.release_all();
        Ok(())
    }
}

#[async_trait]
impl LockProvider for TrackingLockProvider {
    async fn lock(&self, key: &str) -> Result<Lock, LockError> {
        let state = self.state.get();
        if state != Lifecycle::Running {
            return Err(LockError::NotRunning { state });
        }

        let lock = self.inner.lock(key).await?;

        // Checked again under the set's mutex: a close that raced the
        // acquisition above has either drained this lock or will be seen here.
        let mut held = self.held_locks();
        let state = self.state.get();
        if state != Lifecycle::Running {
            drop(held);
            lock.unlock();
            return Err(LockError::NotRunning { state });
        }
        held.push(lock.clone());
        Ok(lock)
    }
}
