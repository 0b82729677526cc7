//! Pre-generated entity identifiers.
//!
//! UUID generation pulls from the OS entropy source. To keep that off the
//! command hot path, an [`IdentityPool`] runs one generator thread that keeps
//! a bounded channel topped up; issuing an id is a non-blocking pop.

use std::sync::{Mutex, OnceLock};
use std::thread;

use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::EntityId;

/// Capacity of the process-wide pool backing [`next_id`].
pub const DEFAULT_POOL_CAPACITY: usize = 4096;

/// Buffer of identifiers filled by a background generator.
///
/// The generator thread blocks while the buffer is full and exits once the
/// pool is dropped. When the buffer is momentarily empty, [`next`] generates
/// inline rather than waiting, so issuance never blocks.
///
/// [`next`]: IdentityPool::next
pub struct IdentityPool {
    rx: Mutex<mpsc::Receiver<Uuid>>,
    capacity: usize,
}

impl IdentityPool {
    /// Create a pool and spawn its generator thread.
    ///
    /// A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);

        let spawned = thread::Builder::new()
            .name("chronicle-identity".into())
            .spawn(move || {
                // blocking_send fails only once the receiver is gone.
                while tx.blocking_send(Uuid::new_v4()).is_ok() {}
                debug!("identity generator stopped");
            });

        if let Err(e) = spawned {
            warn!(error = %e, "failed to spawn identity generator, ids will be generated inline");
        }

        Self {
            rx: Mutex::new(rx),
            capacity,
        }
    }

    /// Issue a fresh identifier.
    pub fn next(&self) -> EntityId {
        let mut rx = match self.rx.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("identity pool mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        };

        match rx.try_recv() {
            Ok(uuid) => EntityId::from(uuid),
            Err(_) => EntityId::from(Uuid::new_v4()),
        }
    }

    /// Maximum number of pre-generated identifiers held.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl std::fmt::Debug for IdentityPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityPool")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

static GLOBAL: OnceLock<IdentityPool> = OnceLock::new();

/// The process-wide identity pool, created on first use.
pub fn global() -> &'static IdentityPool {
    GLOBAL.get_or_init(|| IdentityPool::new(DEFAULT_POOL_CAPACITY))
}

/// Issue an identifier from the process-wide pool.
pub fn next_id() -> EntityId {
    global().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_ids_are_unique() {
        let pool = IdentityPool::new(16);
        let ids: HashSet<_> = (0..1_000).map(|_| pool.next()).collect();
        assert_eq!(ids.len(), 1_000);
    }

    #[test]
    fn test_zero_capacity_is_usable() {
        let pool = IdentityPool::new(0);
        assert_eq!(pool.capacity(), 1);
        assert_ne!(pool.next(), pool.next());
    }

    #[test]
    fn test_concurrent_issuance_is_unique() {
        let pool = Arc::new(IdentityPool::new(64));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || (0..500).map(|_| pool.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 4_000);
    }

    #[test]
    fn test_global_pool() {
        assert_ne!(next_id(), next_id());
        assert_eq!(global().capacity(), DEFAULT_POOL_CAPACITY);
    }

    #[test]
    fn test_drop_does_not_hang() {
        let pool = IdentityPool::new(4);
        let _ = pool.next();
        drop(pool);
    }
}
