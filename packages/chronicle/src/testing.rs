//! Test doubles for chronicle repositories.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! chronicle = { path = "../chronicle", features = ["testing"] }
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use chronicle::testing::{CountingLockProvider, RecordingListener};
//!
//! let locks = Arc::new(CountingLockProvider::new());
//! let listener = Arc::new(RecordingListener::new());
//!
//! let repo = Repository::builder(registry)
//!     .with_journal(journal)
//!     .with_lock_provider(locks.clone())
//!     .with_listener(listener.clone())
//!     .build();
//! repo.start()?;
//!
//! repo.execute(cmd).await?;
//!
//! assert_eq!(locks.locks(), locks.unlocks());
//! assert_eq!(listener.kinds(), vec!["event", "commit"]);
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::clock::PhysicalClock;
use crate::core::{Command, Entity, EntityId};
use crate::journal::{Journal, JournalError, JournalListener, Record};
use crate::lifecycle::{Lifecycle, LifecycleError, Service};
use crate::lock::{LocalLockProvider, Lock, LockError, LockHandle, LockProvider};
use crate::memory::MemoryJournal;
use crate::stream::EventStream;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// CountingLockProvider
// =============================================================================

/// Local lock provider that counts acquisitions and releases.
///
/// `unlocks()` counts actual releases only. A second `unlock()` on the same
/// handle is recorded separately in `redundant_unlocks()`.
#[derive(Debug, Default)]
pub struct CountingLockProvider {
    inner: LocalLockProvider,
    counters: Arc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    locks: AtomicUsize,
    unlocks: AtomicUsize,
    redundant: AtomicUsize,
}

impl CountingLockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Successful `lock` calls.
    pub fn locks(&self) -> usize {
        self.counters.locks.load(Ordering::SeqCst)
    }

    /// Locks actually released.
    pub fn unlocks(&self) -> usize {
        self.counters.unlocks.load(Ordering::SeqCst)
    }

    /// `unlock` calls on handles that were already released.
    pub fn redundant_unlocks(&self) -> usize {
        self.counters.redundant.load(Ordering::SeqCst)
    }

    /// Locks acquired and not yet released.
    pub fn outstanding(&self) -> usize {
        self.locks().saturating_sub(self.unlocks())
    }
}

impl Service for CountingLockProvider {
    fn lifecycle(&self) -> Lifecycle {
        self.inner.lifecycle()
    }

    fn start(&self) -> Result<(), LifecycleError> {
        self.inner.start()
    }

    fn stop(&self) -> Result<(), LifecycleError> {
        self.inner.stop()
    }
}

#[async_trait]
impl LockProvider for CountingLockProvider {
    async fn lock(&self, key: &str) -> Result<Lock, LockError> {
        let inner = self.inner.lock(key).await?;
        self.counters.locks.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(CountedLock {
            inner,
            released: AtomicBool::new(false),
            counters: self.counters.clone(),
        }))
    }
}

#[derive(Debug)]
struct CountedLock {
    inner: Lock,
    released: AtomicBool,
    counters: Arc<Counters>,
}

impl LockHandle for CountedLock {
    fn key(&self) -> &str {
        self.inner.key()
    }

    fn unlock(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            self.counters.redundant.fetch_add(1, Ordering::SeqCst);
        } else {
            self.inner.unlock();
            self.counters.unlocks.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_locked(&self) -> bool {
        !self.released.load(Ordering::SeqCst)
    }
}

// =============================================================================
// RecordingListener
// =============================================================================

/// One callback seen by a [`RecordingListener`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observed {
    Event(EntityId),
    Commit,
    Abort(String),
}

impl Observed {
    pub fn kind(&self) -> &'static str {
        match self {
            Observed::Event(_) => "event",
            Observed::Commit => "commit",
            Observed::Abort(_) => "abort",
        }
    }
}

/// Journal listener that records every callback in order.
pub struct RecordingListener<C: Command> {
    observed: Mutex<Vec<Observed>>,
    _command: std::marker::PhantomData<fn() -> C>,
}

impl<C: Command> RecordingListener<C> {
    pub fn new() -> Self {
        Self {
            observed: Mutex::new(Vec::new()),
            _command: std::marker::PhantomData,
        }
    }

    pub fn observed(&self) -> Vec<Observed> {
        lock(&self.observed).clone()
    }

    /// Callback kinds in order: `"event"`, `"commit"`, `"abort"`.
    pub fn kinds(&self) -> Vec<&'static str> {
        lock(&self.observed).iter().map(Observed::kind).collect()
    }

    pub fn commits(&self) -> usize {
        self.count(|o| matches!(o, Observed::Commit))
    }

    pub fn aborts(&self) -> usize {
        self.count(|o| matches!(o, Observed::Abort(_)))
    }

    /// Ids of every event reported, committed or not.
    pub fn event_ids(&self) -> Vec<EntityId> {
        lock(&self.observed)
            .iter()
            .filter_map(|o| match o {
                Observed::Event(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        lock(&self.observed).clear();
    }

    fn count(&self, f: impl Fn(&Observed) -> bool) -> usize {
        lock(&self.observed).iter().filter(|o| f(o)).count()
    }
}

impl<C: Command> Default for RecordingListener<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Command> fmt::Debug for RecordingListener<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingListener")
            .field("observed", &self.observed())
            .finish()
    }
}

impl<C: Command> JournalListener<C> for RecordingListener<C> {
    fn on_event(&self, event: &Arc<Entity<C::Event>>) {
        lock(&self.observed).push(Observed::Event(event.id()));
    }

    fn on_commit(&self) {
        lock(&self.observed).push(Observed::Commit);
    }

    fn on_abort(&self, cause: &JournalError) {
        lock(&self.observed).push(Observed::Abort(cause.to_string()));
    }
}

/// Journal listener that panics in the chosen callbacks.
#[derive(Debug, Default, Clone, Copy)]
pub struct PanickingListener {
    event: bool,
    commit: bool,
    abort: bool,
}

impl PanickingListener {
    pub fn panics_on_event() -> Self {
        Self {
            event: true,
            ..Self::default()
        }
    }

    pub fn panics_on_commit() -> Self {
        Self {
            commit: true,
            ..Self::default()
        }
    }

    pub fn panics_on_abort() -> Self {
        Self {
            abort: true,
            ..Self::default()
        }
    }
}

impl<C: Command> JournalListener<C> for PanickingListener {
    fn on_event(&self, _event: &Arc<Entity<C::Event>>) {
        if self.event {
            panic!("listener panicked in on_event");
        }
    }

    fn on_commit(&self) {
        if self.commit {
            panic!("listener panicked in on_commit");
        }
    }

    fn on_abort(&self, _cause: &JournalError) {
        if self.abort {
            panic!("listener panicked in on_abort");
        }
    }
}

// =============================================================================
// ManualClock
// =============================================================================

/// Physical time source moved by hand.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl PhysicalClock for ManualClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

// =============================================================================
// FailingJournal
// =============================================================================

/// Memory journal whose commits can be made to fail or panic on demand.
pub struct FailingJournal<C: Command> {
    inner: MemoryJournal<C>,
    fail: AtomicBool,
    panic: AtomicBool,
}

impl<C: Command> FailingJournal<C> {
    pub fn new() -> Self {
        Self {
            inner: MemoryJournal::new(),
            fail: AtomicBool::new(false),
            panic: AtomicBool::new(false),
        }
    }

    /// Make every commit fail with a backend error.
    pub fn fail_commits(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Make every commit panic.
    pub fn panic_commits(&self, panic: bool) {
        self.panic.store(panic, Ordering::SeqCst);
    }
}

impl<C: Command> Default for FailingJournal<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Command> Service for FailingJournal<C> {
    fn lifecycle(&self) -> Lifecycle {
        self.inner.lifecycle()
    }

    fn start(&self) -> Result<(), LifecycleError> {
        self.inner.start()
    }

    fn stop(&self) -> Result<(), LifecycleError> {
        self.inner.stop()
    }
}

#[async_trait]
impl<C: Command> Journal<C> for FailingJournal<C> {
    async fn commit(
        &self,
        command: Arc<Entity<C>>,
        events: EventStream<Entity<C::Event>>,
        listener: &dyn JournalListener<C>,
    ) -> Result<usize, JournalError> {
        if self.panic.load(Ordering::SeqCst) {
            panic!("injected journal panic");
        }
        if self.fail.load(Ordering::SeqCst) {
            let err = JournalError::Backend(anyhow::anyhow!("injected journal failure"));
            listener.on_abort(&err);
            return Err(err);
        }
        self.inner.commit(command, events, listener).await
    }

    async fn get(&self, id: EntityId) -> Result<Option<Record<C>>, JournalError> {
        self.inner.get(id).await
    }

    async fn iterate(&self, entity_type: &str) -> Result<Vec<EntityId>, JournalError> {
        self.inner.iterate(entity_type).await
    }

    async fn clear(&self) -> Result<(), JournalError> {
        self.inner.clear().await
    }

    async fn len(&self) -> Result<usize, JournalError> {
        self.inner.len().await
    }
}

// =============================================================================
// Fixtures
// =============================================================================
