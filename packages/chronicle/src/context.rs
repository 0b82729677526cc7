//! What a command sees while deriving its events.

use std::fmt;
use std::sync::Arc;

use crate::clock::HybridTimestamp;
use crate::core::{Command, Entity, EntityId};
use crate::journal::{Journal, JournalError, Record};
use crate::lock::{Lock, LockError, LockProvider};
use crate::tracking::TrackingLockProvider;

/// Derivation context for one command.
///
/// Gives read access to committed state and a lock provider scoped to this
/// command. Locks taken here are released by the pipeline after the unit
/// finishes, whether or not derivation releases them itself.
pub struct DerivationContext<C: Command> {
    command: Arc<Entity<C>>,
    timestamp: HybridTimestamp,
    journal: Arc<dyn Journal<C>>,
    locks: TrackingLockProvider,
}

impl<C: Command> DerivationContext<C> {
    pub(crate) fn new(
        command: Arc<Entity<C>>,
        timestamp: HybridTimestamp,
        journal: Arc<dyn Journal<C>>,
        locks: TrackingLockProvider,
    ) -> Self {
        Self {
            command,
            timestamp,
            journal,
            locks,
        }
    }

    /// The command being derived.
    pub fn command(&self) -> &Arc<Entity<C>> {
        &self.command
    }

    pub fn id(&self) -> EntityId {
        self.command.id()
    }

    /// Timestamp assigned to the command. Event `i` will be stamped
    /// `timestamp().offset(i)`.
    pub fn timestamp(&self) -> HybridTimestamp {
        self.timestamp
    }

    /// Committed state. Does not include the unit being derived.
    pub fn journal(&self) -> &Arc<dyn Journal<C>> {
        &self.journal
    }

    /// Lock provider scoped to this command.
    pub fn locks(&self) -> &TrackingLockProvider {
        &self.locks
    }

    /// Shorthand for `locks().lock(key)`.
    pub async fn lock(&self, key: &str) -> Result<Lock, LockError> {
        self.locks.lock(key).await
    }

    /// Shorthand for `journal().get(id)`.
    pub async fn get(&self, id: EntityId) -> Result<Option<Record<C>>, JournalError> {
        self.journal.get(id).await
    }
}

impl<C: Command> fmt::Debug for DerivationContext<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivationContext")
            .field("command", &self.command.id())
            .field("timestamp", &self.timestamp)
            .field("locks", &self.locks)
            .finish_non_exhaustive()
    }
}
