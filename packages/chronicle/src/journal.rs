//! The atomic commit boundary.
//!
//! A [`Journal`] persists one command plus the events derived from it as a
//! single unit. Until [`commit`](Journal::commit) returns, none of the unit's
//! entities are visible through [`get`](Journal::get) or
//! [`iterate`](Journal::iterate); afterwards all of them are. Never a subset.
//!
//! # Listener protocol
//!
//! For every unit the journal drives a [`JournalListener`]:
//!
//! ```text
//! on_event(e1) .. on_event(eN)  then  on_commit()     (unit visible)
//! on_abort(err)                                       (nothing visible)
//! ```
//!
//! `on_event` fires only once the event is recorded, so an aborted unit
//! reports nothing but the abort.
//!
//! This is how external indexers stay in sync without the pipeline knowing
//! anything about them.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::error;

use crate::clock::HybridTimestamp;
use crate::core::{Command, Entity, EntityId, Event};
use crate::error::{extract_panic_message, DerivationError};
use crate::layout::LayoutError;
use crate::lifecycle::{Lifecycle, Service};
use crate::stream::EventStream;

// =============================================================================
// Errors
// =============================================================================

/// Errors from journal operations.
#[derive(Debug, Error)]
pub enum JournalError {
    /// The event stream yielded an error while the unit was being staged.
    #[error(transparent)]
    Derivation(#[from] DerivationError),

    #[error(transparent)]
    Layout(#[from] LayoutError),

    /// An entity with this id is already journaled (or appears twice in the
    /// same unit).
    #[error("entity {id} is already journaled")]
    DuplicateEntity { id: EntityId },

    #[error("journal is {state}")]
    NotRunning { state: Lifecycle },

    /// The entity type is not in the registry.
    #[error("unknown entity type: {entity_type}")]
    UnknownType { entity_type: String },

    /// Storage backend failure.
    #[error("journal backend failed: {0}")]
    Backend(anyhow::Error),
}

// =============================================================================
// Records
// =============================================================================

/// A committed entity as stored by the journal.
pub enum Record<C: Command> {
    Command(Arc<Entity<C>>),
    Event(Arc<Entity<C::Event>>),
}

impl<C: Command> Record<C> {
    pub fn id(&self) -> EntityId {
        match self {
            Record::Command(c) => c.id(),
            Record::Event(e) => e.id(),
        }
    }

    pub fn timestamp(&self) -> Option<HybridTimestamp> {
        match self {
            Record::Command(c) => c.timestamp(),
            Record::Event(e) => e.timestamp(),
        }
    }

    pub fn entity_type(&self) -> &'static str {
        match self {
            Record::Command(c) => c.payload().entity_type(),
            Record::Event(e) => e.payload().entity_type(),
        }
    }

    /// Causing command, for events.
    pub fn cause(&self) -> Option<EntityId> {
        match self {
            Record::Command(_) => None,
            Record::Event(e) => e.cause(),
        }
    }

    pub fn as_command(&self) -> Option<&Arc<Entity<C>>> {
        match self {
            Record::Command(c) => Some(c),
            Record::Event(_) => None,
        }
    }

    pub fn as_event(&self) -> Option<&Arc<Entity<C::Event>>> {
        match self {
            Record::Command(_) => None,
            Record::Event(e) => Some(e),
        }
    }
}

impl<C: Command> Clone for Record<C> {
    fn clone(&self) -> Self {
        match self {
            Record::Command(c) => Record::Command(c.clone()),
            Record::Event(e) => Record::Event(e.clone()),
        }
    }
}

impl<C: Command> fmt::Debug for Record<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Record::Command(c) => f.debug_tuple("Command").field(c).finish(),
            Record::Event(e) => f.debug_tuple("Event").field(e).finish(),
        }
    }
}

// =============================================================================
// Listener
// =============================================================================

/// Observer of a single commit. All methods default to no-ops.
pub trait JournalListener<C: Command>: Send + Sync {
    /// An event of the unit was recorded. Always before `on_commit`.
    fn on_event(&self, _event: &Arc<Entity<C::Event>>) {}

    /// The whole unit is recorded and visible.
    fn on_commit(&self) {}

    /// The unit was not committed; nothing from it is visible.
    fn on_abort(&self, _cause: &JournalError) {}
}

/// Listener that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl<C: Command> JournalListener<C> for NoopListener {}

/// Fan-out over several listeners, invoked in order.
pub struct Listeners<'a, C: Command> {
    listeners: Vec<&'a dyn JournalListener<C>>,
}

impl<'a, C: Command> Listeners<'a, C> {
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }

    pub fn with(mut self, listener: &'a dyn JournalListener<C>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl<C: Command> Default for Listeners<'_, C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Command> Listeners<'_, C> {
    /// Run `callback` against every listener. A panicking listener is logged
    /// and skipped; the rest still run.
    fn each(&self, callback: &'static str, f: impl Fn(&dyn JournalListener<C>)) {
        for (index, listener) in self.listeners.iter().enumerate() {
            if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| f(*listener))) {
                error!(
                    listener = index,
                    callback,
                    panic = %extract_panic_message(&panic),
                    "journal listener panicked"
                );
            }
        }
    }
}

impl<C: Command> JournalListener<C> for Listeners<'_, C> {
    fn on_event(&self, event: &Arc<Entity<C::Event>>) {
        self.each("on_event", |listener| listener.on_event(event));
    }

    fn on_commit(&self) {
        self.each("on_commit", |listener| listener.on_commit());
    }

    fn on_abort(&self, cause: &JournalError) {
        self.each("on_abort", |listener| listener.on_abort(cause));
    }
}

// =============================================================================
// Journal
// =============================================================================

/// Atomic store of commands and their events.
///
/// Implementations must allow `commit` to be called concurrently for
/// different commands while preserving per-unit atomicity.
#[async_trait]
pub trait Journal<C: Command>: Service {
    /// Persist `command` and every item of `events` as one unit.
    ///
    /// Consumes the stream; an `Err` item aborts the unit. Returns the number
    /// of entities committed (events + 1).
    async fn commit(
        &self,
        command: Arc<Entity<C>>,
        events: EventStream<Entity<C::Event>>,
        listener: &dyn JournalListener<C>,
    ) -> Result<usize, JournalError>;

    /// Look up a committed entity.
    async fn get(&self, id: EntityId) -> Result<Option<Record<C>>, JournalError>;

    /// Ids of committed entities of `entity_type`, in commit order.
    ///
    /// The result is a snapshot; later commits do not affect it.
    async fn iterate(&self, entity_type: &str) -> Result<Vec<EntityId>, JournalError>;

    /// Irreversibly remove everything.
    async fn clear(&self) -> Result<(), JournalError>;

    /// Number of committed entities.
    async fn len(&self) -> Result<usize, JournalError>;
}

/// Lazy reference to a committed entity, as yielded by iteration.
pub struct EntityHandle<C: Command> {
    id: EntityId,
    journal: Arc<dyn Journal<C>>,
}

impl<C: Command> EntityHandle<C> {
    pub fn new(id: EntityId, journal: Arc<dyn Journal<C>>) -> Self {
        Self { id, journal }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    /// Fetch the entity. `None` if the journal was cleared since.
    pub async fn load(&self) -> Result<Option<Record<C>>, JournalError> {
        self.journal.get(self.id).await
    }
}

impl<C: Command> Clone for EntityHandle<C> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            journal: self.journal.clone(),
        }
    }
}

impl<C: Command> fmt::Debug for EntityHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityHandle").field("id", &self.id).finish()
    }
}
