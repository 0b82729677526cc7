//! Core entity types and the command/event traits.
//!
//! # Overview
//!
//! Chronicle separates **requests** from **facts**:
//! - [`Command`] = a requested state change, which may be rejected
//! - [`Event`] = an immutable fact produced when a command is accepted
//!
//! Both travel wrapped in an [`Entity`] header carrying an identifier, a
//! hybrid timestamp, and (for events) the id of the causing command.
//!
//! # Sum types
//!
//! A repository handles one command type `C`. Applications with several
//! commands model them as an enum and return the active variant's name from
//! [`Command::entity_type`]; the same goes for events.
//!
//! ```ignore
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! enum BankCommand {
//!     Open { account: String },
//!     Deposit { account: String, amount: u64 },
//! }
//!
//! #[async_trait]
//! impl Command for BankCommand {
//!     type Event = BankEvent;
//!     type Output = u64;
//!
//!     fn entity_type(&self) -> &'static str {
//!         match self {
//!             BankCommand::Open { .. } => "Open",
//!             BankCommand::Deposit { .. } => "Deposit",
//!         }
//!     }
//!
//!     async fn events(&self, ctx: &DerivationContext<Self>)
//!         -> Result<EventStream<BankEvent>, DerivationError>
//!     {
//!         match self {
//!             BankCommand::Deposit { account, amount } => {
//!                 ctx.locks().lock(account).await?;
//!                 Ok(EventStream::from_vec(vec![BankEvent::Deposited { .. }]))
//!             }
//!             // ...
//!         }
//!     }
//!
//!     fn complete(&self, receipt: &Receipt<Self>) -> anyhow::Result<u64> {
//!         Ok(receipt.count() as u64)
//!     }
//! }
//! ```

use std::fmt;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::HybridTimestamp;
use crate::context::DerivationContext;
use crate::error::DerivationError;
use crate::identity;
use crate::stream::EventStream;

// =============================================================================
// Entity Id
// =============================================================================

/// Globally unique entity identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(Uuid);

impl EntityId {
    /// Issue a fresh id from the process-wide pool.
    pub fn new() -> Self {
        identity::next_id()
    }

    pub fn into_inner(self) -> Uuid {
        self.0
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for EntityId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<EntityId> for Uuid {
    fn from(id: EntityId) -> Self {
        id.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

// =============================================================================
// Entity
// =============================================================================

/// Identifiable, orderable wrapper around a command or event payload.
///
/// - The id is assigned lazily on the first [`id`](Entity::id) call and never
///   changes afterwards. Clones share the id only if it was assigned before
///   cloning.
/// - The timestamp is set exactly once, by the pipeline.
/// - `cause` links an event to the command that produced it.
#[derive(Clone)]
pub struct Entity<T> {
    id: OnceLock<EntityId>,
    timestamp: OnceLock<HybridTimestamp>,
    cause: Option<EntityId>,
    payload: T,
}

impl<T> Entity<T> {
    /// Wrap a payload with a blank header.
    pub fn new(payload: T) -> Self {
        Self {
            id: OnceLock::new(),
            timestamp: OnceLock::new(),
            cause: None,
            payload,
        }
    }

    /// Wrap an event payload produced by command `cause`.
    pub fn caused_by(payload: T, cause: EntityId) -> Self {
        Self {
            cause: Some(cause),
            ..Self::new(payload)
        }
    }

    /// Wrap a payload with a known id, e.g. when restoring from storage.
    pub fn with_id(id: EntityId, payload: T) -> Self {
        let entity = Self::new(payload);
        let _ = entity.id.set(id);
        entity
    }

    /// The entity's id, assigning one on first call.
    pub fn id(&self) -> EntityId {
        *self.id.get_or_init(identity::next_id)
    }

    /// Whether an id has been assigned yet.
    pub fn has_id(&self) -> bool {
        self.id.get().is_some()
    }

    /// The timestamp, once the pipeline has set it.
    pub fn timestamp(&self) -> Option<HybridTimestamp> {
        self.timestamp.get().copied()
    }

    /// Set the timestamp. Returns `false` if one was already set.
    pub fn stamp(&self, timestamp: HybridTimestamp) -> bool {
        self.timestamp.set(timestamp).is_ok()
    }

    /// Id of the command that produced this entity, for events.
    pub fn cause(&self) -> Option<EntityId> {
        self.cause
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn into_payload(self) -> T {
        self.payload
    }

    /// Same header (id, timestamp, cause), different payload.
    ///
    /// Used by the journal to swap in the canonical form of a payload.
    pub fn with_payload<U>(&self, payload: U) -> Entity<U> {
        let entity = Entity {
            id: OnceLock::new(),
            timestamp: OnceLock::new(),
            cause: self.cause,
            payload,
        };
        let _ = entity.id.set(self.id());
        if let Some(ts) = self.timestamp() {
            let _ = entity.timestamp.set(ts);
        }
        entity
    }
}

impl<T> From<T> for Entity<T> {
    fn from(payload: T) -> Self {
        Self::new(payload)
    }
}

impl<T: fmt::Debug> fmt::Debug for Entity<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("id", &self.id.get())
            .field("timestamp", &self.timestamp.get())
            .field("cause", &self.cause)
            .field("payload", &self.payload)
            .finish()
    }
}

// =============================================================================
// Command / Event traits
// =============================================================================

/// An immutable fact produced by an accepted command.
///
/// Events are pure data. The journal stores them in canonical (round-tripped)
/// form, so they must be serializable.
pub trait Event: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Registered type name of this event (the active variant for enums).
    fn entity_type(&self) -> &'static str;
}

/// A requested state change.
///
/// The pipeline fixes the command's id and timestamp, then calls
/// [`events`](Command::events) to derive what happened. If derivation
/// succeeds, the command and all its events are committed atomically and
/// [`complete`](Command::complete) computes the value handed back to the
/// caller.
#[async_trait]
pub trait Command: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The event type this command produces.
    type Event: Event;

    /// Value returned to the publisher after a successful commit.
    type Output: Send + 'static;

    /// Registered type name of this command (the active variant for enums).
    fn entity_type(&self) -> &'static str;

    /// Derive the events for this command.
    ///
    /// Return [`DerivationError::Rejected`] for business rejections and
    /// [`DerivationError::Fault`] for unexpected failures. The returned
    /// stream is consumed lazily by the journal; an `Err` item aborts the
    /// whole unit. Locks acquired through `ctx.locks()` are released by the
    /// pipeline whatever happens.
    async fn events(
        &self,
        ctx: &DerivationContext<Self>,
    ) -> Result<EventStream<Self::Event>, DerivationError>;

    /// Compute the caller-visible result from the committed unit.
    ///
    /// Runs after the commit is durable, so an error here does not undo it.
    fn complete(&self, receipt: &Receipt<Self>) -> anyhow::Result<Self::Output>;
}

// =============================================================================
// Receipt
// =============================================================================

/// The committed unit of work handed to [`Command::complete`].
pub struct Receipt<C: Command> {
    command: Arc<Entity<C>>,
    events: Vec<Arc<Entity<C::Event>>>,
}

impl<C: Command> Receipt<C> {
    pub(crate) fn new(command: Arc<Entity<C>>, events: Vec<Arc<Entity<C::Event>>>) -> Self {
        Self { command, events }
    }

    pub fn command(&self) -> &Arc<Entity<C>> {
        &self.command
    }

    /// Committed events, in derivation order.
    pub fn events(&self) -> &[Arc<Entity<C::Event>>] {
        &self.events
    }

    pub fn id(&self) -> EntityId {
        self.command.id()
    }

    pub fn timestamp(&self) -> Option<HybridTimestamp> {
        self.command.timestamp()
    }

    /// Entities committed in this unit: the command plus its events.
    pub fn count(&self) -> usize {
        self.events.len() + 1
    }
}

impl<C: Command> fmt::Debug for Receipt<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receipt")
            .field("command", &self.command)
            .field("events", &self.events)
            .finish()
    }
}
