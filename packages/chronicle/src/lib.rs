//! # Chronicle
//!
//! An embeddable event-sourcing engine: commands go in, derived events come
//! out, and each command together with its events is committed as one atomic
//! unit or not at all.
//!
//! ## Core Concepts
//!
//! - [`Command`] = a request to change state. Its only job is to derive
//!   events, then turn the committed result into a caller-facing output.
//! - [`Event`] = a fact the command produced.
//! - [`Entity`] = a payload plus its header: id, hybrid timestamp, cause.
//! - [`Journal`] = the append-only store. Readers see a whole unit or none
//!   of it.
//! - [`LockProvider`] = named mutual exclusion during derivation. Every lock
//!   a command takes is released when its unit ends, whatever the outcome.
//!
//! ## Architecture
//!
//! ```text
//! Repository.publish(cmd)
//!     │
//!     ▼ route by id
//! PipelineGroup ─► Pipeline
//!     │
//!     ├─► stage 1: stamp         (single task, clock order = queue order)
//!     │
//!     └─► stage 2: workers ──────────────────────────────┐
//!             │                                          │
//!             ├─► Command.events(ctx)  takes locks       │
//!             ├─► Journal.commit(cmd, events)  atomic    │
//!             ├─► Command.complete(receipt)              │
//!             └─► release locks, reply to caller ◄───────┘
//! ```
//!
//! ## Guarantees
//!
//! 1. **Atomic visibility** - a unit is fully visible or not visible at all
//! 2. **Ordered timestamps** - a command's events sit strictly between it and
//!    the next command stamped by the same clock
//! 3. **Lock release** - locks are released exactly once per unit
//! 4. **One outcome** - every accepted command resolves exactly once
//!
//! ## Example
//!
//! ```ignore
//! use chronicle::{Command, DerivationContext, DerivationError, EntityRegistry,
//!     Event, EventStream, Receipt, Repository, Service};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! enum BankEvent { Deposited { account: String, amount: i64 } }
//! impl Event for BankEvent {
//!     fn entity_type(&self) -> &'static str { "Deposited" }
//! }
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Deposit { account: String, amount: i64 }
//!
//! #[async_trait]
//! impl Command for Deposit {
//!     type Event = BankEvent;
//!     type Output = ();
//!
//!     fn entity_type(&self) -> &'static str { "Deposit" }
//!
//!     async fn events(&self, ctx: &DerivationContext<Self>)
//!         -> Result<EventStream<BankEvent>, DerivationError>
//!     {
//!         ctx.lock(&self.account).await?;
//!         Ok(EventStream::from_vec(vec![BankEvent::Deposited {
//!             account: self.account.clone(),
//!             amount: self.amount,
//!         }]))
//!     }
//!
//!     fn complete(&self, _receipt: &Receipt<Self>) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! let registry = EntityRegistry::builder()
//!     .with_command("Deposit")
//!     .with_event("Deposited")
//!     .build();
//!
//! let repo = Repository::<Deposit>::builder(registry).build();
//! repo.start()?;
//! repo.execute(Deposit { account: "a".into(), amount: 10 }).await?;
//! repo.shutdown().await?;
//! ```
//!
//! ## What This Is Not
//!
//! Chronicle does **not** ship durable storage, snapshots, or projections.
//! Plug a durable store in through [`Journal`]; build read models with
//! [`JournalListener`].

// Core modules
mod clock;
mod config;
mod context;
mod core;
mod dispatch;
mod error;
mod identity;
mod journal;
mod layout;
mod lifecycle;
mod lock;
mod memory;
mod pipeline;
mod registry;
mod repository;
mod stream;
mod tracking;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Re-export the entity model
pub use crate::core::{Command, Entity, EntityId, Event, Receipt};

// Re-export errors
pub use crate::error::{CommandError, DerivationError, Stage};

// Re-export infrastructure
pub use clock::{HybridClock, HybridTimestamp, PhysicalClock, SystemClock};
pub use config::{Backpressure, PipelineConfig};
pub use context::DerivationContext;
pub use dispatch::PipelineGroup;
pub use identity::IdentityPool;
pub use journal::{
    EntityHandle, Journal, JournalError, JournalListener, Listeners, NoopListener, Record,
};
pub use layout::LayoutError;
pub use lifecycle::{Lifecycle, LifecycleError, Service, ServiceState};
pub use lock::{LocalLockProvider, Lock, LockError, LockHandle, LockProvider};
pub use memory::MemoryJournal;
pub use pipeline::{ListenerSet, Pending, Pipeline, PipelineDeps};
pub use registry::{EntityDescriptor, EntityKind, EntityRegistry, EntityRegistryBuilder, RegistryError};
pub use repository::{Repository, RepositoryBuilder};
pub use stream::EventStream;
pub use tracking::TrackingLockProvider;

// Re-export async_trait for implementing Command, Journal, LockProvider
pub use async_trait::async_trait;
