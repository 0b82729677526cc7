//! Application-facing entry point.
//!
//! A [`Repository`] wires a journal, a lock provider, a clock, and the
//! registry of known types into a group of pipelines, and exposes
//! [`publish`](Repository::publish) as the one way to change state.
//!
//! ```ignore
//! let repo = Repository::builder(registry)
//!     .with_journal(Arc::new(MemoryJournal::new()))
//!     .with_config(PipelineConfig::from_env()?)
//!     .build();
//! repo.start()?;
//!
//! let balance = repo.execute(BankCommand::Deposit { account, amount: 50 }).await?;
//!
//! repo.shutdown().await?;
//! ```

use std::fmt;
use std::sync::Arc;

use tracing::{info, warn};

use crate::clock::HybridClock;
use crate::config::PipelineConfig;
use crate::core::{Command, Entity, EntityId};
use crate::dispatch::PipelineGroup;
use crate::error::CommandError;
use crate::journal::{EntityHandle, Journal, JournalError, JournalListener, Record};
use crate::lifecycle::{Lifecycle, LifecycleError, Service, ServiceState};
use crate::lock::{LocalLockProvider, LockProvider};
use crate::memory::MemoryJournal;
use crate::pipeline::{ListenerSet, Pending, PipelineDeps};
use crate::registry::{EntityKind, EntityRegistry};

/// Builder for [`Repository`].
///
/// Defaults: [`MemoryJournal`], [`LocalLockProvider`], system clock,
/// [`PipelineConfig::default`].
pub struct RepositoryBuilder<C: Command> {
    registry: EntityRegistry,
    journal: Option<Arc<dyn Journal<C>>>,
    locks: Option<Arc<dyn LockProvider>>,
    clock: Option<Arc<HybridClock>>,
    config: PipelineConfig,
    listeners: Vec<Arc<dyn JournalListener<C>>>,
}

impl<C: Command> RepositoryBuilder<C> {
    fn new(registry: EntityRegistry) -> Self {
        Self {
            registry,
            journal: None,
            locks: None,
            clock: None,
            config: PipelineConfig::default(),
            listeners: Vec::new(),
        }
    }

    pub fn with_journal(mut self, journal: Arc<dyn Journal<C>>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn with_lock_provider(mut self, locks: Arc<dyn LockProvider>) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn with_clock(mut self, clock: Arc<HybridClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Listener notified of every commit, e.g. an indexer.
    pub fn with_listener(mut self, listener: Arc<dyn JournalListener<C>>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn build(self) -> Repository<C> {
        let journal = self
            .journal
            .unwrap_or_else(|| Arc::new(MemoryJournal::<C>::new()));
        let locks = self
            .locks
            .unwrap_or_else(|| Arc::new(LocalLockProvider::new()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(HybridClock::new()));
        let registry = Arc::new(self.registry);

        let listeners = ListenerSet::new();
        for listener in self.listeners {
            listeners.add(listener);
        }

        let deps = PipelineDeps {
            journal: journal.clone(),
            locks: locks.clone(),
            clock: clock.clone(),
            registry: registry.clone(),
            listeners: listeners.clone(),
        };

        Repository {
            state: ServiceState::new(),
            pipelines: PipelineGroup::new(self.config.clone(), deps),
            config: self.config,
            registry,
            journal,
            locks,
            clock,
            listeners,
        }
    }
}

/// Owns the pipelines, journal, lock provider, and type registry.
pub struct Repository<C: Command> {
    state: ServiceState,
    pipelines: PipelineGroup<C>,
    config: PipelineConfig,
    registry: Arc<EntityRegistry>,
    journal: Arc<dyn Journal<C>>,
    locks: Arc<dyn LockProvider>,
    clock: Arc<HybridClock>,
    listeners: ListenerSet<C>,
}

impl<C: Command> Repository<C> {
    pub fn builder(registry: EntityRegistry) -> RepositoryBuilder<C> {
        RepositoryBuilder::new(registry)
    }

    /// Queue a command. The returned future resolves with the completion
    /// hook's output, or with the error that stopped the command.
    pub async fn publish(&self, command: C) -> Result<Pending<C>, CommandError> {
        self.publish_entity(Entity::new(command)).await
    }

    /// Like [`publish`](Self::publish) for a caller-built entity, e.g. one
    /// whose id the caller needs before submitting.
    pub async fn publish_entity(&self, command: Entity<C>) -> Result<Pending<C>, CommandError> {
        let state = self.state.get();
        if state != Lifecycle::Running {
            return Err(CommandError::NotRunning { state });
        }

        let entity_type = command.payload().entity_type();
        if !self.registry.knows_command(entity_type) {
            return Err(CommandError::UnknownCommandType { entity_type });
        }

        self.pipelines.submit(command).await
    }

    /// Publish and wait for the result.
    pub async fn execute(&self, command: C) -> Result<C::Output, CommandError> {
        self.publish(command).await?.await
    }

    /// Look up a committed entity.
    pub async fn get(&self, id: EntityId) -> Result<Option<Record<C>>, JournalError> {
        self.journal.get(id).await
    }

    /// Handles to committed entities of a registered type, in commit order.
    pub async fn iterate(&self, entity_type: &str) -> Result<Vec<EntityHandle<C>>, JournalError> {
        if !self.registry.knows(entity_type) {
            return Err(JournalError::UnknownType {
                entity_type: entity_type.to_string(),
            });
        }

        let ids = self.journal.iterate(entity_type).await?;
        Ok(ids
            .into_iter()
            .map(|id| EntityHandle::new(id, self.journal.clone()))
            .collect())
    }

    /// Register a listener for commits from now on.
    pub fn add_listener(&self, listener: Arc<dyn JournalListener<C>>) {
        self.listeners.add(listener);
    }

    pub fn journal(&self) -> &Arc<dyn Journal<C>> {
        &self.journal
    }

    pub fn lock_provider(&self) -> &Arc<dyn LockProvider> {
        &self.locks
    }

    pub fn clock(&self) -> &Arc<HybridClock> {
        &self.clock
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Close the queues, wait for every queued command to finish, then stop
    /// the journal and the lock provider.
    pub async fn shutdown(&self) -> Result<(), LifecycleError> {
        self.state.stop()?;
        self.pipelines.shutdown().await?;
        self.journal.stop()?;
        self.locks.stop()?;
        info!("repository shut down");
        Ok(())
    }
}

impl<C: Command> Service for Repository<C> {
    fn lifecycle(&self) -> Lifecycle {
        self.state.get()
    }

    /// Start the journal and lock provider (unless already running), then
    /// the pipelines.
    fn start(&self) -> Result<(), LifecycleError> {
        self.state.start()?;

        let started = start_if_needed(self.journal.as_ref())
            .and_then(|_| start_if_needed(self.locks.as_ref()))
            .and_then(|_| self.pipelines.start());

        if let Err(e) = started {
            warn!(error = %e, "repository failed to start");
            let _ = self.state.fail();
            return Err(e);
        }

        info!(
            pipelines = self.pipelines.len(),
            commands = self
                .registry
                .descriptors()
                .filter(|d| d.kind == EntityKind::Command)
                .count(),
            "repository started"
        );
        Ok(())
    }

    /// Close the queues without waiting. Commands already queued still run;
    /// use [`Repository::shutdown`] to wait for them.
    fn stop(&self) -> Result<(), LifecycleError> {
        if self.state.stop()? {
            self.pipelines.stop()?;
            info!("repository stopped");
        }
        Ok(())
    }
}

fn start_if_needed<S: Service + ?Sized>(service: &S) -> Result<(), LifecycleError> {
    if service.lifecycle() == Lifecycle::NotStarted {
        service.start()
    } else {
        Ok(())
    }
}

impl<C: Command> fmt::Debug for Repository<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("state", &self.state.get())
            .field("pipelines", &self.pipelines)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
