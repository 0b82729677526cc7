//! The staged command pipeline.
//!
//! ```text
//! submit ──► [queue] ──► timestamp stage ──► [hand-off] ──► worker pool
//!                        (one task, FIFO)                   derive → commit → complete
//!                                                           release locks → reply
//! ```
//!
//! - The **timestamp stage** is a single task, so commands are stamped in
//!   exactly the order they were queued. It does no I/O.
//! - **Workers** process whole commands. Different commands run in
//!   parallel; one command always goes derive, commit, complete in order.
//! - Every failure path converges on: release the command's locks, resolve
//!   its [`Pending`] with the error, move on.
//!
//! # Timestamps for events
//!
//! The timestamp stage reserves `max_events_per_command` logical slots after
//! each command's timestamp. Event `i` is stamped `command.offset(i)`, which
//! keeps every event strictly between its command and the next command even
//! though derivation runs after later commands were stamped.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::task::{Context, Poll};

use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::clock::{HybridClock, HybridTimestamp};
use crate::config::{Backpressure, PipelineConfig};
use crate::context::DerivationContext;
use crate::core::{Command, Entity, EntityId, Receipt};
use crate::error::{extract_panic_message, CommandError, DerivationError, Stage};
use crate::journal::{Journal, JournalError, JournalListener, Listeners};
use crate::lifecycle::{Lifecycle, LifecycleError, Service, ServiceState};
use crate::lock::LockProvider;
use crate::registry::EntityRegistry;
use crate::tracking::TrackingLockProvider;

type Reply<C> = oneshot::Sender<Result<<C as Command>::Output, CommandError>>;

// =============================================================================
// Dependencies
// =============================================================================

/// Shared, growable set of journal listeners.
///
/// Each command takes a snapshot when it starts committing, so listeners
/// added later see only later commits.
pub struct ListenerSet<C: Command> {
    inner: Arc<RwLock<Vec<Arc<dyn JournalListener<C>>>>>,
}

impl<C: Command> ListenerSet<C> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn add(&self, listener: Arc<dyn JournalListener<C>>) {
        match self.inner.write() {
            Ok(mut guard) => guard.push(listener),
            Err(poisoned) => {
                warn!("listener set was poisoned, recovering");
                poisoned.into_inner().push(listener)
            }
        }
    }

    pub fn snapshot(&self) -> Vec<Arc<dyn JournalListener<C>>> {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => {
                warn!("listener set was poisoned, recovering");
                poisoned.into_inner().clone()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<C: Command> Clone for ListenerSet<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Command> Default for ListenerSet<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Collaborators every pipeline of a repository shares.
pub struct PipelineDeps<C: Command> {
    pub journal: Arc<dyn Journal<C>>,
    pub locks: Arc<dyn LockProvider>,
    pub clock: Arc<HybridClock>,
    pub registry: Arc<EntityRegistry>,
    pub listeners: ListenerSet<C>,
}

impl<C: Command> PipelineDeps<C> {
    pub fn new(
        journal: Arc<dyn Journal<C>>,
        locks: Arc<dyn LockProvider>,
        registry: EntityRegistry,
    ) -> Self {
        Self {
            journal,
            locks,
            clock: Arc::new(HybridClock::new()),
            registry: Arc::new(registry),
            listeners: ListenerSet::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<HybridClock>) -> Self {
        self.clock = clock;
        self
    }
}

impl<C: Command> Clone for PipelineDeps<C> {
    fn clone(&self) -> Self {
        Self {
            journal: self.journal.clone(),
            locks: self.locks.clone(),
            clock: self.clock.clone(),
            registry: self.registry.clone(),
            listeners: self.listeners.clone(),
        }
    }
}

// =============================================================================
// Pending
// =============================================================================

/// Result of a submitted command, resolved exactly once.
///
/// Dropping it does not cancel the command; it still runs to completion.
pub struct Pending<C: Command> {
    id: EntityId,
    rx: oneshot::Receiver<Result<C::Output, CommandError>>,
}

impl<C: Command> Pending<C> {
    /// Id of the submitted command.
    pub fn id(&self) -> EntityId {
        self.id
    }
}

impl<C: Command> Future for Pending<C> {
    type Output = Result<C::Output, CommandError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|reply| reply.unwrap_or(Err(CommandError::PipelineGone)))
    }
}

impl<C: Command> std::fmt::Debug for Pending<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pending").field("id", &self.id).finish()
    }
}

// =============================================================================
// Pipeline
// =============================================================================

struct Submission<C: Command> {
    command: Entity<C>,
    reply: Reply<C>,
}

struct Stamped<C: Command> {
    command: Arc<Entity<C>>,
    timestamp: HybridTimestamp,
    reply: Reply<C>,
}

/// One ordered command pipeline.
pub struct Pipeline<C: Command> {
    index: usize,
    config: PipelineConfig,
    deps: PipelineDeps<C>,
    state: ServiceState,
    sender: Mutex<Option<mpsc::Sender<Submission<C>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<C: Command> Pipeline<C> {
    pub fn new(config: PipelineConfig, deps: PipelineDeps<C>) -> Self {
        Self::with_index(0, config, deps)
    }

    pub(crate) fn with_index(index: usize, config: PipelineConfig, deps: PipelineDeps<C>) -> Self {
        Self {
            index,
            config,
            deps,
            state: ServiceState::new(),
            sender: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Queue a command.
    ///
    /// Waits for a free slot under [`Backpressure::Block`]; fails with
    /// [`CommandError::QueueFull`] under [`Backpressure::Reject`]. The
    /// returned [`Pending`] resolves once the command has been processed.
    pub async fn submit(&self, command: Entity<C>) -> Result<Pending<C>, CommandError> {
        let id = command.id();
        if command.timestamp().is_some() {
            return Err(CommandError::AlreadySubmitted { id });
        }

        let sender = self.sender()?;
        let (reply, rx) = oneshot::channel();
        let submission = Submission { command, reply };

        match self.config.backpressure {
            Backpressure::Block => sender
                .send(submission)
                .await
                .map_err(|_| CommandError::PipelineGone)?,
            Backpressure::Reject => sender.try_send(submission).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => CommandError::QueueFull {
                    capacity: self.config.queue_capacity,
                },
                mpsc::error::TrySendError::Closed(_) => CommandError::PipelineGone,
            })?,
        }

        Ok(Pending { id, rx })
    }

    /// Stop accepting commands and wait for every queued one to finish.
    pub async fn shutdown(&self) -> Result<(), LifecycleError> {
        self.stop()?;

        let tasks = std::mem::take(&mut *lock_or_recover(&self.tasks));
        for task in tasks {
            if let Err(e) = task.await {
                error!(pipeline = self.index, error = %e, "pipeline task failed");
            }
        }
        debug!(pipeline = self.index, "pipeline drained");
        Ok(())
    }

    fn sender(&self) -> Result<mpsc::Sender<Submission<C>>, CommandError> {
        lock_or_recover(&self.sender)
            .as_ref()
            .cloned()
            .ok_or(CommandError::NotRunning {
                state: self.state.get(),
            })
    }
}

impl<C: Command> Service for Pipeline<C> {
    fn lifecycle(&self) -> Lifecycle {
        self.state.get()
    }

    fn start(&self) -> Result<(), LifecycleError> {
        let runtime = Handle::try_current()
            .map_err(|_| LifecycleError::NoRuntime { service: "pipeline" })?;
        self.state.start()?;

        let capacity = self.config.queue_capacity.max(1);
        let workers = self.config.workers.max(1);
        // Every command may yield at least one event.
        let max_events = self.config.max_events_per_command.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let (stamped_tx, stamped_rx) = mpsc::channel(capacity);
        let stamped_rx = Arc::new(tokio::sync::Mutex::new(stamped_rx));

        let mut tasks = Vec::with_capacity(workers + 1);
        tasks.push(runtime.spawn(
            run_timestamps(rx, stamped_tx, self.deps.clock.clone(), max_events)
                .instrument(info_span!("timestamps", pipeline = self.index)),
        ));
        for worker in 0..workers {
            tasks.push(runtime.spawn(
                run_worker(stamped_rx.clone(), self.deps.clone(), max_events)
                    .instrument(info_span!("worker", pipeline = self.index, worker)),
            ));
        }

        *lock_or_recover(&self.sender) = Some(tx);
        *lock_or_recover(&self.tasks) = tasks;

        info!(
            pipeline = self.index,
            capacity,
            workers,
            max_events,
            backpressure = ?self.config.backpressure,
            "pipeline started"
        );
        Ok(())
    }

    /// Close the queue. Already queued commands still run to completion.
    fn stop(&self) -> Result<(), LifecycleError> {
        if self.state.stop()? {
            lock_or_recover(&self.sender).take();
            info!(pipeline = self.index, "pipeline stopped");
        }
        Ok(())
    }
}

impl<C: Command> std::fmt::Debug for Pipeline<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("index", &self.index)
            .field("state", &self.state.get())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("pipeline mutex was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

// =============================================================================
// Stages
// =============================================================================

/// Stage 1: stamp commands in queue order and hand them to the workers.
async fn run_timestamps<C: Command>(
    mut rx: mpsc::Receiver<Submission<C>>,
    tx: mpsc::Sender<Stamped<C>>,
    clock: Arc<HybridClock>,
    reserve: u64,
) {
    while let Some(Submission { command, reply }) = rx.recv().await {
        let timestamp = clock.reserve(reserve);
        if !command.stamp(timestamp) {
            let _ = reply.send(Err(CommandError::AlreadySubmitted { id: command.id() }));
            continue;
        }

        let stamped = Stamped {
            command: Arc::new(command),
            timestamp,
            reply,
        };
        if let Err(mpsc::error::SendError(stamped)) = tx.send(stamped).await {
            // Workers are gone; nothing left to process this.
            let _ = stamped.reply.send(Err(CommandError::PipelineGone));
        }
    }
    debug!("timestamp stage finished");
}

/// Stages 2-3: one whole command at a time.
async fn run_worker<C: Command>(
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Stamped<C>>>>,
    deps: PipelineDeps<C>,
    max_events: u64,
) {
    loop {
        let next = rx.lock().await.recv().await;
        let Some(Stamped {
            command,
            timestamp,
            reply,
        }) = next
        else {
            break;
        };

        let result = process(&deps, command, timestamp, max_events).await;
        // The caller may have dropped its Pending; the work is done regardless.
        let _ = reply.send(result);
    }
    debug!("worker finished");
}

/// Closes the command's lock tracker on drop if the normal path never got
/// there.
struct LockScope {
    locks: TrackingLockProvider,
    released: bool,
}

impl LockScope {
    fn new(locks: TrackingLockProvider) -> Self {
        Self {
            locks,
            released: false,
        }
    }

    fn release(mut self) -> usize {
        self.released = true;
        self.locks.close()
    }
}

impl Drop for LockScope {
    fn drop(&mut self) {
        if !self.released {
            let released = self.locks.close();
            warn!(released, "command abandoned, released its locks");
        }
    }
}

async fn process<C: Command>(
    deps: &PipelineDeps<C>,
    command: Arc<Entity<C>>,
    timestamp: HybridTimestamp,
    max_events: u64,
) -> Result<C::Output, CommandError> {
    let span = info_span!(
        "command",
        id = %command.id(),
        entity_type = command.payload().entity_type(),
        %timestamp,
    );

    async move {
        let locks = TrackingLockProvider::new(deps.locks.clone());
        locks.start()?;
        let scope = LockScope::new(locks.clone());

        let result = run_unit(deps, &command, timestamp, max_events, locks).await;

        // Locks go before the caller hears back, on every path.
        let released = scope.release();
        match &result {
            Ok(_) => debug!(released, "command completed"),
            Err(e) if e.is_rejection() => debug!(released, error = %e, "command rejected"),
            Err(e) => warn!(released, error = %e, "command failed"),
        }
        result
    }
    .instrument(span)
    .await
}

async fn run_unit<C: Command>(
    deps: &PipelineDeps<C>,
    command: &Arc<Entity<C>>,
    timestamp: HybridTimestamp,
    max_events: u64,
    locks: TrackingLockProvider,
) -> Result<C::Output, CommandError> {
    // Derive
    let ctx = DerivationContext::new(command.clone(), timestamp, deps.journal.clone(), locks);
    let derived = AssertUnwindSafe(command.payload().events(&ctx))
        .catch_unwind()
        .await;
    let stream = match derived {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(e.into()),
        Err(panic_info) => {
            let message = extract_panic_message(&panic_info);
            error!(panic = %message, "derivation panicked");
            return Err(CommandError::Panicked {
                stage: Stage::Derivation,
                message,
            });
        }
    };

    // Stamp events as the journal pulls them
    let cause = command.id();
    let registry = deps.registry.clone();
    let mut seq: u64 = 0;
    let events = stream.catch_panics().and_then_each(move |payload: C::Event| {
        seq += 1;
        if seq > max_events {
            return Err(DerivationError::TooManyEvents { limit: max_events });
        }
        let entity_type = crate::core::Event::entity_type(&payload);
        if !registry.knows_event(entity_type) {
            return Err(DerivationError::UnknownEventType { entity_type });
        }
        let event = Entity::caused_by(payload, cause);
        event.stamp(timestamp.offset(seq));
        Ok(event)
    });

    // Commit
    let collector = ReceiptCollector::<C>::new();
    let extra = deps.listeners.snapshot();
    let mut listeners = Listeners::new().with(&collector);
    for listener in &extra {
        listeners = listeners.with(listener.as_ref());
    }

    let committed = AssertUnwindSafe(deps.journal.commit(command.clone(), events, &listeners))
        .catch_unwind()
        .await;
    match committed {
        Ok(Ok(count)) => debug!(count, "unit committed"),
        Ok(Err(e)) => return Err(e.into()),
        Err(panic_info) => {
            let message = extract_panic_message(&panic_info);
            error!(panic = %message, "journal commit panicked");
            // Listeners still need an outcome, unless the journal gave one.
            if !collector.reported() {
                listeners.on_abort(&JournalError::Backend(anyhow::anyhow!(
                    "commit panicked: {message}"
                )));
            }
            return Err(CommandError::Panicked {
                stage: Stage::Commit,
                message,
            });
        }
    }

    // Complete
    let receipt = Receipt::new(command.clone(), collector.into_events());
    match std::panic::catch_unwind(AssertUnwindSafe(|| command.payload().complete(&receipt))) {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(CommandError::Completion(e)),
        Err(panic_info) => {
            let message = extract_panic_message(&panic_info);
            error!(panic = %message, "completion hook panicked");
            Err(CommandError::Panicked {
                stage: Stage::Completion,
                message,
            })
        }
    }
}

/// Collects the committed events of one unit for its [`Receipt`].
struct ReceiptCollector<C: Command> {
    events: Mutex<Vec<Arc<Entity<C::Event>>>>,
    reported: AtomicBool,
}

impl<C: Command> ReceiptCollector<C> {
    fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            reported: AtomicBool::new(false),
        }
    }

    /// Whether the journal delivered `on_commit` or `on_abort`.
    fn reported(&self) -> bool {
        self.reported.load(Ordering::SeqCst)
    }

    fn into_events(self) -> Vec<Arc<Entity<C::Event>>> {
        match self.events.into_inner() {
            Ok(events) => events,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<C: Command> JournalListener<C> for ReceiptCollector<C> {
    fn on_event(&self, event: &Arc<Entity<C::Event>>) {
        lock_or_recover(&self.events).push(event.clone());
    }

    fn on_commit(&self) {
        self.reported.store(true, Ordering::SeqCst);
    }

    fn on_abort(&self, _cause: &JournalError) {
        self.reported.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LocalLockProvider;
    use crate::memory::MemoryJournal;
    use crate::testing::fixtures::{self, Ledger};
    use crate::lock::LockError;
    use crate::testing::{CountingLockProvider, FailingJournal, PanickingListener, RecordingListener};
    use std::time::Duration;

    struct Harness {
        pipeline: Pipeline<Ledger>,
        journal: Arc<MemoryJournal<Ledger>>,
        locks: Arc<CountingLockProvider>,
    }

    fn harness(config: PipelineConfig) -> Harness {
        let journal = Arc::new(MemoryJournal::<Ledger>::new());
        journal.start().unwrap();
        let locks = Arc::new(CountingLockProvider::new());
        locks.start().unwrap();

        let deps = PipelineDeps::<Ledger>::new(journal.clone(), locks.clone(), fixtures::registry());
        let pipeline = Pipeline::new(config, deps);
        pipeline.start().unwrap();
        Harness {
            pipeline,
            journal,
            locks,
        }
    }

    async fn run(h: &Harness, command: Ledger) -> (EntityId, Result<usize, CommandError>) {
        let pending = h.pipeline.submit(Entity::new(command)).await.unwrap();
        let id = pending.id();
        (id, pending.await)
    }

    #[tokio::test]
    async fn test_happy_path_commits_and_returns_output() {
        let h = harness(PipelineConfig::default());
        let (id, result) = run(&h, fixtures::post("acc", &[5, 7])).await;

        assert_eq!(result.unwrap(), 3);
        let record = h.journal.get(id).await.unwrap().unwrap();
        assert!(record.timestamp().is_some());
        assert_eq!(h.journal.len().await.unwrap(), 3);
        assert_eq!(h.locks.locks(), 1);
        assert_eq!(h.locks.unlocks(), 1);
    }

    #[tokio::test]
    async fn test_events_are_stamped_after_command() {
        let h = harness(PipelineConfig::default());
        let (id, result) = run(&h, fixtures::post("acc", &[1, 2, 3])).await;
        result.unwrap();

        let command_ts = h.journal.get(id).await.unwrap().unwrap().timestamp().unwrap();
        let mut event_ts = Vec::new();
        for event_id in h.journal.iterate("Posted").await.unwrap() {
            let record = h.journal.get(event_id).await.unwrap().unwrap();
            assert_eq!(record.cause(), Some(id));
            event_ts.push(record.timestamp().unwrap());
        }
        event_ts.sort();

        assert_eq!(
            event_ts,
            vec![command_ts.offset(1), command_ts.offset(2), command_ts.offset(3)]
        );
    }

    #[tokio::test]
    async fn test_rejection_commits_nothing() {
        let h = harness(PipelineConfig::default());
        let (id, result) = run(&h, fixtures::reject("no funds")).await;

        let err = result.unwrap_err();
        assert!(err.is_rejection());
        assert!(h.journal.get(id).await.unwrap().is_none());
        assert_eq!(h.journal.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_derivation_panic_is_captured() {
        let h = harness(PipelineConfig::default());
        let (_, result) = run(&h, Ledger::PanicInDerivation).await;

        assert!(matches!(
            result,
            Err(CommandError::Panicked {
                stage: Stage::Derivation,
                ..
            })
        ));

        // The worker survived
        let (_, result) = run(&h, fixtures::post("acc", &[1])).await;
        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_stream_panic_releases_locks() {
        let h = harness(PipelineConfig::default().with_workers(1));
        let (id, result) = run(
            &h,
            Ledger::PanicInStream {
                keys: vec!["a".into(), "b".into()],
                after: 2,
            },
        )
        .await;

        assert!(matches!(
            result,
            Err(CommandError::Panicked {
                stage: Stage::Derivation,
                ..
            })
        ));
        assert!(h.journal.get(id).await.unwrap().is_none());
        assert_eq!(h.locks.locks(), 2);
        assert_eq!(h.locks.unlocks(), 2);
    }

    #[tokio::test]
    async fn test_completion_failure_is_durable() {
        let h = harness(PipelineConfig::default());
        let (id, result) = run(&h, Ledger::FailCompletion).await;

        let err = result.unwrap_err();
        assert!(matches!(err, CommandError::Completion(_)));
        assert!(err.is_durable());
        assert!(h.journal.get(id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_completion_panic_is_captured() {
        let h = harness(PipelineConfig::default());
        let (id, result) = run(&h, Ledger::PanicInCompletion).await;

        assert!(matches!(
            result,
            Err(CommandError::Panicked {
                stage: Stage::Completion,
                ..
            })
        ));
        assert!(h.journal.get(id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_too_many_events() {
        let h = harness(PipelineConfig::default().with_max_events_per_command(3));
        let (id, result) = run(&h, Ledger::Burst { count: 4 }).await;

        assert!(matches!(
            result,
            Err(CommandError::Derivation(DerivationError::TooManyEvents { limit: 3 }))
        ));
        assert!(h.journal.get(id).await.unwrap().is_none());

        let (_, result) = run(&h, Ledger::Burst { count: 3 }).await;
        assert_eq!(result.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_unknown_event_type_aborts() {
        let h = harness(PipelineConfig::default());
        let (_, result) = run(&h, Ledger::Unregistered).await;

        assert!(matches!(
            result,
            Err(CommandError::Derivation(DerivationError::UnknownEventType {
                entity_type: "Stray"
            }))
        ));
        assert_eq!(h.journal.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_already_submitted() {
        let h = harness(PipelineConfig::default());
        let command = Entity::new(fixtures::post("acc", &[1]));
        command.stamp(HybridTimestamp::new(1, 0));

        let err = h.pipeline.submit(command).await.unwrap_err();
        assert!(matches!(err, CommandError::AlreadySubmitted { .. }));
    }

    #[tokio::test]
    async fn test_listeners_see_commit() {
        let h = harness(PipelineConfig::default());
        let listener = Arc::new(RecordingListener::<Ledger>::new());
        h.pipeline.deps.listeners.add(listener.clone());

        run(&h, fixtures::post("acc", &[1, 2])).await.1.unwrap();
        run(&h, fixtures::reject("nope")).await.1.unwrap_err();

        assert_eq!(listener.kinds(), vec!["event", "event", "commit"]);
    }

    #[tokio::test]
    async fn test_panicking_abort_listener_does_not_kill_worker() {
        let h = harness(PipelineConfig::default().with_workers(1));
        let recorder = Arc::new(RecordingListener::<Ledger>::new());
        h.pipeline
            .deps
            .listeners
            .add(Arc::new(PanickingListener::panics_on_abort()));
        h.pipeline.deps.listeners.add(recorder.clone());

        let (_, failed) = run(
            &h,
            Ledger::LockAndFailMidStream {
                keys: vec!["m".into()],
                after: 2,
            },
        )
        .await;
        assert!(matches!(failed, Err(CommandError::Derivation(_))));

        // The only worker is still there for an unrelated command.
        let (_, result) = run(&h, fixtures::post("other", &[1])).await;
        assert_eq!(result.unwrap(), 2);

        assert_eq!(recorder.kinds(), vec!["abort", "event", "commit"]);
        assert_eq!(h.locks.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_panicking_commit_listener_keeps_unit_committed() {
        let h = harness(PipelineConfig::default());
        let recorder = Arc::new(RecordingListener::<Ledger>::new());
        h.pipeline
            .deps
            .listeners
            .add(Arc::new(PanickingListener::panics_on_commit()));
        h.pipeline.deps.listeners.add(recorder.clone());

        let (id, result) = run(&h, fixtures::post("acc", &[1, 2])).await;

        assert_eq!(result.unwrap(), 3);
        assert!(h.journal.get(id).await.unwrap().is_some());
        assert_eq!(recorder.kinds(), vec!["event", "event", "commit"]);
    }

    #[tokio::test]
    async fn test_zero_max_events_allows_one_event() {
        let h = harness(PipelineConfig::default().with_max_events_per_command(0));

        let (_, result) = run(&h, fixtures::post("acc", &[1])).await;
        assert_eq!(result.unwrap(), 2);

        let (_, result) = run(&h, Ledger::Burst { count: 2 }).await;
        assert!(matches!(
            result,
            Err(CommandError::Derivation(DerivationError::TooManyEvents { limit: 1 }))
        ));
    }

    #[tokio::test]
    async fn test_lock_scope_closes_escaped_tracker() {
        let h = harness(PipelineConfig::default());
        let tracker = TrackingLockProvider::new(h.locks.clone());
        tracker.start().unwrap();
        let escaped = tracker.clone();
        escaped.lock("x").await.unwrap();

        assert_eq!(LockScope::new(tracker).release(), 1);

        assert!(matches!(
            escaped.lock("y").await,
            Err(LockError::NotRunning {
                state: Lifecycle::Stopped
            })
        ));
        assert_eq!(h.locks.locks(), 1);
        assert_eq!(h.locks.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_dropped_lock_scope_closes_tracker() {
        let h = harness(PipelineConfig::default());
        let tracker = TrackingLockProvider::new(h.locks.clone());
        tracker.start().unwrap();
        tracker.lock("x").await.unwrap();

        drop(LockScope::new(tracker.clone()));

        assert_eq!(tracker.lifecycle(), Lifecycle::Stopped);
        assert!(tracker.lock("y").await.is_err());
        assert_eq!(h.locks.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_commit_failure_releases_locks() {
        let journal = Arc::new(FailingJournal::<Ledger>::new());
        journal.start().unwrap();
        journal.fail_commits(true);
        let locks = Arc::new(CountingLockProvider::new());
        locks.start().unwrap();

        let deps = PipelineDeps::<Ledger>::new(journal.clone(), locks.clone(), fixtures::registry());
        let pipeline = Pipeline::new(PipelineConfig::default(), deps);
        pipeline.start().unwrap();

        let result = pipeline
            .submit(Entity::new(fixtures::post("acc", &[1])))
            .await
            .unwrap()
            .await;

        assert!(matches!(result, Err(CommandError::Commit(JournalError::Backend(_)))));
        assert_eq!(locks.unlocks(), 1);
        assert_eq!(journal.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_commit_panic_is_captured() {
        let journal = Arc::new(FailingJournal::<Ledger>::new());
        journal.start().unwrap();
        journal.panic_commits(true);
        let locks = Arc::new(CountingLockProvider::new());
        locks.start().unwrap();
        let listener = Arc::new(RecordingListener::<Ledger>::new());

        let deps = PipelineDeps::<Ledger>::new(journal.clone(), locks.clone(), fixtures::registry());
        deps.listeners.add(listener.clone());
        let pipeline = Pipeline::new(PipelineConfig::default(), deps);
        pipeline.start().unwrap();

        let result = pipeline
            .submit(Entity::new(fixtures::post("acc", &[1])))
            .await
            .unwrap()
            .await;

        assert!(matches!(
            result,
            Err(CommandError::Panicked {
                stage: Stage::Commit,
                ..
            })
        ));
        assert_eq!(locks.unlocks(), 1);
        assert_eq!(listener.kinds(), vec!["abort"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reject_backpressure_reports_queue_full() {
        let journal = Arc::new(MemoryJournal::<Ledger>::new());
        journal.start().unwrap();
        let locks = Arc::new(LocalLockProvider::new());
        locks.start().unwrap();

        let deps = PipelineDeps::<Ledger>::new(journal.clone(), locks.clone(), fixtures::registry());
        let pipeline = Pipeline::new(
            PipelineConfig::default()
                .with_queue_capacity(1)
                .with_workers(1)
                .with_backpressure(Backpressure::Reject),
            deps,
        );
        pipeline.start().unwrap();

        // Hold the gate so the worker parks on the first command.
        let gate = locks.lock("gate").await.unwrap();

        let mut accepted = Vec::new();
        let mut rejected = None;
        for _ in 0..16 {
            match pipeline
                .submit(Entity::new(Ledger::Wait { key: "gate".into() }))
                .await
            {
                Ok(pending) => accepted.push(pending),
                Err(e) => {
                    rejected = Some(e);
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(matches!(
            rejected,
            Some(CommandError::QueueFull { capacity: 1 })
        ));

        gate.unlock();
        for pending in accepted {
            let result = tokio::time::timeout(Duration::from_secs(5), pending)
                .await
                .expect("accepted command should finish once the gate opens");
            assert_eq!(result.unwrap(), 2);
        }
    }

    #[tokio::test]
    async fn test_submit_when_not_running() {
        let journal = Arc::new(MemoryJournal::<Ledger>::new());
        let locks = Arc::new(LocalLockProvider::new());
        let deps = PipelineDeps::<Ledger>::new(journal, locks, fixtures::registry());
        let pipeline = Pipeline::new(PipelineConfig::default(), deps);

        let err = pipeline
            .submit(Entity::new(fixtures::post("acc", &[1])))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CommandError::NotRunning {
                state: Lifecycle::NotStarted
            }
        ));
    }

    #[test]
    fn test_start_without_runtime() {
        let journal = Arc::new(MemoryJournal::<Ledger>::new());
        let locks = Arc::new(LocalLockProvider::new());
        let deps = PipelineDeps::<Ledger>::new(journal, locks, fixtures::registry());
        let pipeline = Pipeline::new(PipelineConfig::default(), deps);

        assert_eq!(
            pipeline.start(),
            Err(LifecycleError::NoRuntime { service: "pipeline" })
        );
        assert_eq!(pipeline.lifecycle(), Lifecycle::NotStarted);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let h = harness(PipelineConfig::default());
        assert!(h.pipeline.start().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_commands() {
        let h = harness(PipelineConfig::default().with_workers(2));
        let mut pending = Vec::new();
        for n in 0..20 {
            pending.push(
                h.pipeline
                    .submit(Entity::new(fixtures::post(&format!("acc-{n}"), &[n])))
                    .await
                    .unwrap(),
            );
        }

        h.pipeline.shutdown().await.unwrap();
        assert_eq!(h.pipeline.lifecycle(), Lifecycle::Stopped);

        for p in pending {
            assert_eq!(p.await.unwrap(), 2);
        }
        assert!(matches!(
            h.pipeline.submit(Entity::new(fixtures::post("late", &[1]))).await,
            Err(CommandError::NotRunning {
                state: Lifecycle::Stopped
            })
        ));
    }

    #[tokio::test]
    async fn test_pending_resolves_gone_when_reply_dropped() {
        let (tx, rx) = oneshot::channel::<Result<usize, CommandError>>();
        let pending = Pending::<Ledger> {
            id: EntityId::new(),
            rx,
        };
        drop(tx);
        assert!(matches!(pending.await, Err(CommandError::PipelineGone)));
    }
}
