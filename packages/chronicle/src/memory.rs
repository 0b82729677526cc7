//! In-memory reference journal.
//!
//! Commits are staged outside any lock: the event stream is drained and
//! every payload normalized while other commits proceed. Only the final
//! publish step takes the write lock, and it inserts the whole unit at once,
//! so readers see either none of a unit or all of it.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::core::{Command, Entity, EntityId, Event};
use crate::journal::{Journal, JournalError, JournalListener, Record};
use crate::layout;
use crate::lifecycle::{Lifecycle, LifecycleError, Service, ServiceState};
use crate::stream::EventStream;

struct Contents<C: Command> {
    records: HashMap<EntityId, Record<C>>,
    by_type: HashMap<&'static str, Vec<EntityId>>,
}

impl<C: Command> Default for Contents<C> {
    fn default() -> Self {
        Self {
            records: HashMap::new(),
            by_type: HashMap::new(),
        }
    }
}

/// Journal that keeps everything in process memory.
pub struct MemoryJournal<C: Command> {
    state: ServiceState,
    contents: RwLock<Contents<C>>,
}

impl<C: Command> MemoryJournal<C> {
    pub fn new() -> Self {
        Self {
            state: ServiceState::new(),
            contents: RwLock::new(Contents::default()),
        }
    }

    fn ensure_running(&self) -> Result<(), JournalError> {
        match self.state.get() {
            Lifecycle::Running => Ok(()),
            state => Err(JournalError::NotRunning { state }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Contents<C>> {
        match self.contents.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("memory journal lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Contents<C>> {
        match self.contents.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("memory journal lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Drain the stream into canonical entities. Nothing is visible yet.
    async fn stage(
        &self,
        command: &Entity<C>,
        mut events: EventStream<Entity<C::Event>>,
    ) -> Result<(Arc<Entity<C>>, Vec<Arc<Entity<C::Event>>>), JournalError> {
        let payload = command.payload();
        let canonical = layout::normalize(payload.entity_type(), payload)?;
        let command = Arc::new(command.with_payload(canonical));

        let mut staged = Vec::new();
        while let Some(item) = events.next().await {
            let event = item?;
            let payload = event.payload();
            let canonical = layout::normalize(Event::entity_type(payload), payload)?;
            staged.push(Arc::new(event.with_payload(canonical)));
        }

        Ok((command, staged))
    }

    async fn try_commit(
        &self,
        command: &Entity<C>,
        events: EventStream<Entity<C::Event>>,
        listener: &dyn JournalListener<C>,
    ) -> Result<usize, JournalError> {
        self.ensure_running()?;
        let (command, staged) = self.stage(command, events).await?;
        self.publish(command, &staged)?;

        // Only recorded events are reported.
        for event in &staged {
            listener.on_event(event);
        }
        Ok(staged.len() + 1)
    }

    /// Insert a staged unit under one write lock.
    fn publish(
        &self,
        command: Arc<Entity<C>>,
        events: &[Arc<Entity<C::Event>>],
    ) -> Result<(), JournalError> {
        // Re-check under the lock so a concurrent stop cannot interleave.
        let mut contents = self.write();
        self.ensure_running()?;

        let mut unit_ids = HashSet::with_capacity(events.len() + 1);
        let ids = std::iter::once(command.id()).chain(events.iter().map(|e| e.id()));
        for id in ids {
            if contents.records.contains_key(&id) || !unit_ids.insert(id) {
                return Err(JournalError::DuplicateEntity { id });
            }
        }

        let Contents { records, by_type } = &mut *contents;

        let command_type = command.payload().entity_type();
        by_type.entry(command_type).or_default().push(command.id());
        records.insert(command.id(), Record::Command(command));

        for event in events {
            by_type
                .entry(Event::entity_type(event.payload()))
                .or_default()
                .push(event.id());
            records.insert(event.id(), Record::Event(event.clone()));
        }

        Ok(())
    }
}

impl<C: Command> Default for MemoryJournal<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Command> fmt::Debug for MemoryJournal<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryJournal")
            .field("state", &self.state.get())
            .field("entities", &self.read().records.len())
            .finish()
    }
}

impl<C: Command> Service for MemoryJournal<C> {
    fn lifecycle(&self) -> Lifecycle {
        self.state.get()
    }

    fn start(&self) -> Result<(), LifecycleError> {
        self.state.start()?;
        info!("memory journal started");
        Ok(())
    }

    fn stop(&self) -> Result<(), LifecycleError> {
        // Taking the write lock waits out any publish in progress.
        let contents = self.write();
        if self.state.stop()? {
            info!(entities = contents.records.len(), "memory journal stopped");
        }
        Ok(())
    }
}

#[async_trait]
impl<C: Command> Journal<C> for MemoryJournal<C> {
    async fn commit(
        &self,
        command: Arc<Entity<C>>,
        events: EventStream<Entity<C::Event>>,
        listener: &dyn JournalListener<C>,
    ) -> Result<usize, JournalError> {
        let id = command.id();

        match self.try_commit(&command, events, listener).await {
            Ok(count) => {
                debug!(%id, count, "unit committed");
                listener.on_commit();
                Ok(count)
            }
            Err(e) => {
                debug!(%id, error = %e, "unit aborted");
                listener.on_abort(&e);
                Err(e)
            }
        }
    }

    async fn get(&self, id: EntityId) -> Result<Option<Record<C>>, JournalError> {
        self.ensure_running()?;
        Ok(self.read().records.get(&id).cloned())
    }

    async fn iterate(&self, entity_type: &str) -> Result<Vec<EntityId>, JournalError> {
        self.ensure_running()?;
        Ok(self
            .read()
            .by_type
            .get(entity_type)
            .cloned()
            .unwrap_or_default())
    }

    async fn clear(&self) -> Result<(), JournalError> {
        self.ensure_running()?;
        let mut contents = self.write();
        let removed = contents.records.len();
        contents.records.clear();
        contents.by_type.clear();
        info!(removed, "memory journal cleared");
        Ok(())
    }

    async fn len(&self) -> Result<usize, JournalError> {
        self.ensure_running()?;
        Ok(self.read().records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::HybridTimestamp;
    use crate::error::DerivationError;
    use crate::journal::NoopListener;
    use crate::testing::fixtures::{Ledger, LedgerEvent};
    use crate::testing::{Observed, RecordingListener};

    fn running() -> MemoryJournal<Ledger> {
        let journal = MemoryJournal::new();
        journal.start().unwrap();
        journal
    }

    fn unit(amounts: &[i64]) -> (Arc<Entity<Ledger>>, Vec<Entity<LedgerEvent>>) {
        let command = Arc::new(Entity::new(Ledger::Post {
            account: "acc".into(),
            amounts: amounts.to_vec(),
        }));
        command.stamp(HybridTimestamp::new(1, 0));
        let events = amounts
            .iter()
            .enumerate()
            .map(|(i, &amount)| {
                let event = Entity::caused_by(
                    LedgerEvent::Posted {
                        account: "acc".into(),
                        amount,
                    },
                    command.id(),
                );
                event.stamp(HybridTimestamp::new(1, i as u64 + 1));
                event
            })
            .collect();
        (command, events)
    }

    #[tokio::test]
    async fn test_commit_makes_unit_visible() {
        let journal = running();
        let (command, events) = unit(&[10, 20]);
        let event_ids: Vec<_> = events.iter().map(|e| e.id()).collect();

        let count = journal
            .commit(command.clone(), EventStream::from_vec(events), &NoopListener)
            .await
            .unwrap();

        assert_eq!(count, 3);
        assert_eq!(journal.len().await.unwrap(), 3);

        let record = journal.get(command.id()).await.unwrap().unwrap();
        assert_eq!(record.entity_type(), "Post");
        for id in event_ids {
            let record = journal.get(id).await.unwrap().unwrap();
            assert_eq!(record.cause(), Some(command.id()));
            assert_eq!(record.entity_type(), "Posted");
        }
    }

    #[tokio::test]
    async fn test_listener_protocol_on_commit() {
        let journal = running();
        let listener = RecordingListener::<Ledger>::new();
        let (command, events) = unit(&[1, 2]);

        journal
            .commit(command, EventStream::from_vec(events), &listener)
            .await
            .unwrap();

        assert_eq!(
            listener.kinds(),
            vec!["event", "event", "commit"],
        );
    }

    #[tokio::test]
    async fn test_stream_error_aborts_unit() {
        let journal = running();
        let listener = RecordingListener::<Ledger>::new();
        let (command, mut events) = unit(&[1, 2]);
        let second = events.pop().unwrap();
        let first = events.pop().unwrap();

        let stream = EventStream::try_iter(vec![
            Ok(first),
            Err(DerivationError::rejected("halfway")),
            Ok(second),
        ]);

        let err = journal
            .commit(command.clone(), stream, &listener)
            .await
            .unwrap_err();

        assert!(matches!(err, JournalError::Derivation(_)));
        assert_eq!(journal.len().await.unwrap(), 0);
        assert!(journal.get(command.id()).await.unwrap().is_none());
        // The first event was staged but never recorded, so it is not reported.
        assert_eq!(listener.kinds(), vec!["abort"]);
        assert!(matches!(listener.observed().last(), Some(Observed::Abort(_))));
    }

    #[tokio::test]
    async fn test_duplicate_id_aborts_whole_unit() {
        let journal = running();
        let (command, events) = unit(&[1]);
        journal
            .commit(command.clone(), EventStream::from_vec(events), &NoopListener)
            .await
            .unwrap();

        // New command reusing an existing event id
        let (second, _) = unit(&[5]);
        let clash = Entity::with_id(
            command.id(),
            LedgerEvent::Posted {
                account: "acc".into(),
                amount: 5,
            },
        );
        let err = journal
            .commit(second.clone(), EventStream::from_vec(vec![clash]), &NoopListener)
            .await
            .unwrap_err();

        assert!(matches!(err, JournalError::DuplicateEntity { id } if id == command.id()));
        assert!(journal.get(second.id()).await.unwrap().is_none());
        assert_eq!(journal.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_within_unit() {
        let journal = running();
        let (command, _) = unit(&[]);
        let event = Entity::new(LedgerEvent::Posted {
            account: "acc".into(),
            amount: 1,
        });
        // Assign before cloning so both share the id
        let _ = event.id();
        let twin = event.clone();

        let err = journal
            .commit(command, EventStream::from_vec(vec![event, twin]), &NoopListener)
            .await
            .unwrap_err();
        assert!(matches!(err, JournalError::DuplicateEntity { .. }));
        assert_eq!(journal.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_iterate_in_commit_order() {
        let journal = running();
        let mut command_ids = Vec::new();
        for n in 0..5 {
            let (command, events) = unit(&[n]);
            command_ids.push(command.id());
            journal
                .commit(command, EventStream::from_vec(events), &NoopListener)
                .await
                .unwrap();
        }

        assert_eq!(journal.iterate("Post").await.unwrap(), command_ids);
        assert_eq!(journal.iterate("Posted").await.unwrap().len(), 5);
        assert!(journal.iterate("Unknown").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_iterate_is_snapshot() {
        let journal = running();
        let (command, events) = unit(&[1]);
        journal
            .commit(command, EventStream::from_vec(events), &NoopListener)
            .await
            .unwrap();

        let snapshot = journal.iterate("Post").await.unwrap();
        let (command, events) = unit(&[2]);
        journal
            .commit(command, EventStream::from_vec(events), &NoopListener)
            .await
            .unwrap();

        assert_eq!(snapshot.len(), 1);
        assert_eq!(journal.iterate("Post").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_clear() {
        let journal = running();
        let (command, events) = unit(&[1, 2, 3]);
        journal
            .commit(command.clone(), EventStream::from_vec(events), &NoopListener)
            .await
            .unwrap();

        journal.clear().await.unwrap();
        assert_eq!(journal.len().await.unwrap(), 0);
        assert!(journal.get(command.id()).await.unwrap().is_none());
        assert!(journal.iterate("Post").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_not_running() {
        let journal = MemoryJournal::<Ledger>::new();
        let listener = RecordingListener::<Ledger>::new();
        let (command, events) = unit(&[1]);

        let err = journal
            .commit(command, EventStream::from_vec(events), &listener)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            JournalError::NotRunning {
                state: Lifecycle::NotStarted
            }
        ));
        assert_eq!(listener.kinds(), vec!["abort"]);
        assert!(journal.get(EntityId::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_payloads_are_normalized() {
        let journal = running();
        let command = Arc::new(Entity::new(Ledger::Post {
            account: "acc".into(),
            amounts: vec![],
        }));
        let event = Entity::caused_by(
            LedgerEvent::Annotated {
                note: "hello".into(),
                scratch: Some("in-process only".into()),
            },
            command.id(),
        );
        let event_id = event.id();

        journal
            .commit(command, EventStream::from_vec(vec![event]), &NoopListener)
            .await
            .unwrap();

        let record = journal.get(event_id).await.unwrap().unwrap();
        match record.as_event().unwrap().payload() {
            LedgerEvent::Annotated { note, scratch } => {
                assert_eq!(note, "hello");
                assert_eq!(scratch, &None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_commits_are_each_atomic() {
        let journal = Arc::new(running());
        let mut tasks = Vec::new();

        for n in 0..32 {
            let journal = journal.clone();
            tasks.push(tokio::spawn(async move {
                let (command, events) = unit(&[n, n + 1, n + 2]);
                let id = command.id();
                // Interleave staging across tasks
                let stream = EventStream::from_stream(
                    futures::stream::iter(events).then(|e| async move {
                        tokio::task::yield_now().await;
                        Ok::<_, DerivationError>(e)
                    }),
                );
                journal.commit(command, stream, &NoopListener).await.map(|c| (id, c))
            }));
        }

        for task in tasks {
            let (id, count) = task.await.unwrap().unwrap();
            assert_eq!(count, 4);
            assert!(journal.get(id).await.unwrap().is_some());
        }
        assert_eq!(journal.len().await.unwrap(), 32 * 4);
    }
}
