//! Aggregate repository

use crate::aggregate::{Aggregate, AggregateError, Snapshot};
use crate::store::{EventStore, ExpectedVersion};
use std::marker::PhantomData;
use std::sync::Arc;
use strata_events::{DomainEvent, EventBus};
use tracing::{debug, warn};

/// Aggregate repository
///
/// Loads aggregates by replaying their stream (starting from a snapshot when
/// one exists) and saves them by appending pending events under optimistic
/// concurrency and then publishing them on the event bus.
pub struct AggregateRepository<A>
where
    A: Aggregate,
{
    store: Arc<dyn EventStore>,
    bus: EventBus,
    snapshot_frequency: Option<u64>,
    _phantom: PhantomData<A>,
}

impl<A> AggregateRepository<A>
where
    A: Aggregate,
{
    /// Create new repository
    pub fn new(store: Arc<dyn EventStore>, bus: EventBus) -> Self {
        Self {
            store,
            bus,
            snapshot_frequency: None,
            _phantom: PhantomData,
        }
    }

    /// Create repository that snapshots every `frequency` events
    ///
    /// A frequency of zero disables snapshots.
    pub fn with_snapshots(store: Arc<dyn EventStore>, bus: EventBus, frequency: u64) -> Self {
        Self {
            store,
            bus,
            snapshot_frequency: (frequency > 0).then_some(frequency),
            _phantom: PhantomData,
        }
    }

    /// The underlying event store
    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// The bus saved events are published on
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Load aggregate by ID
    pub async fn get(&self, aggregate_id: &str) -> Result<A, AggregateError> {
        if let Some(snapshot) = self.store.get_snapshot(aggregate_id).await? {
            let mut aggregate = A::new_instance(aggregate_id.to_string());
            match aggregate.restore_state(snapshot.state) {
                Ok(()) => {
                    aggregate.root_mut().version = snapshot.version;
                    let tail = self.store.get_events(aggregate_id, snapshot.version).await?;
                    aggregate.load_from_history(&tail)?;
                    return Ok(aggregate);
                }
                Err(err) => {
                    warn!(
                        aggregate_id,
                        aggregate_type = A::aggregate_type(),
                        snapshot_version = snapshot.version,
                        error = %err,
                        "Snapshot restore failed, replaying full stream"
                    );
                }
            }
        }

        let events = self.store.get_events(aggregate_id, 0).await?;
        if events.is_empty() {
            return Err(AggregateError::NotFound(aggregate_id.to_string()));
        }

        let mut aggregate = A::new_instance(aggregate_id.to_string());
        aggregate.load_from_history(&events)?;
        Ok(aggregate)
    }

    /// Whether an aggregate has any stored history
    pub async fn exists(&self, aggregate_id: &str) -> Result<bool, AggregateError> {
        if self.store.stream_version(aggregate_id).await? > 0 {
            return Ok(true);
        }
        Ok(self.store.get_snapshot(aggregate_id).await?.is_some())
    }

    /// Save aggregate
    ///
    /// Appends the pending events expecting the stream to be at the
    /// aggregate's version, publishes them in order, and commits them on the
    /// aggregate. A concurrency conflict is returned unchanged and leaves the
    /// aggregate untouched; callers retry by reloading.
    ///
    /// If publishing fails the events are already stored, so the aggregate is
    /// still committed before the publish error is returned.
    pub async fn save(&self, aggregate: &mut A) -> Result<Vec<DomainEvent>, AggregateError> {
        if aggregate.uncommitted_events().is_empty() {
            return Ok(Vec::new());
        }

        let previous = aggregate.version();
        let stored = self
            .store
            .append(
                aggregate.aggregate_id(),
                aggregate.uncommitted_events().to_vec(),
                ExpectedVersion::Exact(previous),
            )
            .await?;

        let mut publish_error = None;
        for event in &stored {
            if let Err(err) = self.bus.publish(event.clone()).await {
                warn!(
                    aggregate_id = aggregate.aggregate_id(),
                    event_id = %event.id,
                    version = event.version,
                    error = %err,
                    "Stored event could not be published"
                );
                publish_error = Some(err);
                break;
            }
        }

        aggregate.mark_events_committed();
        self.maybe_snapshot(aggregate, previous).await;

        match publish_error {
            Some(err) => Err(err.into()),
            None => Ok(stored),
        }
    }

    async fn maybe_snapshot(&self, aggregate: &A, previous: u64) {
        let Some(frequency) = self.snapshot_frequency else {
            return;
        };
        if aggregate.version() / frequency == previous / frequency {
            return;
        }

        let snapshot = match Snapshot::of(aggregate) {
            Ok(snapshot) => snapshot,
            Err(AggregateError::SnapshotsUnsupported(_)) => {
                debug!(
                    aggregate_type = A::aggregate_type(),
                    "Aggregate does not support snapshots"
                );
                return;
            }
            Err(err) => {
                warn!(
                    aggregate_id = aggregate.aggregate_id(),
                    error = %err,
                    "Failed to capture snapshot"
                );
                return;
            }
        };

        let version = snapshot.version;
        match self.store.save_snapshot(snapshot).await {
            Ok(()) => debug!(
                aggregate_id = aggregate.aggregate_id(),
                version, "Saved snapshot"
            ),
            Err(err) => warn!(
                aggregate_id = aggregate.aggregate_id(),
                error = %err,
                "Failed to save snapshot"
            ),
        }
    }
}

impl<A> Clone for AggregateRepository<A>
where
    A: Aggregate,
{
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            bus: self.bus.clone(),
            snapshot_frequency: self.snapshot_frequency,
            _phantom: PhantomData,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AggregateRoot;
    use crate::store::{EventStoreError, InMemoryEventStore};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;
    use std::time::Duration;
    use strata_events::{EventBusBuilder, EventBusError, EventHandler, EventHandlerError};

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct AccountState {
        owner: Option<String>,
        balance: i64,
    }

    #[derive(Debug)]
    struct Account {
        root: AggregateRoot,
        state: AccountState,
    }

    impl Account {
        fn open(&mut self, owner: &str) -> Result<(), AggregateError> {
            self.raise_event(DomainEvent::new(
                "account.opened",
                serde_json::json!({ "owner": owner }),
            ))
        }

        fn deposit(&mut self, amount: i64) -> Result<(), AggregateError> {
            self.raise_event(DomainEvent::new(
                "account.credited",
                serde_json::json!({ "amount": amount }),
            ))
        }

        fn withdraw(&mut self, amount: i64) -> Result<(), AggregateError> {
            if amount > self.state.balance {
                return Err(AggregateError::InvalidStateTransition(
                    "insufficient funds".to_string(),
                ));
            }
            self.raise_event(DomainEvent::new(
                "account.debited",
                serde_json::json!({ "amount": amount }),
            ))
        }
    }

    fn amount(event: &DomainEvent) -> Result<i64, AggregateError> {
        event.payload["amount"]
            .as_i64()
            .ok_or_else(|| AggregateError::EventApplicationFailed("missing amount".to_string()))
    }

    impl Aggregate for Account {
        fn aggregate_type() -> &'static str {
            "Account"
        }

        fn new_instance(id: String) -> Self {
            Self {
                root: AggregateRoot::new(id),
                state: AccountState::default(),
            }
        }

        fn root(&self) -> &AggregateRoot {
            &self.root
        }

        fn root_mut(&mut self) -> &mut AggregateRoot {
            &mut self.root
        }

        fn apply_event(&mut self, event: &DomainEvent) -> Result<(), AggregateError> {
            match event.event_type.as_str() {
                "account.opened" => {
                    self.state.owner = event.payload["owner"].as_str().map(str::to_string);
                }
                "account.credited" => self.state.balance += amount(event)?,
                "account.debited" => self.state.balance -= amount(event)?,
                _ => {}
            }
            Ok(())
        }

        fn snapshot_state(&self) -> Result<serde_json::Value, AggregateError> {
            Ok(serde_json::to_value(&self.state)?)
        }

        fn restore_state(&mut self, state: serde_json::Value) -> Result<(), AggregateError> {
            self.state = serde_json::from_value(state)?;
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct Recorder {
        events: Arc<Mutex<Vec<DomainEvent>>>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle(&self, event: &DomainEvent) -> Result<(), EventHandlerError> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    fn bus() -> EventBus {
        EventBusBuilder::new()
            .worker_count(1)
            .poll_interval(Duration::from_millis(10))
            .enable_logging(false)
            .build()
    }

    async fn running_bus() -> EventBus {
        let bus = bus();
        bus.start().await.unwrap();
        bus
    }

    fn repository(store: &InMemoryEventStore, bus: &EventBus) -> AggregateRepository<Account> {
        AggregateRepository::new(Arc::new(store.clone()), bus.clone())
    }

    #[tokio::test]
    async fn test_repository_load_save() {
        let store = InMemoryEventStore::new();
        let bus = running_bus().await;
        let repo = repository(&store, &bus);

        let mut account = Account::new_instance("acct-1".to_string());
        account.open("alice").unwrap();
        account.deposit(100).unwrap();

        let stored = repo.save(&mut account).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(account.version(), 2);
        assert!(account.uncommitted_events().is_empty());

        let loaded = repo.get("acct-1").await.unwrap();
        assert_eq!(loaded.version(), 2);
        assert_eq!(loaded.state, account.state);
        assert!(repo.exists("acct-1").await.unwrap());

        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_get_unknown_aggregate_is_not_found() {
        let store = InMemoryEventStore::new();
        let repo = repository(&store, &bus());

        let result = repo.get("missing").await;
        assert!(matches!(result, Err(AggregateError::NotFound(id)) if id == "missing"));
        assert!(!repo.exists("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_save_without_pending_events_is_noop() {
        let store = InMemoryEventStore::new();
        // bus is not started: a no-op save must not try to publish
        let repo = repository(&store, &bus());

        let mut account = Account::new_instance("acct-1".to_string());
        assert!(repo.save(&mut account).await.unwrap().is_empty());
        assert_eq!(store.event_count(), 0);
    }

    #[tokio::test]
    async fn test_repeated_saves_assign_gapless_versions() {
        let store = InMemoryEventStore::new();
        let bus = running_bus().await;
        let repo = repository(&store, &bus);

        let mut account = Account::new_instance("acct-1".to_string());
        account.open("alice").unwrap();
        repo.save(&mut account).await.unwrap();

        for _ in 0..4 {
            let mut account = repo.get("acct-1").await.unwrap();
            account.deposit(10).unwrap();
            repo.save(&mut account).await.unwrap();
        }

        let versions: Vec<u64> = store
            .get_events("acct-1", 0)
            .await
            .unwrap()
            .iter()
            .map(|e| e.version)
            .collect();
        assert_eq!(versions, vec![1, 2, 3, 4, 5]);

        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_save_is_a_concurrency_conflict() {
        let store = InMemoryEventStore::new();
        let bus = running_bus().await;
        let repo = repository(&store, &bus);

        let mut account = Account::new_instance("acct-1".to_string());
        account.open("alice").unwrap();
        account.deposit(50).unwrap();
        repo.save(&mut account).await.unwrap();

        let mut first = repo.get("acct-1").await.unwrap();
        let mut second = repo.get("acct-1").await.unwrap();
        assert_eq!(first.version(), 2);
        assert_eq!(second.version(), 2);

        first.deposit(10).unwrap();
        second.withdraw(20).unwrap();

        let stored = repo.save(&mut first).await.unwrap();
        assert_eq!(stored[0].version, 3);

        let err = repo.save(&mut second).await.unwrap_err();
        assert!(err.is_concurrency_conflict());
        assert!(matches!(
            err,
            AggregateError::Store(EventStoreError::ConcurrencyConflict {
                expected: 2,
                actual: 3,
                ..
            })
        ));
        // the losing aggregate keeps its pending event for the caller to inspect
        assert_eq!(second.version(), 2);
        assert_eq!(second.uncommitted_events().len(), 1);

        bus.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_saves_exactly_one_wins() {
        let store = InMemoryEventStore::new();
        let bus = running_bus().await;
        let repo = repository(&store, &bus);

        let mut account = Account::new_instance("acct-1".to_string());
        account.open("alice").unwrap();
        account.deposit(50).unwrap();
        repo.save(&mut account).await.unwrap();

        let mut first = repo.get("acct-1").await.unwrap();
        let mut second = repo.get("acct-1").await.unwrap();
        assert_eq!(first.version(), 2);
        assert_eq!(second.version(), 2);
        first.deposit(10).unwrap();
        second.deposit(20).unwrap();

        let (left, right) = (repo.clone(), repo.clone());
        let (r1, r2) = tokio::join!(
            tokio::spawn(async move { left.save(&mut first).await }),
            tokio::spawn(async move { right.save(&mut second).await }),
        );
        let (r1, r2) = (r1.unwrap(), r2.unwrap());

        assert!(r1.is_ok() ^ r2.is_ok());
        let loser = if r1.is_ok() { r2 } else { r1 };
        assert!(loser.unwrap_err().is_concurrency_conflict());
        assert_eq!(store.stream_version("acct-1").await.unwrap(), 3);

        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_replay_is_deterministic() {
        let store = InMemoryEventStore::new();
        let bus = running_bus().await;
        let repo = repository(&store, &bus);

        let mut account = Account::new_instance("acct-1".to_string());
        account.open("alice").unwrap();
        repo.save(&mut account).await.unwrap();
        for amount in [30, 20, 70] {
            let mut account = repo.get("acct-1").await.unwrap();
            account.deposit(amount).unwrap();
            account.withdraw(amount / 2).unwrap();
            repo.save(&mut account).await.unwrap();
        }

        let history = store.get_events("acct-1", 0).await.unwrap();
        let mut fresh = Account::new_instance("acct-1".to_string());
        fresh.load_from_history(&history).unwrap();

        let loaded = repo.get("acct-1").await.unwrap();
        assert_eq!(loaded.state, fresh.state);
        assert_eq!(loaded.version(), fresh.version());
        assert_eq!(loaded.state.balance, 60);

        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_equivalence() {
        let store = InMemoryEventStore::new();
        let bus = running_bus().await;
        let repo: AggregateRepository<Account> =
            AggregateRepository::with_snapshots(Arc::new(store.clone()), bus.clone(), 2);

        let mut account = Account::new_instance("acct-1".to_string());
        account.open("alice").unwrap();
        repo.save(&mut account).await.unwrap();
        for amount in [5, 10, 15, 20] {
            let mut account = repo.get("acct-1").await.unwrap();
            account.deposit(amount).unwrap();
            repo.save(&mut account).await.unwrap();
        }

        let snapshot = store.get_snapshot("acct-1").await.unwrap().unwrap();
        assert_eq!(snapshot.version, 4);
        assert_eq!(snapshot.aggregate_type, "Account");

        let from_snapshot = repo.get("acct-1").await.unwrap();

        let mut from_zero = Account::new_instance("acct-1".to_string());
        from_zero
            .load_from_history(&store.get_events("acct-1", 0).await.unwrap())
            .unwrap();

        assert_eq!(from_snapshot.state, from_zero.state);
        assert_eq!(from_snapshot.version(), 5);
        assert_eq!(from_zero.version(), 5);

        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_broken_snapshot_falls_back_to_full_replay() {
        let store = InMemoryEventStore::new();
        let bus = running_bus().await;
        let repo = repository(&store, &bus);

        let mut account = Account::new_instance("acct-1".to_string());
        account.open("alice").unwrap();
        account.deposit(40).unwrap();
        repo.save(&mut account).await.unwrap();

        store
            .save_snapshot(Snapshot::new(
                "acct-1".to_string(),
                "Account".to_string(),
                2,
                serde_json::json!("not an account state"),
            ))
            .await
            .unwrap();

        let loaded = repo.get("acct-1").await.unwrap();
        assert_eq!(loaded.state.balance, 40);
        assert_eq!(loaded.version(), 2);

        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_saved_events_are_published_in_order() {
        let store = InMemoryEventStore::new();
        let bus = running_bus().await;
        let recorder = Recorder::default();
        for event_type in ["account.opened", "account.credited", "account.debited"] {
            bus.subscribe(event_type, Arc::new(recorder.clone()));
        }
        let repo = repository(&store, &bus);

        let mut account = Account::new_instance("acct-1".to_string());
        account.open("alice").unwrap();
        account.deposit(25).unwrap();
        account.withdraw(5).unwrap();
        repo.save(&mut account).await.unwrap();

        for _ in 0..200 {
            if recorder.events.lock().unwrap().len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let seen = recorder.events.lock().unwrap().clone();
        let versions: Vec<u64> = seen.iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert!(seen.iter().all(|e| e.aggregate_type == "Account"));

        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_failure_after_append() {
        let store = InMemoryEventStore::new();
        let repo = repository(&store, &bus());

        let mut account = Account::new_instance("acct-1".to_string());
        account.open("alice").unwrap();

        let err = repo.save(&mut account).await.unwrap_err();
        assert!(matches!(
            err,
            AggregateError::Publish(EventBusError::BusNotRunning)
        ));

        // the append happened and the aggregate reflects it
        assert_eq!(store.stream_version("acct-1").await.unwrap(), 1);
        assert_eq!(account.version(), 1);
        assert!(account.uncommitted_events().is_empty());
    }
}
