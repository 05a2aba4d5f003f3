// Copyright 2025 Cowboy AI, LLC.

//! Event-sourced aggregate repository
//!
//! `load` rebuilds an aggregate from its latest usable snapshot plus the tail of
//! its stream, upcasting each event first. `save` appends the aggregate's
//! uncommitted events under optimistic concurrency and, when the snapshot
//! policy asks for it, records a fresh snapshot.
//!
//! The repository never merges: a concurrent writer makes `save` fail with
//! [`RepositoryError::ConcurrencyConflict`] and the caller reloads and retries.

use crate::aggregate::{Aggregate, AggregateState, VersionGap};
use crate::events::{DomainEvent, NewEvent};
use crate::infrastructure::{
    AggregateSnapshot, EventStore, EventStoreError, SnapshotError, SnapshotPolicy, SnapshotStore,
    UpcastError, UpcasterRegistry,
};
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Repository errors
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Another writer advanced the stream since the aggregate was loaded
    #[error("Concurrency conflict on {aggregate_id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        /// Aggregate id
        aggregate_id: String,
        /// Version the aggregate was loaded at
        expected: u64,
        /// Version the store holds
        actual: u64,
    },

    /// A stored event has a schema no upcaster can bring up to date
    #[error("Event {version} of {aggregate_id} cannot be upcast: {source}")]
    UnsupportedEvent {
        /// Aggregate id
        aggregate_id: String,
        /// Version of the offending event
        version: u64,
        /// Upcasting failure
        #[source]
        source: UpcastError,
    },

    /// A stored event does not decode into the aggregate's event type
    #[error("Malformed {event_type} event {version} of {aggregate_id}: {reason}")]
    MalformedEvent {
        /// Aggregate id
        aggregate_id: String,
        /// Version of the offending event
        version: u64,
        /// Stored event type
        event_type: String,
        /// Decoder message
        reason: String,
    },

    /// The stream handed back by the store is not contiguous
    #[error("Stream of {aggregate_id} is corrupted: {gap}")]
    CorruptedStream {
        /// Aggregate id
        aggregate_id: String,
        /// Where the sequence broke
        gap: VersionGap,
    },

    /// Event could not be serialized for appending
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Underlying store failure
    #[error("Event store error: {0}")]
    EventStore(EventStoreError),

    /// Snapshot could not be captured or stored
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// The aggregate still holds events that were never saved
    #[error("Cannot snapshot {aggregate_id} with {pending} unsaved events")]
    PendingEvents {
        /// Aggregate id
        aggregate_id: String,
        /// Number of uncommitted events
        pending: usize,
    },
}

impl RepositoryError {
    /// Whether the caller may reload and retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, RepositoryError::ConcurrencyConflict { .. })
    }
}

impl From<EventStoreError> for RepositoryError {
    fn from(err: EventStoreError) -> Self {
        match err {
            EventStoreError::ConcurrencyConflict {
                aggregate_id,
                expected,
                current,
            } => RepositoryError::ConcurrencyConflict {
                aggregate_id,
                expected,
                actual: current,
            },
            other => RepositoryError::EventStore(other),
        }
    }
}

/// Repository for one aggregate type backed by an event store and a snapshot store
pub struct EventSourcedRepository<A: Aggregate> {
    event_store: Arc<dyn EventStore>,
    snapshot_store: Arc<dyn SnapshotStore>,
    upcasters: Arc<UpcasterRegistry>,
    snapshot_policy: SnapshotPolicy,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A: Aggregate> Clone for EventSourcedRepository<A> {
    fn clone(&self) -> Self {
        Self {
            event_store: Arc::clone(&self.event_store),
            snapshot_store: Arc::clone(&self.snapshot_store),
            upcasters: Arc::clone(&self.upcasters),
            snapshot_policy: self.snapshot_policy.clone(),
            _aggregate: PhantomData,
        }
    }
}

impl<A: Aggregate> EventSourcedRepository<A> {
    /// Create a repository with no upcasters and the default snapshot policy
    pub fn new(event_store: Arc<dyn EventStore>, snapshot_store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            event_store,
            snapshot_store,
            upcasters: Arc::new(UpcasterRegistry::new()),
            snapshot_policy: SnapshotPolicy::default(),
            _aggregate: PhantomData,
        }
    }

    /// Use the given upcaster registry when reading events
    pub fn with_upcasters(mut self, upcasters: Arc<UpcasterRegistry>) -> Self {
        self.upcasters = upcasters;
        self
    }

    /// Use the given snapshot policy when saving
    pub fn with_snapshot_policy(mut self, policy: SnapshotPolicy) -> Self {
        self.snapshot_policy = policy;
        self
    }

    /// The event store this repository appends to
    pub fn event_store(&self) -> &Arc<dyn EventStore> {
        &self.event_store
    }

    /// Load the current state of an aggregate.
    ///
    /// An aggregate with no events loads as the default state at version 0.
    pub async fn load(&self, aggregate_id: &str) -> Result<AggregateState<A>, RepositoryError> {
        let mut aggregate = match self.usable_snapshot(aggregate_id).await? {
            Some(aggregate) => aggregate,
            None => AggregateState::new(aggregate_id),
        };

        let events = self
            .event_store
            .get_events(aggregate_id, aggregate.version())
            .await?;
        self.replay(&mut aggregate, &events)?;

        debug!(
            aggregate_id = %aggregate_id,
            aggregate_type = A::AGGREGATE_TYPE,
            version = aggregate.version(),
            replayed = events.len(),
            "Loaded aggregate"
        );
        Ok(aggregate)
    }

    /// Load by replaying the full stream, ignoring snapshots
    pub async fn load_without_snapshot(
        &self,
        aggregate_id: &str,
    ) -> Result<AggregateState<A>, RepositoryError> {
        let mut aggregate = AggregateState::new(aggregate_id);
        let events = self.event_store.get_events(aggregate_id, 0).await?;
        self.replay(&mut aggregate, &events)?;
        Ok(aggregate)
    }

    /// Whether the aggregate has any events
    pub async fn exists(&self, aggregate_id: &str) -> Result<bool, RepositoryError> {
        Ok(self.event_store.current_version(aggregate_id).await? > 0)
    }

    /// Persist the aggregate's uncommitted events, returning the new stream version
    pub async fn save(&self, aggregate: &mut AggregateState<A>) -> Result<u64, RepositoryError> {
        if aggregate.uncommitted().is_empty() {
            return Ok(aggregate.version());
        }

        let expected = aggregate.persisted_version();
        let events = aggregate
            .uncommitted()
            .iter()
            .map(|pending| {
                let event = NewEvent::from_typed(&pending.event)
                    .map_err(|e| RepositoryError::SerializationError(e.to_string()))?;
                let schema_version = self.upcasters.current_version(&event.event_type);
                Ok(event
                    .with_schema_version(schema_version)
                    .with_metadata(pending.metadata.clone()))
            })
            .collect::<Result<Vec<_>, RepositoryError>>()?;

        let committed = self
            .event_store
            .append(aggregate.id(), A::AGGREGATE_TYPE, events, expected)
            .await?;
        aggregate.take_uncommitted();

        let version = aggregate.version();
        info!(
            aggregate_id = %aggregate.id(),
            aggregate_type = A::AGGREGATE_TYPE,
            version,
            appended = committed.len(),
            "Saved aggregate"
        );

        if self.snapshot_policy.should_snapshot(
            expected,
            version,
            committed.iter().map(|e| e.event_type.as_str()),
        ) {
            if let Err(e) = self.snapshot(aggregate).await {
                warn!(
                    aggregate_id = %aggregate.id(),
                    version,
                    error = %e,
                    "Failed to record snapshot"
                );
            }
        }

        Ok(version)
    }

    /// Record a snapshot of an aggregate with no pending events
    pub async fn snapshot(&self, aggregate: &AggregateState<A>) -> Result<(), RepositoryError> {
        if !aggregate.uncommitted().is_empty() {
            return Err(RepositoryError::PendingEvents {
                aggregate_id: aggregate.id().to_string(),
                pending: aggregate.uncommitted().len(),
            });
        }
        let snapshot = AggregateSnapshot::capture(
            aggregate.id(),
            A::AGGREGATE_TYPE,
            aggregate.version(),
            aggregate.state(),
        )?;
        self.snapshot_store.save(snapshot).await?;

        info!(
            aggregate_id = %aggregate.id(),
            version = aggregate.version(),
            "Recorded snapshot"
        );
        Ok(())
    }

    /// Latest snapshot restored into an aggregate, if it can be trusted
    async fn usable_snapshot(
        &self,
        aggregate_id: &str,
    ) -> Result<Option<AggregateState<A>>, RepositoryError> {
        let snapshot = match self.snapshot_store.load_latest(aggregate_id).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!(aggregate_id = %aggregate_id, error = %e, "Snapshot unavailable, replaying");
                return Ok(None);
            }
        };

        if snapshot.aggregate_type != A::AGGREGATE_TYPE {
            warn!(
                aggregate_id = %aggregate_id,
                snapshot_type = %snapshot.aggregate_type,
                "Ignoring snapshot of another aggregate type"
            );
            return Ok(None);
        }

        let stored_version = self.event_store.current_version(aggregate_id).await?;
        if snapshot.version > stored_version {
            warn!(
                aggregate_id = %aggregate_id,
                snapshot_version = snapshot.version,
                stored_version,
                "Ignoring snapshot ahead of the event stream"
            );
            return Ok(None);
        }

        match snapshot.restore::<A>() {
            Ok(state) => Ok(Some(AggregateState::from_snapshot(
                aggregate_id,
                state,
                snapshot.version,
            ))),
            Err(e) => {
                warn!(
                    aggregate_id = %aggregate_id,
                    version = snapshot.version,
                    error = %e,
                    "Snapshot does not decode, replaying"
                );
                Ok(None)
            }
        }
    }

    fn replay(
        &self,
        aggregate: &mut AggregateState<A>,
        events: &[DomainEvent],
    ) -> Result<(), RepositoryError> {
        for stored in events {
            let event = self
                .upcasters
                .upcast(stored)
                .map_err(|source| RepositoryError::UnsupportedEvent {
                    aggregate_id: stored.aggregate_id.clone(),
                    version: stored.version,
                    source,
                })?;
            let typed: A::Event =
                event
                    .decode()
                    .map_err(|e| RepositoryError::MalformedEvent {
                        aggregate_id: stored.aggregate_id.clone(),
                        version: stored.version,
                        event_type: stored.event_type.clone(),
                        reason: e.to_string(),
                    })?;
            aggregate
                .fold(stored.version, &typed)
                .map_err(|gap| RepositoryError::CorruptedStream {
                    aggregate_id: stored.aggregate_id.clone(),
                    gap,
                })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{DomainError, DomainResult};
    use crate::events::EventMetadata;
    use crate::infrastructure::{InMemoryEventStore, InMemorySnapshotStore, Upcaster};
    use serde::{Deserialize, Serialize};
    use serde_json::{json, Value};

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Wallet {
        owner: String,
        coins: i64,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data")]
    enum WalletEvent {
        Created { owner: String },
        Credited { coins: i64 },
    }

    #[derive(Debug, Clone)]
    enum WalletCommand {
        Create(String),
        Credit(i64),
    }

    impl Aggregate for Wallet {
        const AGGREGATE_TYPE: &'static str = "Wallet";
        type Event = WalletEvent;
        type Command = WalletCommand;

        fn handle(&self, command: WalletCommand) -> DomainResult<Vec<WalletEvent>> {
            match command {
                WalletCommand::Create(owner) if self.owner.is_empty() => {
                    Ok(vec![WalletEvent::Created { owner }])
                }
                WalletCommand::Create(_) => Err(DomainError::AlreadyExists("wallet".into())),
                WalletCommand::Credit(coins) => Ok(vec![WalletEvent::Credited { coins }]),
            }
        }

        fn apply(&mut self, event: &WalletEvent) {
            match event {
                WalletEvent::Created { owner } => self.owner = owner.clone(),
                WalletEvent::Credited { coins } => self.coins += coins,
            }
        }
    }

    struct Fixture {
        events: Arc<InMemoryEventStore>,
        snapshots: Arc<InMemorySnapshotStore>,
        repo: EventSourcedRepository<Wallet>,
    }

    fn fixture(policy: SnapshotPolicy) -> Fixture {
        let events = Arc::new(InMemoryEventStore::new());
        let snapshots = Arc::new(InMemorySnapshotStore::new());
        let repo = EventSourcedRepository::new(events.clone(), snapshots.clone())
            .with_snapshot_policy(policy);
        Fixture {
            events,
            snapshots,
            repo,
        }
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let f = fixture(SnapshotPolicy::disabled());
        let mut wallet = f.repo.load("w-1").await.unwrap();
        assert!(wallet.is_new());

        wallet.execute(WalletCommand::Create("ada".into())).unwrap();
        wallet.execute(WalletCommand::Credit(5)).unwrap();
        assert_eq!(f.repo.save(&mut wallet).await.unwrap(), 2);
        assert!(wallet.uncommitted().is_empty());

        let loaded = f.repo.load("w-1").await.unwrap();
        assert_eq!(loaded.state(), wallet.state());
        assert_eq!(loaded.version(), 2);
        assert!(f.repo.exists("w-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_save_conflicts_and_keeps_pending_events() {
        let f = fixture(SnapshotPolicy::disabled());
        let mut first = f.repo.load("w-1").await.unwrap();
        let mut second = f.repo.load("w-1").await.unwrap();

        first.execute(WalletCommand::Credit(1)).unwrap();
        second.execute(WalletCommand::Credit(2)).unwrap();

        f.repo.save(&mut first).await.unwrap();
        let err = f.repo.save(&mut second).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(
            err,
            RepositoryError::ConcurrencyConflict {
                expected: 0,
                actual: 1,
                ..
            }
        ));
        assert_eq!(second.uncommitted().len(), 1);

        let reloaded = f.repo.load("w-1").await.unwrap();
        assert_eq!(reloaded.state().coins, 1);
    }

    #[tokio::test]
    async fn test_snapshot_taken_when_crossing_interval() {
        let f = fixture(SnapshotPolicy::every(3));
        let mut wallet = f.repo.load("w-1").await.unwrap();
        for _ in 0..4 {
            wallet.execute(WalletCommand::Credit(1)).unwrap();
            f.repo.save(&mut wallet).await.unwrap();
        }

        let snapshot = f.snapshots.load_latest("w-1").await.unwrap().unwrap();
        assert_eq!(snapshot.version, 3);

        let from_snapshot = f.repo.load("w-1").await.unwrap();
        let from_scratch = f.repo.load_without_snapshot("w-1").await.unwrap();
        assert_eq!(from_snapshot.state(), from_scratch.state());
        assert_eq!(from_snapshot.version(), 4);
    }

    #[tokio::test]
    async fn test_snapshot_ahead_of_stream_is_ignored() {
        let f = fixture(SnapshotPolicy::disabled());
        let bogus = Wallet {
            owner: "mallory".into(),
            coins: 1_000,
        };
        f.snapshots
            .save(AggregateSnapshot::capture("w-1", "Wallet", 10, &bogus).unwrap())
            .await
            .unwrap();

        let mut wallet = f.repo.load("w-1").await.unwrap();
        assert_eq!(wallet.version(), 0);
        wallet.execute(WalletCommand::Credit(3)).unwrap();
        f.repo.save(&mut wallet).await.unwrap();

        assert_eq!(f.repo.load("w-1").await.unwrap().state().coins, 3);
    }

    #[tokio::test]
    async fn test_undecodable_snapshot_falls_back_to_replay() {
        let f = fixture(SnapshotPolicy::disabled());
        let mut wallet = f.repo.load("w-1").await.unwrap();
        wallet.execute(WalletCommand::Credit(4)).unwrap();
        f.repo.save(&mut wallet).await.unwrap();

        f.snapshots
            .save(AggregateSnapshot::capture("w-1", "Wallet", 1, &"garbage").unwrap())
            .await
            .unwrap();

        assert_eq!(f.repo.load("w-1").await.unwrap().state().coins, 4);
    }

    #[tokio::test]
    async fn test_unknown_event_type_is_fatal() {
        let f = fixture(SnapshotPolicy::disabled());
        f.events
            .append(
                "w-1",
                "Wallet",
                vec![NewEvent::new("Teleported", json!({"to": "mars"}))],
                0,
            )
            .await
            .unwrap();

        let err = f.repo.load("w-1").await.unwrap_err();
        assert!(matches!(
            err,
            RepositoryError::MalformedEvent { version: 1, ref event_type, .. } if event_type == "Teleported"
        ));
    }

    fn rename_amount(data: &Value) -> Result<Value, String> {
        let amount = data
            .get("amount")
            .cloned()
            .ok_or_else(|| "missing amount".to_string())?;
        Ok(json!({ "coins": amount }))
    }

    #[tokio::test]
    async fn test_old_schema_is_upcast_on_load() {
        let mut registry = UpcasterRegistry::new();
        registry.register_event_type("Credited", 2);
        registry
            .register(Upcaster::new("Credited", 1, 2, rename_amount))
            .unwrap();

        let f = fixture(SnapshotPolicy::disabled());
        let repo = f.repo.clone().with_upcasters(Arc::new(registry));

        f.events
            .append(
                "w-1",
                "Wallet",
                vec![NewEvent::new("Credited", json!({"amount": 7}))],
                0,
            )
            .await
            .unwrap();

        let mut wallet = repo.load("w-1").await.unwrap();
        assert_eq!(wallet.state().coins, 7);

        wallet.execute(WalletCommand::Credit(1)).unwrap();
        repo.save(&mut wallet).await.unwrap();
        let stored = f.events.get_events("w-1", 1).await.unwrap();
        assert_eq!(stored[0].schema_version, 2);

        // The v1 event stays as written.
        let original = f.events.get_events("w-1", 0).await.unwrap();
        assert_eq!(original[0].payload, json!({"amount": 7}));
    }

    #[tokio::test]
    async fn test_missing_upcaster_is_fatal() {
        let mut registry = UpcasterRegistry::new();
        registry.register_event_type("Credited", 2);
        let f = fixture(SnapshotPolicy::disabled());
        let repo = f.repo.clone().with_upcasters(Arc::new(registry));

        f.events
            .append(
                "w-1",
                "Wallet",
                vec![NewEvent::new("Credited", json!({"amount": 7}))],
                0,
            )
            .await
            .unwrap();

        assert!(matches!(
            repo.load("w-1").await,
            Err(RepositoryError::UnsupportedEvent { version: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_metadata_is_persisted() {
        let f = fixture(SnapshotPolicy::disabled());
        let mut wallet = f.repo.load("w-1").await.unwrap();
        wallet
            .execute_with_metadata(
                WalletCommand::Credit(1),
                EventMetadata::now().with_actor("teller"),
            )
            .unwrap();
        f.repo.save(&mut wallet).await.unwrap();

        let stored = f.events.get_events("w-1", 0).await.unwrap();
        assert_eq!(stored[0].metadata.actor.as_deref(), Some("teller"));
        assert_eq!(stored[0].aggregate_type, "Wallet");
    }

    #[tokio::test]
    async fn test_snapshot_refuses_unsaved_events() {
        let f = fixture(SnapshotPolicy::disabled());
        let mut wallet = f.repo.load("w-1").await.unwrap();
        wallet.execute(WalletCommand::Credit(2)).unwrap();

        let err = f.repo.snapshot(&wallet).await.unwrap_err();
        assert!(matches!(
            err,
            RepositoryError::PendingEvents { ref aggregate_id, pending: 1 } if aggregate_id == "w-1"
        ));
        assert!(f.snapshots.load_latest("w-1").await.unwrap().is_none());
    }

    struct OfflineSnapshotStore;

    #[async_trait::async_trait]
    impl SnapshotStore for OfflineSnapshotStore {
        async fn save(&self, _snapshot: AggregateSnapshot) -> Result<(), SnapshotError> {
            Err(SnapshotError::StorageError("disk full".into()))
        }

        async fn load_latest(
            &self,
            _aggregate_id: &str,
        ) -> Result<Option<AggregateSnapshot>, SnapshotError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_snapshot_store_failure_is_reported_as_snapshot_error() {
        let events = Arc::new(InMemoryEventStore::new());
        let repo: EventSourcedRepository<Wallet> =
            EventSourcedRepository::new(events, Arc::new(OfflineSnapshotStore))
                .with_snapshot_policy(SnapshotPolicy::every(1));

        let mut wallet = repo.load("w-1").await.unwrap();
        wallet.execute(WalletCommand::Credit(2)).unwrap();
        // The automatic snapshot after a save is best effort.
        assert_eq!(repo.save(&mut wallet).await.unwrap(), 1);

        let err = repo.snapshot(&wallet).await.unwrap_err();
        assert!(matches!(
            err,
            RepositoryError::Snapshot(SnapshotError::StorageError(_))
        ));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_save_without_changes_is_noop() {
        let f = fixture(SnapshotPolicy::disabled());
        let mut wallet = f.repo.load("w-1").await.unwrap();
        assert_eq!(f.repo.save(&mut wallet).await.unwrap(), 0);
        assert!(f.events.is_empty().await);
    }
}
