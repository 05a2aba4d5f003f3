// Copyright 2025 Cowboy AI, LLC.

//! Command handlers for event-sourced aggregates
//!
//! A command handler runs the write path: load the aggregate, let it decide on
//! the command, append the resulting events, and retry from a fresh load when
//! another writer got there first. Handlers return acknowledgments only; read
//! models answer queries.

use crate::aggregate::Aggregate;
use crate::errors::DomainError;
use crate::events::EventMetadata;
use crate::persistence::{EventSourcedRepository, RepositoryError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors returned by [`CommandHandler::execute`]
#[derive(Debug, Error)]
pub enum CommandError {
    /// The aggregate refused the command
    #[error("Command rejected: {0}")]
    Rejected(#[from] DomainError),

    /// Loading or saving failed
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// Every attempt lost the race to a concurrent writer
    #[error("Gave up on {aggregate_id} after {attempts} conflicting attempts")]
    ConflictRetriesExhausted {
        /// Aggregate id
        aggregate_id: String,
        /// Attempts made
        attempts: u32,
    },
}

/// How often a command is retried after a concurrency conflict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Pause between attempts, multiplied by the attempt number
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 10,
        }
    }
}

impl RetryPolicy {
    /// Fail on the first conflict
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: 0,
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(u64::from(attempt)))
    }
}

/// Acknowledgment of a handled command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    /// Aggregate the command targeted
    pub aggregate_id: String,
    /// Stream version after the command
    pub version: u64,
    /// Number of events the command raised
    pub events_raised: usize,
}

/// Executes commands against one aggregate type
pub struct CommandHandler<A: Aggregate> {
    repository: EventSourcedRepository<A>,
    retry: RetryPolicy,
}

impl<A: Aggregate> Clone for CommandHandler<A> {
    fn clone(&self) -> Self {
        Self {
            repository: self.repository.clone(),
            retry: self.retry.clone(),
        }
    }
}

impl<A: Aggregate> CommandHandler<A>
where
    A::Command: Clone,
{
    /// Create a handler with the default retry policy
    pub fn new(repository: EventSourcedRepository<A>) -> Self {
        Self {
            repository,
            retry: RetryPolicy::default(),
        }
    }

    /// Replace the retry policy
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The repository this handler writes through
    pub fn repository(&self) -> &EventSourcedRepository<A> {
        &self.repository
    }

    /// Load, decide, append; reload and retry on conflict
    pub async fn execute(
        &self,
        aggregate_id: &str,
        command: A::Command,
        metadata: EventMetadata,
    ) -> Result<CommandOutcome, CommandError> {
        let max_attempts = self.retry.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let mut aggregate = self.repository.load(aggregate_id).await?;
            let raised = aggregate.execute_with_metadata(command.clone(), metadata.clone())?;
            if raised == 0 {
                debug!(aggregate_id = %aggregate_id, "Command raised no events");
                return Ok(CommandOutcome {
                    aggregate_id: aggregate_id.to_string(),
                    version: aggregate.version(),
                    events_raised: 0,
                });
            }

            match self.repository.save(&mut aggregate).await {
                Ok(version) => {
                    info!(
                        aggregate_id = %aggregate_id,
                        aggregate_type = A::AGGREGATE_TYPE,
                        version,
                        attempt,
                        "Command handled"
                    );
                    return Ok(CommandOutcome {
                        aggregate_id: aggregate_id.to_string(),
                        version,
                        events_raised: raised,
                    });
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        aggregate_id = %aggregate_id,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Concurrency conflict, reloading"
                    );
                    if max_attempts == 1 {
                        return Err(e.into());
                    }
                    if attempt < max_attempts {
                        tokio::time::sleep(self.retry.backoff(attempt)).await;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(CommandError::ConflictRetriesExhausted {
            aggregate_id: aggregate_id.to_string(),
            attempts: max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AggregateState;
    use crate::errors::DomainResult;
    use crate::events::{DomainEvent, NewEvent};
    use crate::infrastructure::{
        EventStore, EventStoreError, InMemoryEventStore, InMemorySnapshotStore, SnapshotPolicy,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::sync::broadcast;

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Counter {
        value: i64,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data")]
    enum CounterEvent {
        Added { by: i64 },
    }

    impl Aggregate for Counter {
        const AGGREGATE_TYPE: &'static str = "Counter";
        type Event = CounterEvent;
        type Command = i64;

        fn handle(&self, by: i64) -> DomainResult<Vec<CounterEvent>> {
            if by < 0 {
                return Err(DomainError::invalid_operation("negative increment"));
            }
            if by == 0 {
                return Ok(vec![]);
            }
            Ok(vec![CounterEvent::Added { by }])
        }

        fn apply(&mut self, event: &CounterEvent) {
            match event {
                CounterEvent::Added { by } => self.value += by,
            }
        }
    }

    /// Store that lets a rival writer sneak in before the first `n` appends
    #[derive(Debug)]
    struct RacingStore {
        inner: InMemoryEventStore,
        races: AtomicU32,
    }

    #[async_trait]
    impl EventStore for RacingStore {
        async fn append(
            &self,
            aggregate_id: &str,
            aggregate_type: &str,
            events: Vec<NewEvent>,
            expected_version: u64,
        ) -> Result<Vec<DomainEvent>, EventStoreError> {
            if self.races.load(Ordering::SeqCst) > 0 {
                self.races.fetch_sub(1, Ordering::SeqCst);
                let current = self.inner.current_version(aggregate_id).await?;
                self.inner
                    .append(
                        aggregate_id,
                        aggregate_type,
                        vec![NewEvent::new("Added", json!({"by": 1}))],
                        current,
                    )
                    .await?;
            }
            self.inner
                .append(aggregate_id, aggregate_type, events, expected_version)
                .await
        }

        async fn get_events(
            &self,
            aggregate_id: &str,
            from_version: u64,
        ) -> Result<Vec<DomainEvent>, EventStoreError> {
            self.inner.get_events(aggregate_id, from_version).await
        }

        async fn get_events_by_type(
            &self,
            event_type: &str,
            since: u64,
        ) -> Result<Vec<DomainEvent>, EventStoreError> {
            self.inner.get_events_by_type(event_type, since).await
        }

        async fn get_all_events(&self, since: u64) -> Result<Vec<DomainEvent>, EventStoreError> {
            self.inner.get_all_events(since).await
        }

        async fn current_version(&self, aggregate_id: &str) -> Result<u64, EventStoreError> {
            self.inner.current_version(aggregate_id).await
        }

        async fn head_position(&self) -> Result<u64, EventStoreError> {
            self.inner.head_position().await
        }

        fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
            self.inner.subscribe()
        }
    }

    fn handler(races: u32, retry: RetryPolicy) -> CommandHandler<Counter> {
        let store = Arc::new(RacingStore {
            inner: InMemoryEventStore::new(),
            races: AtomicU32::new(races),
        });
        let repository = EventSourcedRepository::new(store, Arc::new(InMemorySnapshotStore::new()))
            .with_snapshot_policy(SnapshotPolicy::disabled());
        CommandHandler::new(repository).with_retry_policy(retry)
    }

    #[tokio::test]
    async fn test_execute_appends_events() {
        let handler = handler(0, RetryPolicy::default());
        let outcome = handler
            .execute("c-1", 5, EventMetadata::now())
            .await
            .unwrap();
        assert_eq!(outcome.version, 1);
        assert_eq!(outcome.events_raised, 1);

        let counter: AggregateState<Counter> = handler.repository().load("c-1").await.unwrap();
        assert_eq!(counter.state().value, 5);
    }

    #[tokio::test]
    async fn test_conflict_is_retried_from_fresh_state() {
        let handler = handler(1, RetryPolicy::default());
        let outcome = handler
            .execute("c-1", 10, EventMetadata::now())
            .await
            .unwrap();
        assert_eq!(outcome.version, 2);

        let counter = handler.repository().load("c-1").await.unwrap();
        assert_eq!(counter.state().value, 11);
    }

    #[tokio::test]
    async fn test_conflict_surfaces_without_retry() {
        let handler = handler(1, RetryPolicy::no_retry());
        let err = handler
            .execute("c-1", 10, EventMetadata::now())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CommandError::Repository(RepositoryError::ConcurrencyConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let handler = handler(
            5,
            RetryPolicy {
                max_attempts: 3,
                backoff_ms: 0,
            },
        );
        let err = handler
            .execute("c-1", 10, EventMetadata::now())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CommandError::ConflictRetriesExhausted { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_rejection_appends_nothing() {
        let handler = handler(0, RetryPolicy::default());
        let err = handler
            .execute("c-1", -1, EventMetadata::now())
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Rejected(_)));
        assert!(!handler.repository().exists("c-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_noop_command_skips_save() {
        let handler = handler(0, RetryPolicy::default());
        let outcome = handler
            .execute("c-1", 0, EventMetadata::now())
            .await
            .unwrap();
        assert_eq!(outcome.events_raised, 0);
        assert_eq!(outcome.version, 0);
    }
}
