// Copyright 2025 Cowboy AI, LLC.

//! Event store trait and the in-memory reference backend
//!
//! The store is an append-only ledger keyed by aggregate id and per-aggregate
//! version. Its one correctness mechanism is [`EventStore::append`]: a
//! compare-and-swap on the aggregate's current max version, which gives
//! single-writer-per-aggregate semantics without holding a lock across a
//! command. Any durable backend (SQL table with a unique `(aggregate_id,
//! version)` constraint, log file, object store) can implement the trait.

use crate::events::{DomainEvent, NewEvent};
use crate::identifiers::EventId;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

/// Default number of events buffered for slow subscribers
pub const DEFAULT_BROADCAST_CAPACITY: usize = 1024;

/// Errors that can occur when working with the event store
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventStoreError {
    /// Optimistic concurrency check failed
    #[error("Concurrency conflict on {aggregate_id}: expected version {expected}, but current version is {current}")]
    ConcurrencyConflict {
        /// Aggregate whose stream moved
        aggregate_id: String,
        /// The version that was expected
        expected: u64,
        /// The actual current version
        current: u64,
    },

    /// A stream cannot change its aggregate type
    #[error("Aggregate {aggregate_id} is a {existing}, cannot append {attempted} events")]
    AggregateTypeMismatch {
        /// Aggregate id
        aggregate_id: String,
        /// Type recorded on the stream
        existing: String,
        /// Type of the rejected append
        attempted: String,
    },

    /// Failed to serialize or deserialize event data
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// General storage operation failed
    #[error("Storage error: {0}")]
    StorageError(String),
}

impl EventStoreError {
    /// Whether the caller may reload and retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, EventStoreError::ConcurrencyConflict { .. })
    }
}

/// Event store trait for persisting and retrieving events
#[async_trait]
pub trait EventStore: Send + Sync + fmt::Debug {
    /// Append events to one aggregate's stream.
    ///
    /// Succeeds only if the stream's current version equals `expected_version`.
    /// All events are persisted or none are; they receive versions
    /// `expected_version + 1 ..= expected_version + events.len()`.
    async fn append(
        &self,
        aggregate_id: &str,
        aggregate_type: &str,
        events: Vec<NewEvent>,
        expected_version: u64,
    ) -> Result<Vec<DomainEvent>, EventStoreError>;

    /// Events of one aggregate with `version > from_version`, ascending
    async fn get_events(
        &self,
        aggregate_id: &str,
        from_version: u64,
    ) -> Result<Vec<DomainEvent>, EventStoreError>;

    /// Events of one type across all aggregates with `position > since`, in append order
    async fn get_events_by_type(
        &self,
        event_type: &str,
        since: u64,
    ) -> Result<Vec<DomainEvent>, EventStoreError>;

    /// The whole log with `position > since`, in append order
    async fn get_all_events(&self, since: u64) -> Result<Vec<DomainEvent>, EventStoreError>;

    /// Current version of an aggregate (0 if it has no events)
    async fn current_version(&self, aggregate_id: &str) -> Result<u64, EventStoreError>;

    /// Position of the last appended event (0 for an empty log)
    async fn head_position(&self) -> Result<u64, EventStoreError>;

    /// Receive events as they are appended, in append order
    fn subscribe(&self) -> broadcast::Receiver<DomainEvent>;
}

#[derive(Debug, Default)]
struct StreamIndex {
    aggregate_type: String,
    /// Offsets into the global log, index `v - 1` holds version `v`
    offsets: Vec<usize>,
}

#[derive(Debug, Default)]
struct Ledger {
    log: Vec<DomainEvent>,
    streams: HashMap<String, StreamIndex>,
}

/// In-memory event store
///
/// A single lock guards the log and the stream index, so an append is atomic.
/// The lock is held only for the compare-and-swap itself, never across a
/// command, so unrelated aggregates do not wait on each other's commands.
pub struct InMemoryEventStore {
    ledger: RwLock<Ledger>,
    notifier: broadcast::Sender<DomainEvent>,
}

impl fmt::Debug for InMemoryEventStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryEventStore")
            .field("subscribers", &self.notifier.receiver_count())
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventStore {
    /// Create a new in-memory event store
    pub fn new() -> Self {
        Self::with_broadcast_capacity(DEFAULT_BROADCAST_CAPACITY)
    }

    /// Create a store whose subscribers may fall `capacity` events behind
    pub fn with_broadcast_capacity(capacity: usize) -> Self {
        let (notifier, _) = broadcast::channel(capacity.max(1));
        Self {
            ledger: RwLock::new(Ledger::default()),
            notifier,
        }
    }

    /// Total number of stored events
    pub async fn len(&self) -> usize {
        self.ledger.read().await.log.len()
    }

    /// Whether nothing has been appended yet
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(
        &self,
        aggregate_id: &str,
        aggregate_type: &str,
        events: Vec<NewEvent>,
        expected_version: u64,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        let mut ledger = self.ledger.write().await;
        let Ledger { log, streams } = &mut *ledger;

        let current = streams
            .get(aggregate_id)
            .map(|stream| stream.offsets.len() as u64)
            .unwrap_or(0);

        if current != expected_version {
            warn!(
                aggregate_id = %aggregate_id,
                expected = expected_version,
                current,
                "Rejected append: concurrency conflict"
            );
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_id: aggregate_id.to_string(),
                expected: expected_version,
                current,
            });
        }

        if let Some(stream) = streams.get(aggregate_id) {
            if stream.aggregate_type != aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch {
                    aggregate_id: aggregate_id.to_string(),
                    existing: stream.aggregate_type.clone(),
                    attempted: aggregate_type.to_string(),
                });
            }
        }

        if events.is_empty() {
            return Ok(Vec::new());
        }

        let created_at = Utc::now();
        let first_offset = log.len();
        let committed: Vec<DomainEvent> = events
            .into_iter()
            .enumerate()
            .map(|(i, event)| DomainEvent {
                event_id: EventId::new(),
                aggregate_id: aggregate_id.to_string(),
                aggregate_type: aggregate_type.to_string(),
                event_type: event.event_type,
                version: expected_version + i as u64 + 1,
                position: (first_offset + i) as u64 + 1,
                schema_version: event.schema_version,
                payload: event.payload,
                metadata: event.metadata,
                created_at,
            })
            .collect();

        let stream = streams
            .entry(aggregate_id.to_string())
            .or_insert_with(|| StreamIndex {
                aggregate_type: aggregate_type.to_string(),
                offsets: Vec::new(),
            });
        stream
            .offsets
            .extend(first_offset..first_offset + committed.len());
        log.extend(committed.iter().cloned());

        // Published under the write lock so subscribers observe append order.
        for event in &committed {
            let _ = self.notifier.send(event.clone());
        }

        debug!(
            aggregate_id = %aggregate_id,
            aggregate_type = %aggregate_type,
            from_version = expected_version + 1,
            to_version = expected_version + committed.len() as u64,
            "Appended events"
        );

        Ok(committed)
    }

    async fn get_events(
        &self,
        aggregate_id: &str,
        from_version: u64,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        let ledger = self.ledger.read().await;
        let Some(stream) = ledger.streams.get(aggregate_id) else {
            return Ok(Vec::new());
        };
        let skip = usize::try_from(from_version).unwrap_or(usize::MAX);
        Ok(stream
            .offsets
            .iter()
            .skip(skip)
            .map(|&offset| ledger.log[offset].clone())
            .collect())
    }

    async fn get_events_by_type(
        &self,
        event_type: &str,
        since: u64,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        let ledger = self.ledger.read().await;
        let skip = usize::try_from(since).unwrap_or(usize::MAX);
        Ok(ledger
            .log
            .iter()
            .skip(skip)
            .filter(|event| event.event_type == event_type)
            .cloned()
            .collect())
    }

    async fn get_all_events(&self, since: u64) -> Result<Vec<DomainEvent>, EventStoreError> {
        let ledger = self.ledger.read().await;
        let skip = usize::try_from(since).unwrap_or(usize::MAX);
        Ok(ledger.log.iter().skip(skip).cloned().collect())
    }

    async fn current_version(&self, aggregate_id: &str) -> Result<u64, EventStoreError> {
        let ledger = self.ledger.read().await;
        Ok(ledger
            .streams
            .get(aggregate_id)
            .map(|stream| stream.offsets.len() as u64)
            .unwrap_or(0))
    }

    async fn head_position(&self) -> Result<u64, EventStoreError> {
        Ok(self.ledger.read().await.log.len() as u64)
    }

    fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.notifier.subscribe()
    }
}
