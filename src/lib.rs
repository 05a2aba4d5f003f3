// Copyright 2025 Cowboy AI, LLC.

//! # CIM Ledger
//!
//! Event-sourced aggregate store with CQRS read models.
//!
//! The event log is the single source of truth. Aggregates are rebuilt by
//! folding their own events; read models and sagas consume the same log
//! asynchronously and are always reconstructible from it.
//!
//! - **Event Store**: append-only log with compare-and-swap on the aggregate version
//! - **Snapshots**: cached aggregate state, never required for correctness
//! - **Upcasting**: old event schemas are transformed on read, never rewritten
//! - **Repository**: `load -> handle -> save` for one aggregate type
//! - **Projections**: idempotent read models with dead-letter handling and rebuild
//! - **Sagas**: correlated workflows with compensation
//! - **Queries**: read-your-writes with a bounded wait
//!
//! ## Design Principles
//!
//! 1. **One writer wins**: concurrent saves of an aggregate conflict, never merge
//! 2. **Replay is truth**: snapshots and read models are disposable caches
//! 3. **At-least-once**: every consumer tolerates redelivery

#![warn(missing_docs)]

mod aggregate;
mod command_handlers;
mod config;
mod errors;
mod events;
mod identifiers;
mod query_handlers;
pub mod infrastructure;
pub mod persistence;
pub mod projections;

pub use aggregate::{Aggregate, AggregateState, Uncommitted, VersionGap};
pub use command_handlers::{CommandError, CommandHandler, CommandOutcome, RetryPolicy};
pub use config::{ConfigError, LedgerConfig};
pub use errors::{DomainError, DomainResult};
pub use events::{decode_event, encode_event, DomainEvent, EventMetadata, NewEvent};
pub use identifiers::{CausationId, CorrelationId, EventId};
pub use query_handlers::{QueryConfig, QueryError, QueryService};

pub use infrastructure::{
    AggregateSnapshot, CommandBus, EventStore, EventStoreError, InMemoryCheckpointStore,
    InMemoryEventStore, InMemorySagaRepository, InMemorySnapshotStore, SagaCommand,
    SagaCoordinator, SagaDefinition, SagaError, SagaInput, SagaInstance, SagaReaction,
    SagaRunner, SagaState, SnapshotPolicy, SnapshotStore, SubscriptionConfig, UpcastError,
    Upcaster, UpcasterRegistry,
};
pub use persistence::{EventSourcedRepository, RepositoryError};
pub use projections::{
    DeadLetter, Ingested, Projection, ProjectionEngine, ProjectionError, ProjectionRecord,
    ProjectionRunner,
};
