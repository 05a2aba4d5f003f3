// Copyright 2025 Cowboy AI, LLC.

//! Infrastructure layer for cim-ledger
//!
//! This module contains the storage and delivery concerns:
//! - Event store with optimistic concurrency
//! - Snapshot storage and snapshot policies
//! - Read-time event upcasting
//! - Projection checkpoints
//! - Subscriptions fanning the log out to consumers
//! - Saga coordination

pub mod event_store;
/// Event versioning and schema evolution support
pub mod event_versioning;
/// Projection checkpoint storage for fault-tolerant event processing
pub mod projection_checkpoint;
/// Saga pattern implementation for cross-aggregate workflows
pub mod saga;
/// Automatic snapshot policies
pub mod snapshot_policy;
pub mod snapshot_store;
pub mod subscription;

pub use event_store::{EventStore, EventStoreError, InMemoryEventStore, DEFAULT_BROADCAST_CAPACITY};
pub use event_versioning::{UpcastError, UpcastFn, Upcaster, UpcasterRegistry};
pub use projection_checkpoint::{
    CheckpointError, CheckpointStore, InMemoryCheckpointStore, ProjectionCheckpoint,
};
pub use saga::{
    CommandBus, InMemorySagaRepository, SagaCommand, SagaCoordinator, SagaDefinition, SagaError,
    SagaInput, SagaInstance, SagaReaction, SagaRepository, SagaRunner, SagaState, SagaTransition,
};
pub use snapshot_policy::{SnapshotPolicy, DEFAULT_SNAPSHOT_INTERVAL};
pub use snapshot_store::{AggregateSnapshot, InMemorySnapshotStore, SnapshotError, SnapshotStore};
pub use subscription::{
    live_events, spawn_subscription, EventSubscriber, SubscriptionConfig, SubscriptionError,
    SubscriptionHandle,
};
