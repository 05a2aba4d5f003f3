// Copyright 2025 Cowboy AI, LLC.

//! Read model projections
//!
//! Projections are read models updated by handling domain events. Each row is
//! keyed by aggregate id and carries the version of the last event folded into
//! it, which makes re-delivery harmless: an event at or below the watermark is
//! skipped.

mod engine;
mod runner;

pub use engine::{DeadLetter, Ingested, ProjectionEngine};
pub use runner::ProjectionRunner;

use crate::events::DomainEvent;
use crate::infrastructure::{CheckpointError, EventStoreError, UpcastError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use thiserror::Error;

/// Errors raised while projecting events
#[derive(Debug, Error)]
pub enum ProjectionError {
    /// The projection refused the event
    #[error("Projection failed: {0}")]
    Apply(String),

    /// An event arrived ahead of its predecessor
    #[error("Version gap on {aggregate_id}: expected {expected}, found {found}")]
    VersionGap {
        /// Aggregate id
        aggregate_id: String,
        /// Next version the row expects
        expected: u64,
        /// Version received
        found: u64,
    },

    /// The event could not be brought to the current schema
    #[error("Upcast error: {0}")]
    Upcast(#[from] UpcastError),

    /// Decoding an event or encoding the model failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Reading the log failed
    #[error("Event store error: {0}")]
    Store(#[from] EventStoreError),

    /// Recording progress failed
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// `resolve` was called for an aggregate that is not halted
    #[error("Aggregate {0} has no dead letter to resolve")]
    NotHalted(String),
}

impl ProjectionError {
    /// Build an [`Apply`](Self::Apply) error
    pub fn apply(reason: impl Into<String>) -> Self {
        ProjectionError::Apply(reason.into())
    }
}

/// A read model definition
pub trait Projection: Send + Sync + 'static {
    /// Name used for checkpoints and logs
    const NAME: &'static str;

    /// One row of the read model
    type Row: Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Whether this projection consumes `event`.
    ///
    /// Filter whole aggregates (usually by `aggregate_type`), never single
    /// events of an accepted aggregate: the version watermark assumes every
    /// event of a row passes through [`apply`](Self::apply).
    fn accepts(&self, _event: &DomainEvent) -> bool {
        true
    }

    /// Compute the row after `event`. `None` means the aggregate has no row.
    ///
    /// Must be pure: timestamps come from the event, never the clock.
    fn apply(
        &self,
        current: Option<&Self::Row>,
        event: &DomainEvent,
    ) -> Result<Option<Self::Row>, ProjectionError>;
}

/// A projected row and how far it has caught up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionRecord<R> {
    /// Row contents
    pub row: R,
    /// Version of the last event folded into the row
    pub projected_version: u64,
    /// Global position of that event
    pub projected_position: u64,
}
