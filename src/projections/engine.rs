// Copyright 2025 Cowboy AI, LLC.

//! Projection engine
//!
//! Applies events to a [`Projection`], tracks the per-row watermark, halts an
//! aggregate whose event fails, and rebuilds the whole model from the log.
//!
//! Progress is written to a [`CheckpointStore`] after every event. The model
//! itself lives in memory, so a restarted engine calls
//! [`ProjectionEngine::restore`] to replay the log up to its stored checkpoint
//! and carry on from there.

use super::{Projection, ProjectionError, ProjectionRecord};
use crate::events::DomainEvent;
use crate::infrastructure::{
    CheckpointStore, EventStore, InMemoryCheckpointStore, ProjectionCheckpoint, UpcasterRegistry,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// What happened to one delivered event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingested {
    /// Folded into its row
    Applied,
    /// At or below the row's watermark, or already parked
    Duplicate,
    /// Not consumed by this projection
    Ignored,
    /// Held back behind a dead letter of the same aggregate
    Parked,
    /// The projection failed; the aggregate is now halted
    DeadLettered,
}

/// An event the projection could not apply, plus what queued up behind it
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    /// Aggregate id
    pub aggregate_id: String,
    /// The failing event
    pub event: DomainEvent,
    /// Failure message
    pub error: String,
    /// Later events of the same aggregate waiting for resolution
    pub parked: Vec<DomainEvent>,
    /// When the failure happened
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct ReadModel<R> {
    records: BTreeMap<String, ProjectionRecord<Option<R>>>,
    halted: BTreeMap<String, DeadLetter>,
    position: u64,
}

impl<R> Default for ReadModel<R> {
    fn default() -> Self {
        Self {
            records: BTreeMap::new(),
            halted: BTreeMap::new(),
            position: 0,
        }
    }
}

impl<R: Clone> ReadModel<R> {
    fn projected_version(&self, aggregate_id: &str) -> u64 {
        self.records
            .get(aggregate_id)
            .map(|record| record.projected_version)
            .unwrap_or(0)
    }

    fn ingest<P>(
        &mut self,
        projection: &P,
        upcasters: &UpcasterRegistry,
        event: &DomainEvent,
    ) -> Ingested
    where
        P: Projection<Row = R>,
    {
        self.position = self.position.max(event.position);
        if !projection.accepts(event) {
            return Ingested::Ignored;
        }
        if event.version <= self.projected_version(&event.aggregate_id) {
            return Ingested::Duplicate;
        }

        if let Some(dead) = self.halted.get_mut(&event.aggregate_id) {
            let seen = dead.event.version == event.version
                || dead.parked.iter().any(|p| p.version == event.version);
            if seen {
                return Ingested::Duplicate;
            }
            dead.parked.push(event.clone());
            return Ingested::Parked;
        }

        match self.apply_one(projection, upcasters, event) {
            Ok(()) => Ingested::Applied,
            Err(e) => {
                self.halt(event.clone(), e.to_string(), Vec::new());
                Ingested::DeadLettered
            }
        }
    }

    fn apply_one<P>(
        &mut self,
        projection: &P,
        upcasters: &UpcasterRegistry,
        event: &DomainEvent,
    ) -> Result<(), ProjectionError>
    where
        P: Projection<Row = R>,
    {
        let current = self.records.get(&event.aggregate_id);
        let expected = current.map(|r| r.projected_version).unwrap_or(0) + 1;
        if event.version != expected {
            return Err(ProjectionError::VersionGap {
                aggregate_id: event.aggregate_id.clone(),
                expected,
                found: event.version,
            });
        }

        let upcast = upcasters.upcast(event)?;
        let row = projection.apply(current.and_then(|r| r.row.as_ref()), &upcast)?;
        self.records.insert(
            event.aggregate_id.clone(),
            ProjectionRecord {
                row,
                projected_version: event.version,
                projected_position: event.position,
            },
        );
        Ok(())
    }

    fn halt(&mut self, event: DomainEvent, error: String, parked: Vec<DomainEvent>) {
        self.halted.insert(
            event.aggregate_id.clone(),
            DeadLetter {
                aggregate_id: event.aggregate_id.clone(),
                event,
                error,
                parked,
                failed_at: Utc::now(),
            },
        );
    }
}

/// Drives one projection over the event log
pub struct ProjectionEngine<P: Projection> {
    projection: P,
    store: Arc<dyn EventStore>,
    upcasters: Arc<UpcasterRegistry>,
    checkpoints: Arc<dyn CheckpointStore>,
    model: RwLock<ReadModel<P::Row>>,
    /// Serializes ingestion, resolution and the rebuild swap; guards progress
    ingestion: Mutex<ProjectionCheckpoint>,
}

impl<P: Projection> ProjectionEngine<P> {
    /// Create an engine reading from `store`
    pub fn new(projection: P, store: Arc<dyn EventStore>) -> Self {
        Self {
            projection,
            store,
            upcasters: Arc::new(UpcasterRegistry::new()),
            checkpoints: Arc::new(InMemoryCheckpointStore::new()),
            model: RwLock::new(ReadModel::default()),
            ingestion: Mutex::new(ProjectionCheckpoint::beginning(P::NAME)),
        }
    }

    /// Upcast events before they reach the projection
    pub fn with_upcasters(mut self, upcasters: Arc<UpcasterRegistry>) -> Self {
        self.upcasters = upcasters;
        self
    }

    /// Record progress in `checkpoints` and restore from them
    pub fn with_checkpoint_store(mut self, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    /// The projection definition
    pub fn projection(&self) -> &P {
        &self.projection
    }

    /// Apply one delivered event. Safe to call with duplicates.
    ///
    /// A failing event does not return an error: it halts its aggregate and is
    /// kept as a [`DeadLetter`]. Errors are reserved for checkpoint failures.
    pub async fn handle(&self, event: &DomainEvent) -> Result<Ingested, ProjectionError> {
        let mut checkpoint = self.ingestion.lock().await;
        let outcome = {
            let mut model = self.model.write().await;
            model.ingest(&self.projection, &self.upcasters, event)
        };

        match outcome {
            Ingested::Applied => debug!(
                projection = P::NAME,
                aggregate_id = %event.aggregate_id,
                version = event.version,
                "Projected event"
            ),
            Ingested::Parked => warn!(
                projection = P::NAME,
                aggregate_id = %event.aggregate_id,
                version = event.version,
                "Parked event behind dead letter"
            ),
            Ingested::DeadLettered => {
                error!(
                    projection = P::NAME,
                    aggregate_id = %event.aggregate_id,
                    version = event.version,
                    event_type = %event.event_type,
                    "Projection failed, aggregate halted"
                );
                checkpoint.record_error(format!(
                    "{} v{} failed",
                    event.aggregate_id, event.version
                ));
            }
            Ingested::Duplicate | Ingested::Ignored => {}
        }

        checkpoint.advance(event.position);
        self.checkpoints.save_checkpoint(&checkpoint).await?;
        Ok(outcome)
    }

    /// Current row of an aggregate
    pub async fn get(&self, aggregate_id: &str) -> Option<ProjectionRecord<P::Row>> {
        let model = self.model.read().await;
        let record = model.records.get(aggregate_id)?;
        let row = record.row.clone()?;
        Some(ProjectionRecord {
            row,
            projected_version: record.projected_version,
            projected_position: record.projected_position,
        })
    }

    /// Version of the last event folded for an aggregate (0 if none)
    pub async fn projected_version(&self, aggregate_id: &str) -> u64 {
        self.model.read().await.projected_version(aggregate_id)
    }

    /// Highest global position delivered to this engine
    pub async fn position(&self) -> u64 {
        self.model.read().await.position
    }

    /// Progress counters
    pub async fn checkpoint(&self) -> ProjectionCheckpoint {
        self.ingestion.lock().await.clone()
    }

    /// Whether an aggregate is halted behind a dead letter
    pub async fn is_halted(&self, aggregate_id: &str) -> bool {
        self.model.read().await.halted.contains_key(aggregate_id)
    }

    /// All dead letters, ordered by aggregate id
    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.model.read().await.halted.values().cloned().collect()
    }

    /// Rows as canonical JSON, ordered by aggregate id
    pub async fn snapshot_model(&self) -> Result<String, ProjectionError> {
        let model = self.model.read().await;
        Ok(serde_json::to_string(&CanonicalModel {
            projection: P::NAME,
            records: &model.records,
        })?)
    }

    /// Retry a halted aggregate from the store.
    ///
    /// Re-reads the aggregate's events after its watermark, up to the engine's
    /// position, and applies them in order. Returns the number applied. If one
    /// fails again the aggregate stays halted on that event.
    pub async fn resolve(&self, aggregate_id: &str) -> Result<usize, ProjectionError> {
        let _ingestion = self.ingestion.lock().await;
        let (from, position) = {
            let model = self.model.read().await;
            if !model.halted.contains_key(aggregate_id) {
                return Err(ProjectionError::NotHalted(aggregate_id.to_string()));
            }
            (model.projected_version(aggregate_id), model.position)
        };

        let pending: Vec<DomainEvent> = self
            .store
            .get_events(aggregate_id, from)
            .await?
            .into_iter()
            .filter(|event| event.position <= position)
            .collect();

        let mut model = self.model.write().await;
        model.halted.remove(aggregate_id);

        for (applied, event) in pending.iter().enumerate() {
            if let Err(e) = model.apply_one(&self.projection, &self.upcasters, event) {
                warn!(
                    projection = P::NAME,
                    aggregate_id = %aggregate_id,
                    version = event.version,
                    applied,
                    error = %e,
                    "Resolution failed, aggregate stays halted"
                );
                model.halt(event.clone(), e.to_string(), pending[applied + 1..].to_vec());
                return Err(e);
            }
        }

        info!(
            projection = P::NAME,
            aggregate_id = %aggregate_id,
            applied = pending.len(),
            "Resolved dead letter"
        );
        Ok(pending.len())
    }

    /// Pick up from the stored checkpoint after a restart.
    ///
    /// Replays the log up to the checkpoint's position into a fresh model and
    /// adopts the stored progress counters, so a subscription started
    /// afterwards only delivers what came later. Without a stored checkpoint
    /// nothing changes. A checkpoint beyond the head of the log cannot be
    /// trusted and triggers a full [`rebuild`](Self::rebuild). Returns the
    /// position the engine resumes from.
    pub async fn restore(&self) -> Result<u64, ProjectionError> {
        let Some(stored) = self.checkpoints.load_checkpoint(P::NAME).await? else {
            debug!(projection = P::NAME, "No stored checkpoint");
            return Ok(self.position().await);
        };

        let head = self.store.head_position().await?;
        if stored.position > head {
            warn!(
                projection = P::NAME,
                checkpoint = stored.position,
                head,
                "Checkpoint is ahead of the log, rebuilding"
            );
            self.rebuild().await?;
            return Ok(self.position().await);
        }

        let mut checkpoint = self.ingestion.lock().await;
        let mut fresh = ReadModel::default();
        for event in self
            .store
            .get_all_events(0)
            .await?
            .iter()
            .take_while(|event| event.position <= stored.position)
        {
            fresh.ingest(&self.projection, &self.upcasters, event);
        }
        fresh.position = stored.position;

        let position = stored.position;
        *checkpoint = stored;
        *self.model.write().await = fresh;

        info!(
            projection = P::NAME,
            position,
            events_processed = checkpoint.events_processed,
            "Restored projection from checkpoint"
        );
        Ok(position)
    }

    /// Rebuild the model from the start of the log and swap it in.
    ///
    /// The new model is built off to the side; readers see the old one until
    /// the swap. Dropping the future before it completes leaves the live model
    /// untouched. Returns the number of events replayed.
    pub async fn rebuild(&self) -> Result<u64, ProjectionError> {
        info!(projection = P::NAME, "Rebuilding projection");

        let mut fresh = ReadModel::default();
        let mut progress = ProjectionCheckpoint::beginning(P::NAME);
        let mut replay = |fresh: &mut ReadModel<P::Row>, events: &[DomainEvent]| {
            for event in events {
                if fresh.ingest(&self.projection, &self.upcasters, event)
                    == Ingested::DeadLettered
                {
                    progress.record_error(format!(
                        "{} v{} failed",
                        event.aggregate_id, event.version
                    ));
                }
                progress.advance(event.position);
            }
        };

        let history = self.store.get_all_events(0).await?;
        replay(&mut fresh, &history);

        let mut checkpoint = self.ingestion.lock().await;
        let tail = self.store.get_all_events(fresh.position).await?;
        replay(&mut fresh, &tail);

        let replayed = progress.events_processed;
        self.checkpoints.save_checkpoint(&progress).await?;
        *checkpoint = progress;
        *self.model.write().await = fresh;

        info!(projection = P::NAME, replayed, "Projection rebuilt");
        Ok(replayed)
    }
}

#[derive(Serialize)]
struct CanonicalModel<'a, R: Serialize> {
    projection: &'a str,
    records: &'a BTreeMap<String, ProjectionRecord<Option<R>>>,
}
