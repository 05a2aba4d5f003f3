// Copyright 2025 Cowboy AI, LLC.

//! Snapshot store for aggregate state persistence
//!
//! Snapshots are a read-amplification optimization only. The repository
//! decides when to take them and whether a loaded one is usable; the store
//! just keeps them.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

/// Errors that can occur during snapshot operations
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// Error from underlying storage system
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Error serializing or deserializing snapshot data
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Snapshot of aggregate state at a specific version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    /// ID of the aggregate this snapshot belongs to
    pub aggregate_id: String,
    /// Type name of the aggregate
    pub aggregate_type: String,
    /// Version of the last event folded into `data`
    pub version: u64,
    /// Serialized aggregate state
    pub data: Bytes,
    /// Timestamp when the snapshot was created
    pub created_at: DateTime<Utc>,
}

impl AggregateSnapshot {
    /// Serialize `state` as a snapshot at `version`
    pub fn capture<S: Serialize>(
        aggregate_id: impl Into<String>,
        aggregate_type: impl Into<String>,
        version: u64,
        state: &S,
    ) -> Result<Self, SnapshotError> {
        let data = serde_json::to_vec(state)
            .map_err(|e| SnapshotError::SerializationError(e.to_string()))?;
        Ok(Self {
            aggregate_id: aggregate_id.into(),
            aggregate_type: aggregate_type.into(),
            version,
            data: Bytes::from(data),
            created_at: Utc::now(),
        })
    }

    /// Deserialize the captured state
    pub fn restore<S: serde::de::DeserializeOwned>(&self) -> Result<S, SnapshotError> {
        serde_json::from_slice(&self.data)
            .map_err(|e| SnapshotError::SerializationError(e.to_string()))
    }
}

/// Trait for storing and retrieving aggregate snapshots
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Save a snapshot; older snapshots are superseded, not deleted
    async fn save(&self, snapshot: AggregateSnapshot) -> Result<(), SnapshotError>;

    /// Get the most recent snapshot for an aggregate
    async fn load_latest(
        &self,
        aggregate_id: &str,
    ) -> Result<Option<AggregateSnapshot>, SnapshotError>;
}

/// In-memory snapshot store retaining every snapshot taken
#[derive(Default)]
pub struct InMemorySnapshotStore {
    snapshots: RwLock<HashMap<String, Vec<AggregateSnapshot>>>,
}

impl InMemorySnapshotStore {
    /// Create a new in-memory snapshot store
    pub fn new() -> Self {
        Self::default()
    }

    /// All snapshots of one aggregate, oldest first
    pub async fn history(&self, aggregate_id: &str) -> Vec<AggregateSnapshot> {
        self.snapshots
            .read()
            .await
            .get(aggregate_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save(&self, snapshot: AggregateSnapshot) -> Result<(), SnapshotError> {
        debug!(
            aggregate_id = %snapshot.aggregate_id,
            version = snapshot.version,
            "Saving snapshot"
        );
        let mut snapshots = self.snapshots.write().await;
        snapshots
            .entry(snapshot.aggregate_id.clone())
            .or_default()
            .push(snapshot);
        Ok(())
    }

    async fn load_latest(
        &self,
        aggregate_id: &str,
    ) -> Result<Option<AggregateSnapshot>, SnapshotError> {
        let snapshots = self.snapshots.read().await;
        Ok(snapshots
            .get(aggregate_id)
            .and_then(|history| history.iter().max_by_key(|s| s.version))
            .cloned())
    }
}
