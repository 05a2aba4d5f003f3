// Copyright 2025 Cowboy AI, LLC.

//! Projection checkpoint storage for fault-tolerant event processing
//!
//! A checkpoint records the global log position a consumer has fully handled,
//! enabling it to resume from where it left off after a restart. Delivery from a
//! checkpoint is at-least-once; consumers must be idempotent.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

/// Errors that can occur during checkpoint operations
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Backend failure
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A checkpoint storing consumer progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionCheckpoint {
    /// Unique identifier for the consumer
    pub projection_id: String,
    /// Global position of the last handled event
    pub position: u64,
    /// When this checkpoint was last updated
    pub last_processed_at: DateTime<Utc>,
    /// Total number of events processed
    pub events_processed: u64,
    /// Number of errors encountered
    pub errors: u32,
    /// Description of the last error (if any)
    pub last_error: Option<String>,
}

impl ProjectionCheckpoint {
    /// A checkpoint at the start of the log
    pub fn beginning(projection_id: impl Into<String>) -> Self {
        Self {
            projection_id: projection_id.into(),
            position: 0,
            last_processed_at: Utc::now(),
            events_processed: 0,
            errors: 0,
            last_error: None,
        }
    }

    /// Record one handled event
    pub fn advance(&mut self, position: u64) {
        if position > self.position {
            self.position = position;
        }
        self.events_processed += 1;
        self.last_processed_at = Utc::now();
    }

    /// Record a failure without moving the position
    pub fn record_error(&mut self, error: impl Into<String>) {
        self.errors += 1;
        self.last_error = Some(error.into());
    }
}

/// Trait for checkpoint storage implementations
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Save or update a checkpoint
    async fn save_checkpoint(
        &self,
        checkpoint: &ProjectionCheckpoint,
    ) -> Result<(), CheckpointError>;

    /// Load a checkpoint by projection ID
    async fn load_checkpoint(
        &self,
        projection_id: &str,
    ) -> Result<Option<ProjectionCheckpoint>, CheckpointError>;

    /// Delete a checkpoint
    async fn delete_checkpoint(&self, projection_id: &str) -> Result<(), CheckpointError>;
}

/// In-memory checkpoint storage
///
/// Checkpoints are held as serialized JSON so a backend swap does not change
/// what round-trips.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryCheckpointStore {
    /// Create a new in-memory checkpoint store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save_checkpoint(
        &self,
        checkpoint: &ProjectionCheckpoint,
    ) -> Result<(), CheckpointError> {
        let value = serde_json::to_vec(checkpoint)?;
        self.checkpoints
            .write()
            .await
            .insert(checkpoint.projection_id.clone(), value);

        debug!(
            projection_id = %checkpoint.projection_id,
            position = checkpoint.position,
            "Saved checkpoint"
        );
        Ok(())
    }

    async fn load_checkpoint(
        &self,
        projection_id: &str,
    ) -> Result<Option<ProjectionCheckpoint>, CheckpointError> {
        let checkpoints = self.checkpoints.read().await;
        match checkpoints.get(projection_id) {
            Some(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
            None => Ok(None),
        }
    }

    async fn delete_checkpoint(&self, projection_id: &str) -> Result<(), CheckpointError> {
        self.checkpoints.write().await.remove(projection_id);
        Ok(())
    }
}
