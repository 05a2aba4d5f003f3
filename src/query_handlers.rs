// Copyright 2025 Cowboy AI, LLC.

//! Query handlers for projected read models
//!
//! Queries read projections only; they never load aggregates or touch the
//! event store. A caller that just wrote at version `n` can ask for a row at
//! `min_version = n` to read its own write. The service waits for the projection
//! to catch up, up to a timeout.

use crate::projections::{Projection, ProjectionEngine, ProjectionRecord};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Query errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    /// No row exists for the id
    #[error("No {projection} row for {id}")]
    NotFound {
        /// Projection name
        projection: String,
        /// Requested id
        id: String,
    },

    /// The projection did not reach the requested version in time
    #[error("Projection lag on {id}: wanted version {min_version}, projected {projected_version}")]
    ProjectionLag {
        /// Requested id
        id: String,
        /// Version the caller needs
        min_version: u64,
        /// Version the projection had reached
        projected_version: u64,
    },
}

impl QueryError {
    /// Whether trying again later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueryError::ProjectionLag { .. })
    }
}

/// Read-your-writes tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// How long to wait for a projection to reach `min_version`
    pub timeout_ms: u64,
    /// How often to re-check while waiting
    pub poll_interval_ms: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 1_000,
            poll_interval_ms: 10,
        }
    }
}

impl QueryConfig {
    /// Wait bound
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Re-check period
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Serves rows of one projection
pub struct QueryService<P: Projection> {
    engine: Arc<ProjectionEngine<P>>,
    config: QueryConfig,
}

impl<P: Projection> Clone for QueryService<P> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            config: self.config.clone(),
        }
    }
}

impl<P: Projection> QueryService<P> {
    /// Create a query service with default timing
    pub fn new(engine: Arc<ProjectionEngine<P>>) -> Self {
        Self::with_config(engine, QueryConfig::default())
    }

    /// Create a query service with explicit timing
    pub fn with_config(engine: Arc<ProjectionEngine<P>>, config: QueryConfig) -> Self {
        Self { engine, config }
    }

    /// Fetch a row, optionally waiting until it reflects `min_version`
    pub async fn get(
        &self,
        id: &str,
        min_version: Option<u64>,
    ) -> Result<ProjectionRecord<P::Row>, QueryError> {
        let Some(min_version) = min_version else {
            return self.engine.get(id).await.ok_or_else(|| self.not_found(id));
        };

        let deadline = Instant::now() + self.config.timeout();
        loop {
            let projected_version = self.engine.projected_version(id).await;
            if projected_version >= min_version {
                debug!(
                    projection = P::NAME,
                    id = %id,
                    min_version,
                    projected_version,
                    "Projection caught up"
                );
                return self.engine.get(id).await.ok_or_else(|| self.not_found(id));
            }

            if Instant::now() >= deadline {
                warn!(
                    projection = P::NAME,
                    id = %id,
                    min_version,
                    projected_version,
                    "Projection lag exceeded timeout"
                );
                return Err(QueryError::ProjectionLag {
                    id: id.to_string(),
                    min_version,
                    projected_version,
                });
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    fn not_found(&self, id: &str) -> QueryError {
        QueryError::NotFound {
            projection: P::NAME.to_string(),
            id: id.to_string(),
        }
    }
}
