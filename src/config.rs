// Copyright 2025 Cowboy AI, LLC.

//! Ledger configuration
//!
//! Every tunable of the write and read paths in one serde struct. All fields
//! have defaults, so an empty TOML document is a valid configuration:
//!
//! ```toml
//! [snapshot]
//! interval = 50
//! after_events = ["AccountClosed"]
//!
//! [query]
//! timeout_ms = 1000
//! poll_interval_ms = 10
//!
//! [retry]
//! max_attempts = 3
//! backoff_ms = 10
//!
//! [subscription]
//! retry_delay_ms = 250
//! ```

use crate::command_handlers::RetryPolicy;
use crate::infrastructure::{SnapshotPolicy, SubscriptionConfig};
use crate::query_handlers::QueryConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("Failed to read {path}: {source}")]
    Io {
        /// File path
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The document is not valid TOML for this structure
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// When the repository snapshots aggregates
    pub snapshot: SnapshotPolicy,
    /// Read-your-writes waiting
    pub query: QueryConfig,
    /// Command retry on concurrency conflicts
    pub retry: RetryPolicy,
    /// Projection and saga subscriptions
    pub subscription: SubscriptionConfig,
}

impl LedgerConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Reject values the runtime cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.snapshot.enabled && self.snapshot.interval == 0 && self.snapshot.after_events.is_empty() {
            return Err(ConfigError::Invalid(
                "snapshot.interval must be positive when snapshots are enabled".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.query.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "query.poll_interval_ms must be positive".into(),
            ));
        }
        if self.query.poll_interval_ms > self.query.timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "query.poll_interval_ms ({}) exceeds query.timeout_ms ({})",
                self.query.poll_interval_ms, self.query.timeout_ms
            )));
        }
        Ok(())
    }
}
