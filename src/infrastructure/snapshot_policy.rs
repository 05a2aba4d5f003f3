// Copyright 2025 Cowboy AI, LLC.

//! Snapshot policies
//!
//! Decides when the repository persists a new snapshot after a save. Never on
//! the correctness path: a repository that ignores every snapshot must produce
//! identical aggregate state.

use serde::{Deserialize, Serialize};

/// Default number of events between snapshots
pub const DEFAULT_SNAPSHOT_INTERVAL: u64 = 50;

/// Policy configuration for automatic snapshots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotPolicy {
    /// Whether this policy is active
    pub enabled: bool,
    /// Snapshot whenever a save moves the version across a multiple of this
    pub interval: u64,
    /// Additionally snapshot right after these event types
    pub after_events: Vec<String>,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: DEFAULT_SNAPSHOT_INTERVAL,
            after_events: Vec::new(),
        }
    }
}

impl SnapshotPolicy {
    /// Policy that never snapshots
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Policy snapshotting every `interval` events
    pub fn every(interval: u64) -> Self {
        Self {
            interval,
            ..Self::default()
        }
    }

    /// Whether a save that moved the stream from `previous` to `current`
    /// (raising `event_types`) should be followed by a snapshot
    pub fn should_snapshot<'a>(
        &self,
        previous: u64,
        current: u64,
        mut event_types: impl Iterator<Item = &'a str>,
    ) -> bool {
        if !self.enabled || current <= previous {
            return false;
        }
        if self.interval > 0 && current / self.interval > previous / self.interval {
            return true;
        }
        event_types.any(|event_type| self.after_events.iter().any(|e| e == event_type))
    }
}
