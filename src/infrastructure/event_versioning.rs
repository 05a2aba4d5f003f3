// Copyright 2025 Cowboy AI, LLC.

//! Event versioning and schema evolution support
//!
//! Stored events keep the payload shape they were written with. Before an event
//! reaches application code it passes through the [`UpcasterRegistry`], a table
//! of pure transforms keyed by `(event_type, from_version)`. Transforms are
//! applied repeatedly until none matches the event's current schema tag.
//! Upcasting is read-time only; the log is never rewritten.

use crate::events::DomainEvent;
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use tracing::trace;

/// A pure payload transform from one schema version to the next
pub type UpcastFn = fn(&Value) -> Result<Value, String>;

/// Errors that can occur during event versioning operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpcastError {
    /// Two transforms claim the same starting schema
    #[error("Upcaster for {event_type} v{from} is already registered")]
    DuplicateUpcaster {
        /// Event type
        event_type: String,
        /// Source version
        from: u32,
    },

    /// Transforms must move strictly forward
    #[error("Upcaster for {event_type} must increase the version, got v{from} -> v{to}")]
    InvalidTransform {
        /// Event type
        event_type: String,
        /// Source version
        from: u32,
        /// Target version
        to: u32,
    },

    /// No transform chain reaches the schema application code expects
    #[error("No upcaster path for {event_type} from v{found} to v{expected}")]
    UnsupportedSchema {
        /// Event type
        event_type: String,
        /// Schema version the chain stopped at
        found: u32,
        /// Declared current schema version
        expected: u32,
    },

    /// The upcasting transformation failed
    #[error("Upcasting {event_type} from v{from} failed: {reason}")]
    TransformFailed {
        /// Event type
        event_type: String,
        /// Source version of the failing transform
        from: u32,
        /// Transform's error message
        reason: String,
    },
}

/// One schema migration step
#[derive(Debug, Clone)]
pub struct Upcaster {
    /// Event type the transform applies to
    pub event_type: String,
    /// Schema version it reads
    pub from_version: u32,
    /// Schema version it produces
    pub to_version: u32,
    transform: UpcastFn,
}

impl Upcaster {
    /// Create a migration step
    pub fn new(
        event_type: impl Into<String>,
        from_version: u32,
        to_version: u32,
        transform: UpcastFn,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            from_version,
            to_version,
            transform,
        }
    }

    fn apply(&self, payload: &Value) -> Result<Value, UpcastError> {
        (self.transform)(payload).map_err(|reason| UpcastError::TransformFailed {
            event_type: self.event_type.clone(),
            from: self.from_version,
            reason,
        })
    }
}

/// Ordered table of upcasters plus the schema version each event type is read at
#[derive(Debug, Clone, Default)]
pub struct UpcasterRegistry {
    upcasters: IndexMap<(String, u32), Upcaster>,
    current_versions: HashMap<String, u32>,
    /// Highest `to_version` registered per event type
    latest_versions: HashMap<String, u32>,
}

impl UpcasterRegistry {
    /// Create an empty registry; every event passes through unchanged
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the schema version application code expects for `event_type`
    pub fn register_event_type(&mut self, event_type: impl Into<String>, current_version: u32) {
        self.current_versions
            .insert(event_type.into(), current_version);
    }

    /// Register a migration step
    pub fn register(&mut self, upcaster: Upcaster) -> Result<(), UpcastError> {
        if upcaster.to_version <= upcaster.from_version {
            return Err(UpcastError::InvalidTransform {
                event_type: upcaster.event_type,
                from: upcaster.from_version,
                to: upcaster.to_version,
            });
        }
        let key = (upcaster.event_type.clone(), upcaster.from_version);
        if self.upcasters.contains_key(&key) {
            return Err(UpcastError::DuplicateUpcaster {
                event_type: key.0,
                from: key.1,
            });
        }
        let latest = self.latest_versions.entry(key.0.clone()).or_insert(1);
        *latest = (*latest).max(upcaster.to_version);
        self.upcasters.insert(key, upcaster);
        Ok(())
    }

    /// Builder form of [`register`](Self::register)
    pub fn with(mut self, upcaster: Upcaster) -> Result<Self, UpcastError> {
        self.register(upcaster)?;
        Ok(self)
    }

    /// Schema version new events of `event_type` are written with.
    ///
    /// The declared version if any, else the newest version an upcaster
    /// produces, else 1.
    pub fn current_version(&self, event_type: &str) -> u32 {
        self.current_versions
            .get(event_type)
            .or_else(|| self.latest_versions.get(event_type))
            .copied()
            .unwrap_or(1)
    }

    /// Number of registered transforms
    pub fn len(&self) -> usize {
        self.upcasters.len()
    }

    /// Whether no transforms are registered
    pub fn is_empty(&self) -> bool {
        self.upcasters.is_empty()
    }

    /// Bring a raw payload up to the latest shape, returning it with its final schema version
    pub fn upcast_payload(
        &self,
        event_type: &str,
        mut payload: Value,
        schema_version: u32,
    ) -> Result<(Value, u32), UpcastError> {
        let mut version = schema_version;

        while let Some(upcaster) = self.upcasters.get(&(event_type.to_string(), version)) {
            trace!(
                event_type = %event_type,
                from = upcaster.from_version,
                to = upcaster.to_version,
                "Upcasting event payload"
            );
            payload = upcaster.apply(&payload)?;
            version = upcaster.to_version;
        }

        if let Some(&expected) = self.current_versions.get(event_type) {
            if version != expected {
                return Err(UpcastError::UnsupportedSchema {
                    event_type: event_type.to_string(),
                    found: version,
                    expected,
                });
            }
        }

        Ok((payload, version))
    }

    /// Return a copy of `event` in the latest schema; the stored event is untouched
    pub fn upcast(&self, event: &DomainEvent) -> Result<DomainEvent, UpcastError> {
        let (payload, schema_version) = self.upcast_payload(
            &event.event_type,
            event.payload.clone(),
            event.schema_version,
        )?;
        Ok(DomainEvent {
            payload,
            schema_version,
            ..event.clone()
        })
    }
}
