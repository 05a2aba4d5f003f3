// Copyright 2025 Cowboy AI, LLC.

//! Domain events for the ledger
//!
//! Events represent facts that have occurred to one aggregate. They are immutable
//! once appended and form the single source of truth for both aggregate state and
//! every read model.
//!
//! Aggregates describe their events as adjacently tagged serde enums
//! (`#[serde(tag = "type", content = "data")]`). The tag becomes the stored
//! `event_type` and the content becomes the stored `payload`, so the persisted
//! record never depends on Rust type names.

use crate::identifiers::{CausationId, CorrelationId, EventId};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Persisted form of a domain event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Globally unique event id
    pub event_id: EventId,
    /// Aggregate this event belongs to
    pub aggregate_id: String,
    /// Aggregate type (e.g. "Account", "Order")
    pub aggregate_type: String,
    /// Event type tag
    pub event_type: String,
    /// Per-aggregate sequence number this event produces, starting at 1
    pub version: u64,
    /// Global append position assigned by the store, starting at 1
    pub position: u64,
    /// Schema version of `payload`
    pub schema_version: u32,
    /// Structured event body
    pub payload: Value,
    /// Actor, correlation and causation
    pub metadata: EventMetadata,
    /// When the store accepted the event
    pub created_at: DateTime<Utc>,
}

impl DomainEvent {
    /// Get the correlation ID from metadata
    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        self.metadata.correlation_id.as_ref()
    }

    /// Decode the payload into an aggregate's event enum
    pub fn decode<E: DeserializeOwned>(&self) -> Result<E, serde_json::Error> {
        decode_event(&self.event_type, &self.payload)
    }
}

/// Event metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// User or system that triggered the event
    pub actor: Option<String>,

    /// Correlation ID for tracking related events
    pub correlation_id: Option<CorrelationId>,

    /// Causation ID - the event that caused this event
    pub causation_id: Option<CausationId>,

    /// When the command producing this event was issued
    pub timestamp: Option<DateTime<Utc>>,

    /// Additional custom metadata
    pub custom: Option<Value>,
}

impl EventMetadata {
    /// Metadata stamped with the current time
    pub fn now() -> Self {
        Self {
            timestamp: Some(Utc::now()),
            ..Self::default()
        }
    }

    /// Set the actor
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Set the correlation id
    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Set the causation id
    pub fn caused_by(mut self, causation_id: impl Into<CausationId>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }

    /// Get a custom metadata value by key
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.custom.as_ref()?.get(key)
    }
}

/// An event raised by an aggregate but not yet appended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    /// Event type tag
    pub event_type: String,
    /// Schema version of `payload`
    pub schema_version: u32,
    /// Structured event body
    pub payload: Value,
    /// Actor, correlation and causation
    pub metadata: EventMetadata,
}

impl NewEvent {
    /// Build an uncommitted event from raw parts
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            schema_version: 1,
            payload,
            metadata: EventMetadata::default(),
        }
    }

    /// Build an uncommitted event from a typed, adjacently tagged event enum
    pub fn from_typed<E: Serialize>(event: &E) -> Result<Self, serde_json::Error> {
        let (event_type, payload) = encode_event(event)?;
        Ok(Self::new(event_type, payload))
    }

    /// Set the schema version
    pub fn with_schema_version(mut self, schema_version: u32) -> Self {
        self.schema_version = schema_version;
        self
    }

    /// Set the metadata
    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Split an adjacently tagged event into its `(event_type, payload)` pair.
///
/// Fieldless variants produce a `Null` payload.
pub fn encode_event<E: Serialize>(event: &E) -> Result<(String, Value), serde_json::Error> {
    let value = serde_json::to_value(event)?;
    let Value::Object(mut map) = value else {
        return Err(serde::ser::Error::custom(
            "event must serialize as an adjacently tagged object",
        ));
    };
    let event_type = match map.remove("type") {
        Some(Value::String(tag)) => tag,
        _ => {
            return Err(serde::ser::Error::custom(
                "event is missing its \"type\" tag",
            ))
        }
    };
    let payload = map.remove("data").unwrap_or(Value::Null);
    Ok((event_type, payload))
}

/// Rebuild an adjacently tagged event from its stored `(event_type, payload)` pair
pub fn decode_event<E: DeserializeOwned>(
    event_type: &str,
    payload: &Value,
) -> Result<E, serde_json::Error> {
    let tagged = if payload.is_null() {
        serde_json::json!({ "type": event_type })
    } else {
        serde_json::json!({ "type": event_type, "data": payload })
    };
    serde_json::from_value(tagged)
}
