// Copyright 2025 Cowboy AI, LLC.

//! Saga pattern implementation using an explicit state machine
//!
//! A saga coordinates a workflow spanning several aggregates. It reacts to
//! events that share a correlation id, moves through a closed set of states,
//! and dispatches commands. When a step fails it compensates: it dispatches
//! the definition's undo commands and waits for them to be confirmed.
//!
//! ```text
//!            Start            StepConfirmed          Complete
//!   (none) ───────▶ Started ───────────────▶ StepConfirmed ───────▶ Completed
//!                      │                       │   ▲  │
//!                      │ Fail                  │   └──┘ StepConfirmed
//!                      ▼                       │ Fail
//!                 Compensating ◀───────────────┘
//!                   │   ▲  │
//!                   │   └──┘ Fail
//!                   │ CompensationConfirmed
//!                   ▼
//!              Compensated
//! ```
//!
//! Events are delivered at least once. Each instance remembers the ids of the
//! events it has handled and ignores repeats. An event counts as handled only
//! once its commands have been dispatched: if dispatch is interrupted, the
//! redelivered event dispatches them again, so command handlers must tolerate
//! duplicates.

use crate::events::{DomainEvent, EventMetadata};
use crate::identifiers::{CorrelationId, EventId};
use crate::infrastructure::event_store::EventStore;
use crate::infrastructure::subscription::{
    spawn_subscription, EventSubscriber, SubscriptionConfig, SubscriptionError, SubscriptionHandle,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Errors that can occur during saga execution
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SagaError {
    /// Saga instance not found
    #[error("Saga not found: {0}")]
    NotFound(String),

    /// The input is not allowed from the current state
    #[error("Invalid saga transition from {from:?} on {input:?}")]
    InvalidTransition {
        /// State before the input, `None` for a saga that has not started
        from: Option<SagaState>,
        /// Rejected input
        input: SagaInput,
    },

    /// A compensating command failed; the saga needs manual intervention
    #[error("Compensation {command_type} failed for saga {correlation_id}: {reason}")]
    CompensationFailed {
        /// Saga correlation id
        correlation_id: CorrelationId,
        /// Failing command
        command_type: String,
        /// Bus error
        reason: String,
    },

    /// Saga state could not be stored
    #[error("Saga storage error: {0}")]
    Storage(String),
}

/// Saga lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SagaState {
    /// First step dispatched
    Started,
    /// At least one step confirmed
    StepConfirmed,
    /// All steps confirmed
    Completed,
    /// A step failed; compensations dispatched
    Compensating,
    /// Compensations confirmed
    Compensated,
}

impl SagaState {
    /// Apply an input to an optional current state
    pub fn transition(from: Option<SagaState>, input: SagaInput) -> Result<SagaState, SagaError> {
        use SagaInput as I;
        use SagaState as S;

        let to = match (from, input) {
            (None, I::Start) => S::Started,
            (Some(S::Started | S::StepConfirmed), I::StepConfirmed) => S::StepConfirmed,
            (Some(S::StepConfirmed), I::Complete) => S::Completed,
            (Some(S::Started | S::StepConfirmed | S::Compensating), I::Fail) => S::Compensating,
            (Some(S::Compensating), I::CompensationConfirmed) => S::Compensated,
            _ => return Err(SagaError::InvalidTransition { from, input }),
        };
        Ok(to)
    }

    /// Whether no further input is accepted
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaState::Completed | SagaState::Compensated)
    }

    /// State name for logs
    pub fn name(&self) -> &'static str {
        match self {
            SagaState::Started => "started",
            SagaState::StepConfirmed => "step-confirmed",
            SagaState::Completed => "completed",
            SagaState::Compensating => "compensating",
            SagaState::Compensated => "compensated",
        }
    }
}

impl fmt::Display for SagaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Inputs that drive a saga
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SagaInput {
    /// Begin the saga
    Start,
    /// A step succeeded
    StepConfirmed,
    /// The final step succeeded
    Complete,
    /// A step failed
    Fail,
    /// The compensations succeeded
    CompensationConfirmed,
}

/// A command a saga wants executed against an aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaCommand {
    /// Command name understood by the bus
    pub command_type: String,
    /// Target aggregate
    pub aggregate_id: String,
    /// Command arguments
    pub payload: Value,
    /// Metadata the resulting events should carry
    pub metadata: EventMetadata,
    /// Whether this command undoes earlier work
    pub compensating: bool,
}

impl SagaCommand {
    /// Create a forward command
    pub fn new(
        command_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            command_type: command_type.into(),
            aggregate_id: aggregate_id.into(),
            payload,
            metadata: EventMetadata::default(),
            compensating: false,
        }
    }
}

/// Trait for sending commands from sagas
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandBus: Send + Sync {
    /// Execute a command, returning the failure reason if it was not applied
    async fn dispatch(&self, command: SagaCommand) -> Result<(), String>;
}

/// What a saga does in response to one event
#[derive(Debug, Clone, PartialEq)]
pub struct SagaReaction {
    /// State machine input
    pub input: SagaInput,
    /// Commands to dispatch once the new state is stored
    pub commands: Vec<SagaCommand>,
    /// Replacement for the instance's context, if any
    pub context: Option<Value>,
}

impl SagaReaction {
    /// Reaction with no commands
    pub fn new(input: SagaInput) -> Self {
        Self {
            input,
            commands: Vec::new(),
            context: None,
        }
    }

    /// Add a command
    pub fn dispatch(mut self, command: SagaCommand) -> Self {
        self.commands.push(command);
        self
    }

    /// Replace the instance's context
    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }
}

/// The behavior of one kind of saga
pub trait SagaDefinition: Send + Sync {
    /// Saga type name
    fn saga_type(&self) -> &str;

    /// Which saga instance an event belongs to
    fn correlate(&self, event: &DomainEvent) -> Option<CorrelationId> {
        event.correlation_id().cloned()
    }

    /// Decide how to react to an event; `None` ignores it
    fn react(&self, instance: Option<&SagaInstance>, event: &DomainEvent)
        -> Option<SagaReaction>;

    /// Commands undoing the work done so far
    fn compensations(&self, instance: &SagaInstance) -> Vec<SagaCommand>;
}

/// One recorded state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaTransition {
    /// State before
    pub from: Option<SagaState>,
    /// State after
    pub to: SagaState,
    /// Input that caused it
    pub input: SagaInput,
    /// Event that caused it, `None` for internal failures
    pub caused_by: Option<EventId>,
    /// When it happened
    pub at: DateTime<Utc>,
}

/// Instance of a running saga
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaInstance {
    /// Saga type name
    pub saga_type: String,
    /// Correlation id shared by every event and command of this saga
    pub correlation_id: CorrelationId,
    /// Current state
    pub state: SagaState,
    /// Data the definition carries between steps
    pub context: Value,
    /// Transition history
    pub history: Vec<SagaTransition>,
    /// Events already handled
    pub processed_events: BTreeSet<EventId>,
    /// Set when a compensation failed
    pub needs_intervention: bool,
    /// When the saga started
    pub started_at: DateTime<Utc>,
}

impl SagaInstance {
    fn start(saga_type: &str, correlation_id: CorrelationId, at: DateTime<Utc>) -> Self {
        Self {
            saga_type: saga_type.to_string(),
            correlation_id,
            state: SagaState::Started,
            context: Value::Null,
            history: Vec::new(),
            processed_events: BTreeSet::new(),
            needs_intervention: false,
            started_at: at,
        }
    }

    fn record(
        &mut self,
        from: Option<SagaState>,
        to: SagaState,
        input: SagaInput,
        caused_by: Option<EventId>,
        at: DateTime<Utc>,
    ) {
        self.state = to;
        self.history.push(SagaTransition {
            from,
            to,
            input,
            caused_by,
            at,
        });
    }
}

/// Storage for saga instances
#[async_trait]
pub trait SagaRepository: Send + Sync {
    /// Load an instance
    async fn load(
        &self,
        saga_type: &str,
        correlation_id: &CorrelationId,
    ) -> Result<Option<SagaInstance>, SagaError>;

    /// Store an instance, replacing any previous state
    async fn save(&self, instance: &SagaInstance) -> Result<(), SagaError>;
}

/// In-memory saga storage
#[derive(Debug, Default)]
pub struct InMemorySagaRepository {
    instances: RwLock<HashMap<(String, CorrelationId), SagaInstance>>,
}

impl InMemorySagaRepository {
    /// Create an empty repository
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SagaRepository for InMemorySagaRepository {
    async fn load(
        &self,
        saga_type: &str,
        correlation_id: &CorrelationId,
    ) -> Result<Option<SagaInstance>, SagaError> {
        let key = (saga_type.to_string(), correlation_id.clone());
        Ok(self.instances.read().await.get(&key).cloned())
    }

    async fn save(&self, instance: &SagaInstance) -> Result<(), SagaError> {
        let key = (instance.saga_type.clone(), instance.correlation_id.clone());
        self.instances.write().await.insert(key, instance.clone());
        Ok(())
    }
}

/// Drives one saga definition
pub struct SagaCoordinator {
    definition: Arc<dyn SagaDefinition>,
    repository: Arc<dyn SagaRepository>,
    command_bus: Arc<dyn CommandBus>,
    /// Instances are updated one event at a time
    serial: Mutex<()>,
}

impl SagaCoordinator {
    /// Create a coordinator
    pub fn new(
        definition: Arc<dyn SagaDefinition>,
        repository: Arc<dyn SagaRepository>,
        command_bus: Arc<dyn CommandBus>,
    ) -> Self {
        Self {
            definition,
            repository,
            command_bus,
            serial: Mutex::new(()),
        }
    }

    /// Saga type this coordinator drives
    pub fn saga_type(&self) -> &str {
        self.definition.saga_type()
    }

    /// Get a saga instance
    pub async fn get_instance(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<Option<SagaInstance>, SagaError> {
        self.repository.load(self.saga_type(), correlation_id).await
    }

    /// Handle an event, returning the saga's state afterwards if it is correlated
    pub async fn handle_event(&self, event: &DomainEvent) -> Result<Option<SagaState>, SagaError> {
        let _serial = self.serial.lock().await;

        let Some(correlation_id) = self.definition.correlate(event) else {
            return Ok(None);
        };
        let existing = self
            .repository
            .load(self.saga_type(), &correlation_id)
            .await?;

        if let Some(instance) = existing {
            if instance.processed_events.contains(&event.event_id) {
                debug!(
                    saga_type = %self.saga_type(),
                    correlation_id = %correlation_id,
                    event_id = %event.event_id,
                    "Ignoring redelivered event"
                );
                return Ok(Some(instance.state));
            }
            if instance
                .history
                .iter()
                .any(|transition| transition.caused_by == Some(event.event_id))
            {
                return self.resume(instance, event).await;
            }
            return self.advance(Some(instance), correlation_id, event).await;
        }
        self.advance(None, correlation_id, event).await
    }

    async fn advance(
        &self,
        existing: Option<SagaInstance>,
        correlation_id: CorrelationId,
        event: &DomainEvent,
    ) -> Result<Option<SagaState>, SagaError> {
        let Some(reaction) = self.definition.react(existing.as_ref(), event) else {
            return Ok(existing.map(|instance| instance.state));
        };

        let from = existing.as_ref().map(|instance| instance.state);
        let to = SagaState::transition(from, reaction.input)?;
        let mut instance = existing.unwrap_or_else(|| {
            SagaInstance::start(self.saga_type(), correlation_id.clone(), event.created_at)
        });
        instance.record(
            from,
            to,
            reaction.input,
            Some(event.event_id),
            event.created_at,
        );
        if let Some(context) = reaction.context {
            instance.context = context;
        }
        self.repository.save(&instance).await?;

        info!(
            saga_type = %self.saga_type(),
            correlation_id = %correlation_id,
            from = ?from,
            to = %to,
            event_type = %event.event_type,
            "Saga transitioned"
        );

        let mut commands = reaction.commands;
        if to == SagaState::Compensating && from != Some(SagaState::Compensating) {
            commands.extend(self.definition.compensations(&instance));
        }
        self.dispatch(&mut instance, commands, event).await?;
        self.mark_processed(&mut instance, event).await
    }

    /// Finish an event whose transition was stored but whose commands may not
    /// all have been dispatched
    async fn resume(
        &self,
        mut instance: SagaInstance,
        event: &DomainEvent,
    ) -> Result<Option<SagaState>, SagaError> {
        if instance.needs_intervention {
            debug!(
                saga_type = %self.saga_type(),
                correlation_id = %instance.correlation_id,
                event_id = %event.event_id,
                "Saga awaits intervention, not resuming"
            );
            return Ok(Some(instance.state));
        }

        let commands = if instance.state == SagaState::Compensating {
            self.definition.compensations(&instance)
        } else {
            self.definition
                .react(Some(&instance), event)
                .map(|reaction| reaction.commands)
                .unwrap_or_default()
        };
        warn!(
            saga_type = %self.saga_type(),
            correlation_id = %instance.correlation_id,
            state = %instance.state,
            event_type = %event.event_type,
            commands = commands.len(),
            "Resuming interrupted saga step"
        );
        self.dispatch(&mut instance, commands, event).await?;
        self.mark_processed(&mut instance, event).await
    }

    async fn mark_processed(
        &self,
        instance: &mut SagaInstance,
        event: &DomainEvent,
    ) -> Result<Option<SagaState>, SagaError> {
        instance.processed_events.insert(event.event_id);
        self.repository.save(instance).await?;
        Ok(Some(instance.state))
    }

    /// Re-dispatch the compensations of a saga marked for intervention
    pub async fn retry_compensations(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<SagaState, SagaError> {
        let _serial = self.serial.lock().await;
        let mut instance = self
            .repository
            .load(self.saga_type(), correlation_id)
            .await?
            .ok_or_else(|| SagaError::NotFound(correlation_id.to_string()))?;
        if !instance.needs_intervention {
            return Ok(instance.state);
        }

        instance.needs_intervention = false;
        self.repository.save(&instance).await?;
        info!(
            saga_type = %self.saga_type(),
            correlation_id = %correlation_id,
            "Retrying compensations"
        );

        let commands = self.definition.compensations(&instance);
        for command in commands {
            self.send_compensation(&mut instance, command, None).await?;
        }

        // The events that led here are settled now.
        let causes: Vec<EventId> = instance
            .history
            .iter()
            .filter_map(|transition| transition.caused_by)
            .collect();
        instance.processed_events.extend(causes);
        self.repository.save(&instance).await?;
        Ok(instance.state)
    }

    async fn dispatch(
        &self,
        instance: &mut SagaInstance,
        commands: Vec<SagaCommand>,
        cause: &DomainEvent,
    ) -> Result<(), SagaError> {
        let mut queue = commands.into_iter();
        while let Some(command) = queue.next() {
            if instance.state == SagaState::Compensating || command.compensating {
                self.send_compensation(instance, command, Some(cause.event_id))
                    .await?;
                continue;
            }

            let command = self.stamp(instance, command, Some(cause.event_id));
            if let Err(reason) = self.command_bus.dispatch(command.clone()).await {
                warn!(
                    saga_type = %self.saga_type(),
                    correlation_id = %instance.correlation_id,
                    command_type = %command.command_type,
                    reason = %reason,
                    "Saga step failed, compensating"
                );
                let from = instance.state;
                let to = SagaState::transition(Some(from), SagaInput::Fail)?;
                instance.record(Some(from), to, SagaInput::Fail, None, cause.created_at);
                self.repository.save(instance).await?;

                // Remaining forward commands are dropped in favour of compensation.
                queue = self.definition.compensations(instance).into_iter();
            }
        }
        Ok(())
    }

    async fn send_compensation(
        &self,
        instance: &mut SagaInstance,
        command: SagaCommand,
        cause: Option<EventId>,
    ) -> Result<(), SagaError> {
        let command = SagaCommand {
            compensating: true,
            ..self.stamp(instance, command, cause)
        };
        let command_type = command.command_type.clone();
        match self.command_bus.dispatch(command).await {
            Ok(()) => {
                debug!(
                    saga_type = %self.saga_type(),
                    correlation_id = %instance.correlation_id,
                    command_type = %command_type,
                    "Dispatched compensation"
                );
                Ok(())
            }
            Err(reason) => {
                instance.needs_intervention = true;
                self.repository.save(instance).await?;
                error!(
                    saga_type = %self.saga_type(),
                    correlation_id = %instance.correlation_id,
                    command_type = %command_type,
                    reason = %reason,
                    "Compensation failed, saga needs intervention"
                );
                Err(SagaError::CompensationFailed {
                    correlation_id: instance.correlation_id.clone(),
                    command_type,
                    reason,
                })
            }
        }
    }

    fn stamp(
        &self,
        instance: &SagaInstance,
        command: SagaCommand,
        cause: Option<EventId>,
    ) -> SagaCommand {
        let mut metadata = command.metadata;
        if metadata.correlation_id.is_none() {
            metadata.correlation_id = Some(instance.correlation_id.clone());
        }
        if metadata.causation_id.is_none() {
            metadata.causation_id = cause.map(Into::into);
        }
        if metadata.actor.is_none() {
            metadata.actor = Some(format!("saga:{}", self.saga_type()));
        }
        SagaCommand { metadata, ..command }
    }
}

/// Feeds a [`SagaCoordinator`] from the event log
pub struct SagaRunner {
    coordinator: Arc<SagaCoordinator>,
    position: AtomicU64,
}

impl SagaRunner {
    /// Wrap a coordinator; it replays the log from the start and skips events it has seen
    pub fn new(coordinator: Arc<SagaCoordinator>) -> Self {
        Self {
            coordinator,
            position: AtomicU64::new(0),
        }
    }

    /// Start delivering events from `store` in a background task
    pub fn spawn(
        coordinator: Arc<SagaCoordinator>,
        store: Arc<dyn EventStore>,
        config: SubscriptionConfig,
    ) -> SubscriptionHandle {
        spawn_subscription(store, Arc::new(Self::new(coordinator)), config)
    }
}

#[async_trait]
impl EventSubscriber for SagaRunner {
    fn name(&self) -> &str {
        self.coordinator.saga_type()
    }

    async fn position(&self) -> u64 {
        self.position.load(Ordering::SeqCst)
    }

    async fn on_event(&self, event: &DomainEvent) -> Result<(), SubscriptionError> {
        match self.coordinator.handle_event(event).await {
            Ok(_) => {}
            // Events that do not fit the saga's state and compensations awaiting
            // an operator are not redelivered.
            Err(e @ SagaError::InvalidTransition { .. }) => warn!(
                saga_type = %self.coordinator.saga_type(),
                event_type = %event.event_type,
                error = %e,
                "Ignoring event"
            ),
            Err(SagaError::CompensationFailed { .. }) => {}
            Err(e) => {
                return Err(SubscriptionError::Handler {
                    subscriber: self.coordinator.saga_type().to_string(),
                    position: event.position,
                    reason: e.to_string(),
                })
            }
        }
        self.position.fetch_max(event.position, Ordering::SeqCst);
        Ok(())
    }
}
