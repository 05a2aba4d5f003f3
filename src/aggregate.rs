// Copyright 2025 Cowboy AI, LLC.

//! Event-sourced aggregates
//!
//! An aggregate is the unit of consistency: its state is derived entirely from
//! its own event stream. Command handling is split into a pure decision
//! ([`Aggregate::handle`]) and a pure state change ([`Aggregate::apply`]).
//!
//! [`AggregateState`] is the value a command handler threads through
//! `load -> mutate -> save`: the folded state, the version it reflects, and the
//! events raised during the current command that have not been persisted yet.
//!
//! ```rust
//! use cim_ledger::{Aggregate, AggregateState, DomainResult};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Default, Serialize, Deserialize)]
//! struct Counter { value: i64 }
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! #[serde(tag = "type", content = "data")]
//! enum CounterEvent { Incremented { by: i64 } }
//!
//! impl Aggregate for Counter {
//!     const AGGREGATE_TYPE: &'static str = "Counter";
//!     type Event = CounterEvent;
//!     type Command = i64;
//!
//!     fn handle(&self, by: i64) -> DomainResult<Vec<CounterEvent>> {
//!         Ok(vec![CounterEvent::Incremented { by }])
//!     }
//!
//!     fn apply(&mut self, event: &CounterEvent) {
//!         match event {
//!             CounterEvent::Incremented { by } => self.value += by,
//!         }
//!     }
//! }
//!
//! let mut counter = AggregateState::<Counter>::new("c-1");
//! counter.execute(5).unwrap();
//! assert_eq!(counter.state().value, 5);
//! assert_eq!(counter.version(), 1);
//! assert_eq!(counter.persisted_version(), 0);
//! ```

use crate::errors::DomainResult;
use crate::events::EventMetadata;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use thiserror::Error;

/// A domain aggregate whose state is folded from its events
pub trait Aggregate:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Aggregate type name stored on every event
    const AGGREGATE_TYPE: &'static str;

    /// Events this aggregate raises and folds; adjacently tagged serde enum
    type Event: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static;

    /// Commands this aggregate decides on
    type Command: Send + 'static;

    /// Validate a command against the current state and produce events.
    ///
    /// Must not perform I/O. `Ok(vec![])` is a no-op.
    fn handle(&self, command: Self::Command) -> DomainResult<Vec<Self::Event>>;

    /// Apply a single event. Must be deterministic.
    fn apply(&mut self, event: &Self::Event);
}

/// A committed event arrived out of sequence while folding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("version gap: expected version {expected}, found {found}")]
pub struct VersionGap {
    /// The version that should have come next
    pub expected: u64,
    /// The version that was supplied
    pub found: u64,
}

/// An event raised during the current command
#[derive(Debug, Clone)]
pub struct Uncommitted<E> {
    /// The typed event
    pub event: E,
    /// Metadata to persist with it
    pub metadata: EventMetadata,
}

/// Aggregate state plus its version and pending events
#[derive(Debug, Clone)]
pub struct AggregateState<A: Aggregate> {
    id: String,
    state: A,
    version: u64,
    uncommitted: Vec<Uncommitted<A::Event>>,
}

impl<A: Aggregate> AggregateState<A> {
    /// Empty aggregate at version 0
    pub fn new(id: impl Into<String>) -> Self {
        Self::from_snapshot(id, A::default(), 0)
    }

    /// Aggregate restored from a snapshot taken at `version`
    pub fn from_snapshot(id: impl Into<String>, state: A, version: u64) -> Self {
        Self {
            id: id.into(),
            state,
            version,
            uncommitted: Vec::new(),
        }
    }

    /// Fold a sequence of committed events onto an empty aggregate
    pub fn rehydrate<'a, I>(id: impl Into<String>, events: I) -> Result<Self, VersionGap>
    where
        I: IntoIterator<Item = (u64, &'a A::Event)>,
    {
        let mut aggregate = Self::new(id);
        for (version, event) in events {
            aggregate.fold(version, event)?;
        }
        Ok(aggregate)
    }

    /// Aggregate id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current folded state
    pub fn state(&self) -> &A {
        &self.state
    }

    /// Version including uncommitted events
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Version the store holds before the uncommitted events are appended
    pub fn persisted_version(&self) -> u64 {
        self.version - self.uncommitted.len() as u64
    }

    /// Whether the aggregate has no events at all
    pub fn is_new(&self) -> bool {
        self.version == 0
    }

    /// Events raised but not yet saved
    pub fn uncommitted(&self) -> &[Uncommitted<A::Event>] {
        &self.uncommitted
    }

    /// Apply a committed event read back from the store
    pub fn fold(&mut self, version: u64, event: &A::Event) -> Result<(), VersionGap> {
        let expected = self.version + 1;
        if version != expected {
            return Err(VersionGap {
                expected,
                found: version,
            });
        }
        self.state.apply(event);
        self.version = version;
        Ok(())
    }

    /// Apply a new event and buffer it for the next save
    pub fn raise(&mut self, event: A::Event) {
        self.raise_with_metadata(event, EventMetadata::default());
    }

    /// Apply a new event carrying explicit metadata and buffer it
    pub fn raise_with_metadata(&mut self, event: A::Event, metadata: EventMetadata) {
        self.state.apply(&event);
        self.version += 1;
        self.uncommitted.push(Uncommitted { event, metadata });
    }

    /// Run a command through [`Aggregate::handle`] and raise the resulting events
    pub fn execute(&mut self, command: A::Command) -> DomainResult<usize> {
        self.execute_with_metadata(command, EventMetadata::default())
    }

    /// Like [`execute`](Self::execute), stamping every raised event with `metadata`
    pub fn execute_with_metadata(
        &mut self,
        command: A::Command,
        metadata: EventMetadata,
    ) -> DomainResult<usize> {
        let events = self.state.handle(command)?;
        let raised = events.len();
        for event in events {
            self.raise_with_metadata(event, metadata.clone());
        }
        Ok(raised)
    }

    /// Drain the pending events once they are persisted
    pub fn take_uncommitted(&mut self) -> Vec<Uncommitted<A::Event>> {
        std::mem::take(&mut self.uncommitted)
    }

    /// Consume into the folded state
    pub fn into_state(self) -> A {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::DomainError;
    use serde::Deserialize;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Tally {
        total: u32,
        closed: bool,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data")]
    enum TallyEvent {
        Added { n: u32 },
        Closed,
    }

    enum TallyCommand {
        Add(u32),
        Close,
    }

    impl Aggregate for Tally {
        const AGGREGATE_TYPE: &'static str = "Tally";
        type Event = TallyEvent;
        type Command = TallyCommand;

        fn handle(&self, command: TallyCommand) -> DomainResult<Vec<TallyEvent>> {
            if self.closed {
                return Err(DomainError::invalid_operation("tally is closed"));
            }
            Ok(match command {
                TallyCommand::Add(0) => vec![],
                TallyCommand::Add(n) => vec![TallyEvent::Added { n }],
                TallyCommand::Close => vec![TallyEvent::Closed],
            })
        }

        fn apply(&mut self, event: &TallyEvent) {
            match event {
                TallyEvent::Added { n } => self.total += n,
                TallyEvent::Closed => self.closed = true,
            }
        }
    }

    #[test]
    fn test_raise_buffers_and_applies() {
        let mut tally = AggregateState::<Tally>::new("t-1");
        assert!(tally.is_new());

        tally.execute(TallyCommand::Add(3)).unwrap();
        tally.execute(TallyCommand::Add(4)).unwrap();

        assert_eq!(tally.state().total, 7);
        assert_eq!(tally.version(), 2);
        assert_eq!(tally.persisted_version(), 0);
        assert_eq!(tally.uncommitted().len(), 2);

        let drained = tally.take_uncommitted();
        assert_eq!(drained.len(), 2);
        assert_eq!(tally.persisted_version(), 2);
    }

    #[test]
    fn test_noop_command_raises_nothing() {
        let mut tally = AggregateState::<Tally>::new("t-1");
        assert_eq!(tally.execute(TallyCommand::Add(0)).unwrap(), 0);
        assert_eq!(tally.version(), 0);
    }

    #[test]
    fn test_rejected_command_leaves_state_untouched() {
        let mut tally = AggregateState::<Tally>::new("t-1");
        tally.execute(TallyCommand::Close).unwrap();
        let err = tally.execute(TallyCommand::Add(1)).unwrap_err();
        assert!(matches!(err, DomainError::InvalidOperation { .. }));
        assert_eq!(tally.version(), 1);
    }

    #[test]
    fn test_rehydrate_folds_in_order() {
        let events = [TallyEvent::Added { n: 2 }, TallyEvent::Added { n: 5 }];
        let tally = AggregateState::<Tally>::rehydrate(
            "t-1",
            events.iter().enumerate().map(|(i, e)| (i as u64 + 1, e)),
        )
        .unwrap();
        assert_eq!(tally.state().total, 7);
        assert_eq!(tally.version(), 2);
        assert!(tally.uncommitted().is_empty());
    }

    #[test]
    fn test_fold_rejects_gaps() {
        let mut tally = AggregateState::<Tally>::new("t-1");
        let err = tally.fold(2, &TallyEvent::Added { n: 1 }).unwrap_err();
        assert_eq!(
            err,
            VersionGap {
                expected: 1,
                found: 2
            }
        );
    }

    #[test]
    fn test_from_snapshot_continues_versioning() {
        let mut tally = AggregateState::from_snapshot(
            "t-1",
            Tally {
                total: 10,
                closed: false,
            },
            50,
        );
        tally.fold(51, &TallyEvent::Added { n: 1 }).unwrap();
        assert_eq!(tally.version(), 51);
        assert_eq!(tally.state().total, 11);
    }
}
