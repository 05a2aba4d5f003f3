// Copyright 2025 Cowboy AI, LLC.

//! # Persistence Layer
//!
//! Loading and saving event-sourced aggregates on top of the event store and
//! snapshot store.

pub mod aggregate_repository;

pub use aggregate_repository::{EventSourcedRepository, RepositoryError};
