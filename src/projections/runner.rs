// Copyright 2025 Cowboy AI, LLC.

//! Keeps a projection engine fed from the event store

use super::{Projection, ProjectionEngine};
use crate::events::DomainEvent;
use crate::infrastructure::{
    spawn_subscription, EventStore, EventSubscriber, SubscriptionConfig, SubscriptionError,
    SubscriptionHandle,
};
use async_trait::async_trait;
use std::sync::Arc;

/// Subscribes a [`ProjectionEngine`] to the log
pub struct ProjectionRunner<P: Projection> {
    engine: Arc<ProjectionEngine<P>>,
}

impl<P: Projection> ProjectionRunner<P> {
    /// Wrap an engine
    pub fn new(engine: Arc<ProjectionEngine<P>>) -> Self {
        Self { engine }
    }

    /// Start delivering events from `store` in a background task
    pub fn spawn(
        engine: Arc<ProjectionEngine<P>>,
        store: Arc<dyn EventStore>,
        config: SubscriptionConfig,
    ) -> SubscriptionHandle {
        spawn_subscription(store, Arc::new(Self::new(engine)), config)
    }
}

#[async_trait]
impl<P: Projection> EventSubscriber for ProjectionRunner<P> {
    fn name(&self) -> &str {
        P::NAME
    }

    async fn position(&self) -> u64 {
        self.engine.position().await
    }

    async fn on_event(&self, event: &DomainEvent) -> Result<(), SubscriptionError> {
        self.engine
            .handle(event)
            .await
            .map(|_| ())
            .map_err(|e| SubscriptionError::Handler {
                subscriber: P::NAME.to_string(),
                position: event.position,
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NewEvent;
    use crate::infrastructure::InMemoryEventStore;
    use crate::projections::ProjectionError;
    use serde_json::json;
    use std::time::Duration;

    struct EventCount;

    impl Projection for EventCount {
        const NAME: &'static str = "event-count";
        type Row = u64;

        fn apply(
            &self,
            current: Option<&u64>,
            _event: &DomainEvent,
        ) -> Result<Option<u64>, ProjectionError> {
            Ok(Some(current.copied().unwrap_or(0) + 1))
        }
    }

    #[tokio::test]
    async fn test_runner_follows_the_log() {
        let store = Arc::new(InMemoryEventStore::new());
        store
            .append("a-1", "Thing", vec![NewEvent::new("Touched", json!({}))], 0)
            .await
            .unwrap();

        let engine = Arc::new(ProjectionEngine::new(EventCount, store.clone()));
        let handle = ProjectionRunner::spawn(
            engine.clone(),
            store.clone(),
            SubscriptionConfig::default(),
        );

        store
            .append("a-1", "Thing", vec![NewEvent::new("Touched", json!({}))], 1)
            .await
            .unwrap();

        let mut projected = 0;
        for _ in 0..200 {
            projected = engine.projected_version("a-1").await;
            if projected == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(projected, 2);
        assert_eq!(engine.get("a-1").await.unwrap().row, 2);
        handle.stop().await;
    }
}
