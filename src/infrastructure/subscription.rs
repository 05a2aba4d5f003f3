// Copyright 2025 Cowboy AI, LLC.

//! Fan-out of appended events to asynchronous consumers
//!
//! Projections and process managers consume the log through a subscription:
//! a background task that first catches up from the consumer's checkpoint by
//! reading the store, then follows the store's live broadcast. When the live
//! feed drops events (slow consumer) or shows a position gap, the task falls
//! back to reading the store again. Delivery is at-least-once and in global
//! append order, so consumers must tolerate duplicates.

use crate::events::DomainEvent;
use crate::infrastructure::event_store::{EventStore, EventStoreError};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, warn};

/// Errors raised while delivering events to a subscriber
#[derive(Debug, Error)]
pub enum SubscriptionError {
    /// Reading the log failed
    #[error("Event store error: {0}")]
    Store(#[from] EventStoreError),

    /// The subscriber could not handle an event
    #[error("Subscriber {subscriber} failed at position {position}: {reason}")]
    Handler {
        /// Subscriber name
        subscriber: String,
        /// Position of the failing event
        position: u64,
        /// Failure description
        reason: String,
    },
}

/// Subscription tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    /// Delay before redelivering an event whose handler failed
    pub retry_delay_ms: u64,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self { retry_delay_ms: 250 }
    }
}

impl SubscriptionConfig {
    /// Redelivery delay as a duration
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// A consumer of the global event log
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Global position of the last event this subscriber fully handled
    async fn position(&self) -> u64;

    /// Handle one event. Returning an error causes redelivery of the same event.
    async fn on_event(&self, event: &DomainEvent) -> Result<(), SubscriptionError>;
}

/// Handle to a running subscription task
pub struct SubscriptionHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    /// Stop the subscription and wait for the task to exit
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "Subscription task panicked");
        }
    }

    /// Whether the task has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Spawn a task delivering the log to `subscriber`
pub fn spawn_subscription(
    store: Arc<dyn EventStore>,
    subscriber: Arc<dyn EventSubscriber>,
    config: SubscriptionConfig,
) -> SubscriptionHandle {
    let (shutdown, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(run_subscription(store, subscriber, config, shutdown_rx));
    SubscriptionHandle { shutdown, task }
}

/// Newly appended events as a stream.
///
/// Best effort: events a slow reader misses are skipped with a warning. Use
/// [`spawn_subscription`] when every event must be seen.
pub fn live_events(store: &dyn EventStore) -> impl Stream<Item = DomainEvent> + Send + 'static {
    BroadcastStream::new(store.subscribe()).filter_map(|received| async move {
        match received {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                warn!(missed, "Live event stream lagged");
                None
            }
        }
    })
}

struct Delivery {
    store: Arc<dyn EventStore>,
    subscriber: Arc<dyn EventSubscriber>,
    config: SubscriptionConfig,
    shutdown: watch::Receiver<bool>,
    position: u64,
}

enum Flow {
    Continue,
    Stop,
}

async fn run_subscription(
    store: Arc<dyn EventStore>,
    subscriber: Arc<dyn EventSubscriber>,
    config: SubscriptionConfig,
    shutdown: watch::Receiver<bool>,
) {
    // Subscribe before catching up so nothing appended in between is missed.
    let mut live = store.subscribe();
    let position = subscriber.position().await;
    let mut delivery = Delivery {
        store,
        subscriber,
        config,
        shutdown,
        position,
    };

    info!(
        subscriber = %delivery.subscriber.name(),
        position,
        "Starting subscription"
    );

    if let Flow::Stop = delivery.catch_up().await {
        return;
    }

    loop {
        let received = tokio::select! {
            _ = delivery.shutdown.changed() => break,
            received = live.recv() => received,
        };

        let flow = match received {
            Ok(event) if event.position <= delivery.position => Flow::Continue,
            Ok(event) if event.position == delivery.position + 1 => delivery.deliver(&event).await,
            Ok(event) => {
                debug!(
                    subscriber = %delivery.subscriber.name(),
                    expected = delivery.position + 1,
                    received = event.position,
                    "Live feed skipped ahead, reading from store"
                );
                delivery.catch_up().await
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(
                    subscriber = %delivery.subscriber.name(),
                    missed,
                    "Subscriber lagged behind live feed, reading from store"
                );
                delivery.catch_up().await
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        if let Flow::Stop = flow {
            break;
        }
    }

    info!(
        subscriber = %delivery.subscriber.name(),
        position = delivery.position,
        "Subscription stopped"
    );
}

impl Delivery {
    async fn catch_up(&mut self) -> Flow {
        loop {
            let events = match self.store.get_all_events(self.position).await {
                Ok(events) => events,
                Err(e) => {
                    error!(
                        subscriber = %self.subscriber.name(),
                        error = %e,
                        "Failed to read log during catch-up"
                    );
                    if let Flow::Stop = self.pause().await {
                        return Flow::Stop;
                    }
                    continue;
                }
            };
            for event in &events {
                if let Flow::Stop = self.deliver(event).await {
                    return Flow::Stop;
                }
            }
            return Flow::Continue;
        }
    }

    /// Deliver one event, retrying until it is handled or shutdown is requested
    async fn deliver(&mut self, event: &DomainEvent) -> Flow {
        loop {
            match self.subscriber.on_event(event).await {
                Ok(()) => {
                    self.position = event.position;
                    return Flow::Continue;
                }
                Err(e) => {
                    error!(
                        subscriber = %self.subscriber.name(),
                        position = event.position,
                        event_type = %event.event_type,
                        error = %e,
                        "Subscriber failed, will redeliver"
                    );
                    if let Flow::Stop = self.pause().await {
                        return Flow::Stop;
                    }
                }
            }
        }
    }

    async fn pause(&mut self) -> Flow {
        tokio::select! {
            _ = self.shutdown.changed() => Flow::Stop,
            _ = tokio::time::sleep(self.config.retry_delay()) => Flow::Continue,
        }
    }
}
