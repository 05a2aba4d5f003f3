// Copyright 2025 Cowboy AI, LLC.

//! Checkout saga walkthrough
//!
//! Orders are charged and shipped by a saga that follows the event log. A
//! declined card cancels the order; when the cancellation itself fails the
//! saga waits for an operator, who retries the compensation.

use anyhow::{bail, Context};
use async_trait::async_trait;
use cim_ledger::{
    Aggregate, CommandBus, CommandHandler, CorrelationId, DomainError, DomainEvent, DomainResult,
    EventMetadata, EventSourcedRepository, EventStore, InMemoryEventStore,
    InMemorySagaRepository, InMemorySnapshotStore, SagaCommand, SagaCoordinator, SagaDefinition,
    SagaInput, SagaInstance, SagaReaction, SagaRunner, SagaState, SubscriptionConfig,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const CARD_LIMIT: i64 = 500;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Order {
    placed: bool,
    closed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
enum OrderEvent {
    OrderPlaced { total: i64 },
    OrderShipped,
    OrderCancelled { reason: String },
}

#[derive(Debug, Clone)]
enum OrderCommand {
    Place { total: i64 },
    Ship,
    Cancel { reason: String },
}

impl Aggregate for Order {
    const AGGREGATE_TYPE: &'static str = "Order";
    type Event = OrderEvent;
    type Command = OrderCommand;

    fn handle(&self, command: OrderCommand) -> DomainResult<Vec<OrderEvent>> {
        match command {
            OrderCommand::Place { total } if !self.placed => {
                Ok(vec![OrderEvent::OrderPlaced { total }])
            }
            _ if !self.placed || self.closed => {
                Err(DomainError::invalid_operation("order is not open"))
            }
            OrderCommand::Place { .. } => Err(DomainError::AlreadyExists("order".into())),
            OrderCommand::Ship => Ok(vec![OrderEvent::OrderShipped]),
            OrderCommand::Cancel { reason } => Ok(vec![OrderEvent::OrderCancelled { reason }]),
        }
    }

    fn apply(&mut self, event: &OrderEvent) {
        match event {
            OrderEvent::OrderPlaced { .. } => self.placed = true,
            OrderEvent::OrderShipped | OrderEvent::OrderCancelled { .. } => self.closed = true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Payment {
    settled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
enum PaymentEvent {
    PaymentConfirmed { order_id: String },
    PaymentFailed { order_id: String },
}

#[derive(Debug, Clone)]
struct Charge {
    order_id: String,
    amount: i64,
}

impl Aggregate for Payment {
    const AGGREGATE_TYPE: &'static str = "Payment";
    type Event = PaymentEvent;
    type Command = Charge;

    fn handle(&self, charge: Charge) -> DomainResult<Vec<PaymentEvent>> {
        if self.settled {
            return Ok(vec![]);
        }
        let order_id = charge.order_id;
        Ok(vec![if charge.amount > CARD_LIMIT {
            PaymentEvent::PaymentFailed { order_id }
        } else {
            PaymentEvent::PaymentConfirmed { order_id }
        }])
    }

    fn apply(&mut self, _event: &PaymentEvent) {
        self.settled = true;
    }
}

struct Checkout;

impl SagaDefinition for Checkout {
    fn saga_type(&self) -> &str {
        "checkout"
    }

    fn react(&self, _instance: Option<&SagaInstance>, event: &DomainEvent) -> Option<SagaReaction> {
        let order_id = event.payload["order_id"].as_str().unwrap_or(&event.aggregate_id);
        let reaction = match event.event_type.as_str() {
            "OrderPlaced" => SagaReaction::new(SagaInput::Start)
                .dispatch(SagaCommand::new(
                    "Charge",
                    format!("pay-{order_id}"),
                    json!({ "order_id": order_id, "amount": event.payload["total"] }),
                ))
                .with_context(json!({ "order_id": order_id })),
            "PaymentConfirmed" => SagaReaction::new(SagaInput::StepConfirmed)
                .dispatch(SagaCommand::new("Ship", order_id, json!({}))),
            "OrderShipped" => SagaReaction::new(SagaInput::Complete),
            "PaymentFailed" => SagaReaction::new(SagaInput::Fail),
            "OrderCancelled" => SagaReaction::new(SagaInput::CompensationConfirmed),
            _ => return None,
        };
        Some(reaction)
    }

    fn compensations(&self, instance: &SagaInstance) -> Vec<SagaCommand> {
        let order_id = instance.context["order_id"].as_str().unwrap_or_default();
        vec![SagaCommand::new(
            "Cancel",
            order_id,
            json!({ "reason": "card declined" }),
        )]
    }
}

struct Bus {
    orders: CommandHandler<Order>,
    payments: CommandHandler<Payment>,
    warehouse_online: AtomicBool,
}

#[async_trait]
impl CommandBus for Bus {
    async fn dispatch(&self, command: SagaCommand) -> Result<(), String> {
        let id = command.aggregate_id.as_str();
        let metadata = command.metadata.clone();
        let result = match command.command_type.as_str() {
            "Charge" => {
                let charge = Charge {
                    order_id: command.payload["order_id"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                    amount: command.payload["amount"].as_i64().unwrap_or_default(),
                };
                self.payments.execute(id, charge, metadata).await
            }
            "Ship" => self.orders.execute(id, OrderCommand::Ship, metadata).await,
            "Cancel" => {
                if !self.warehouse_online.load(Ordering::SeqCst) {
                    return Err("warehouse unreachable".into());
                }
                let reason = command.payload["reason"].as_str().unwrap_or_default().into();
                self.orders
                    .execute(id, OrderCommand::Cancel { reason }, metadata)
                    .await
            }
            other => return Err(format!("unknown command {other}")),
        };
        result.map(|_| ()).map_err(|e| e.to_string())
    }
}

async fn settle(
    coordinator: &SagaCoordinator,
    correlation: &CorrelationId,
    done: impl Fn(&SagaInstance) -> bool,
) -> anyhow::Result<SagaInstance> {
    for _ in 0..200 {
        if let Some(instance) = coordinator.get_instance(correlation).await? {
            if done(&instance) {
                return Ok(instance);
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("saga {correlation} did not settle")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let store = Arc::new(InMemoryEventStore::new());
    let snapshots = Arc::new(InMemorySnapshotStore::new());
    let orders = CommandHandler::new(EventSourcedRepository::<Order>::new(
        store.clone(),
        snapshots.clone(),
    ));
    let bus = Arc::new(Bus {
        orders: orders.clone(),
        payments: CommandHandler::new(EventSourcedRepository::<Payment>::new(
            store.clone(),
            snapshots,
        )),
        warehouse_online: AtomicBool::new(true),
    });
    let coordinator = Arc::new(SagaCoordinator::new(
        Arc::new(Checkout),
        Arc::new(InMemorySagaRepository::new()),
        bus.clone(),
    ));
    let runner = SagaRunner::spawn(
        coordinator.clone(),
        store.clone(),
        SubscriptionConfig::default(),
    );

    let place = |order_id: &'static str, total: i64| {
        let orders = orders.clone();
        async move {
            orders
                .execute(
                    order_id,
                    OrderCommand::Place { total },
                    EventMetadata::now()
                        .with_actor("storefront")
                        .with_correlation(CorrelationId::new(order_id)),
                )
                .await
                .with_context(|| format!("placing {order_id}"))
        }
    };

    place("order-1", 120).await?;
    let shipped = settle(&coordinator, &CorrelationId::new("order-1"), |i| {
        i.state == SagaState::Completed
    })
    .await?;
    info!(state = %shipped.state, steps = shipped.history.len(), "Order shipped");

    bus.warehouse_online.store(false, Ordering::SeqCst);
    place("order-2", 900).await?;
    let correlation = CorrelationId::new("order-2");
    let stuck = settle(&coordinator, &correlation, |i| i.needs_intervention).await?;
    info!(state = %stuck.state, "Cancellation failed, operator needed");

    bus.warehouse_online.store(true, Ordering::SeqCst);
    coordinator.retry_compensations(&correlation).await?;
    let compensated = settle(&coordinator, &correlation, |i| {
        i.state == SagaState::Compensated
    })
    .await?;
    info!(state = %compensated.state, "Order cancelled");

    for event in store.get_all_events(0).await? {
        info!(
            position = event.position,
            aggregate_id = %event.aggregate_id,
            event_type = %event.event_type,
            correlation_id = ?event.correlation_id().map(|c| c.to_string()),
            "Logged"
        );
    }

    runner.stop().await;
    Ok(())
}
