// Copyright 2025 Cowboy AI, LLC.

//! Shared test domain: bank accounts, orders, payments and a checkout saga

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cim_ledger::{
    Aggregate, CommandBus, CommandHandler, DomainError, DomainEvent, DomainResult,
    EventSourcedRepository, InMemoryEventStore, InMemorySnapshotStore, Projection,
    ProjectionError, SagaCommand, SagaDefinition, SagaInput, SagaInstance,
    SagaReaction, SnapshotPolicy,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Bank account

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub owner: String,
    pub balance: i64,
    pub open: bool,
    pub transactions: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum AccountEvent {
    AccountOpened { owner: String },
    MoneyDeposited { amount: i64 },
    MoneyWithdrawn { amount: i64 },
    AccountClosed,
}

#[derive(Debug, Clone)]
pub enum AccountCommand {
    Open { owner: String },
    Deposit { amount: i64 },
    Withdraw { amount: i64 },
    Close,
}

impl Aggregate for Account {
    const AGGREGATE_TYPE: &'static str = "Account";
    type Event = AccountEvent;
    type Command = AccountCommand;

    fn handle(&self, command: AccountCommand) -> DomainResult<Vec<AccountEvent>> {
        match command {
            AccountCommand::Open { owner } => {
                if self.open {
                    return Err(DomainError::AlreadyExists(owner));
                }
                Ok(vec![AccountEvent::AccountOpened { owner }])
            }
            AccountCommand::Deposit { amount } => {
                self.ensure_open()?;
                if amount <= 0 {
                    return Err(DomainError::ValidationError("deposit must be positive".into()));
                }
                Ok(vec![AccountEvent::MoneyDeposited { amount }])
            }
            AccountCommand::Withdraw { amount } => {
                self.ensure_open()?;
                if amount > self.balance {
                    return Err(DomainError::BusinessRuleViolation {
                        rule: "insufficient funds".into(),
                    });
                }
                Ok(vec![AccountEvent::MoneyWithdrawn { amount }])
            }
            AccountCommand::Close => {
                self.ensure_open()?;
                Ok(vec![AccountEvent::AccountClosed])
            }
        }
    }

    fn apply(&mut self, event: &AccountEvent) {
        match event {
            AccountEvent::AccountOpened { owner } => {
                self.owner = owner.clone();
                self.open = true;
            }
            AccountEvent::MoneyDeposited { amount } => {
                self.balance += amount;
                self.transactions += 1;
            }
            AccountEvent::MoneyWithdrawn { amount } => {
                self.balance -= amount;
                self.transactions += 1;
            }
            AccountEvent::AccountClosed => self.open = false,
        }
    }
}

impl Account {
    fn ensure_open(&self) -> DomainResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(DomainError::invalid_operation("account is not open"))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceRow {
    pub owner: String,
    pub balance: i64,
    pub closed: bool,
    pub updated_at: DateTime<Utc>,
}

/// Account balances keyed by account id
pub struct Balances;

impl Projection for Balances {
    const NAME: &'static str = "balances";
    type Row = BalanceRow;

    fn accepts(&self, event: &DomainEvent) -> bool {
        event.aggregate_type == Account::AGGREGATE_TYPE
    }

    fn apply(
        &self,
        current: Option<&BalanceRow>,
        event: &DomainEvent,
    ) -> Result<Option<BalanceRow>, ProjectionError> {
        let decoded: AccountEvent = event.decode()?;
        let row = match (decoded, current) {
            (AccountEvent::AccountOpened { owner }, _) => BalanceRow {
                owner,
                balance: 0,
                closed: false,
                updated_at: event.created_at,
            },
            (AccountEvent::MoneyDeposited { amount }, Some(row)) => BalanceRow {
                balance: row.balance + amount,
                updated_at: event.created_at,
                ..row.clone()
            },
            (AccountEvent::MoneyWithdrawn { amount }, Some(row)) => BalanceRow {
                balance: row.balance - amount,
                updated_at: event.created_at,
                ..row.clone()
            },
            (AccountEvent::AccountClosed, Some(row)) => BalanceRow {
                closed: true,
                updated_at: event.created_at,
                ..row.clone()
            },
            (_, None) => {
                return Err(ProjectionError::apply(format!(
                    "{} before AccountOpened",
                    event.event_type
                )))
            }
        };
        Ok(Some(row))
    }
}

pub struct Bank {
    pub store: Arc<InMemoryEventStore>,
    pub snapshots: Arc<InMemorySnapshotStore>,
    pub repository: EventSourcedRepository<Account>,
}

pub fn bank(policy: SnapshotPolicy) -> Bank {
    let store = Arc::new(InMemoryEventStore::new());
    let snapshots = Arc::new(InMemorySnapshotStore::new());
    let repository = EventSourcedRepository::new(store.clone(), snapshots.clone())
        .with_snapshot_policy(policy);
    Bank {
        store,
        snapshots,
        repository,
    }
}

// ---------------------------------------------------------------------------
// Orders and payments

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    #[default]
    New,
    Placed,
    Shipped,
    Cancelled,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub status: OrderStatus,
    pub total: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum OrderEvent {
    OrderPlaced { total: i64 },
    OrderShipped,
    OrderCancelled { reason: String },
}

#[derive(Debug, Clone)]
pub enum OrderCommand {
    Place { total: i64 },
    Ship,
    Cancel { reason: String },
}

impl Aggregate for Order {
    const AGGREGATE_TYPE: &'static str = "Order";
    type Event = OrderEvent;
    type Command = OrderCommand;

    fn handle(&self, command: OrderCommand) -> DomainResult<Vec<OrderEvent>> {
        match (self.status, command) {
            (OrderStatus::New, OrderCommand::Place { total }) => {
                Ok(vec![OrderEvent::OrderPlaced { total }])
            }
            (OrderStatus::Placed, OrderCommand::Ship) => Ok(vec![OrderEvent::OrderShipped]),
            (OrderStatus::Placed, OrderCommand::Cancel { reason }) => {
                Ok(vec![OrderEvent::OrderCancelled { reason }])
            }
            (OrderStatus::Cancelled, OrderCommand::Cancel { .. }) => Ok(vec![]),
            (status, _) => Err(DomainError::invalid_operation(format!(
                "order is {status:?}"
            ))),
        }
    }

    fn apply(&mut self, event: &OrderEvent) {
        match event {
            OrderEvent::OrderPlaced { total } => {
                self.status = OrderStatus::Placed;
                self.total = *total;
            }
            OrderEvent::OrderShipped => self.status = OrderStatus::Shipped,
            OrderEvent::OrderCancelled { .. } => self.status = OrderStatus::Cancelled,
        }
    }
}

/// Card limit above which payments are declined
pub const CARD_LIMIT: i64 = 1_000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub settled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PaymentEvent {
    PaymentConfirmed { order_id: String, amount: i64 },
    PaymentFailed { order_id: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct RequestPayment {
    pub order_id: String,
    pub amount: i64,
}

impl Aggregate for Payment {
    const AGGREGATE_TYPE: &'static str = "Payment";
    type Event = PaymentEvent;
    type Command = RequestPayment;

    fn handle(&self, command: RequestPayment) -> DomainResult<Vec<PaymentEvent>> {
        if self.settled {
            return Ok(vec![]);
        }
        if command.amount > CARD_LIMIT {
            return Ok(vec![PaymentEvent::PaymentFailed {
                order_id: command.order_id,
                reason: "card limit exceeded".into(),
            }]);
        }
        Ok(vec![PaymentEvent::PaymentConfirmed {
            order_id: command.order_id,
            amount: command.amount,
        }])
    }

    fn apply(&mut self, _event: &PaymentEvent) {
        self.settled = true;
    }
}

/// Places an order, charges it, ships it; cancels the order when payment fails
pub struct Checkout;

impl SagaDefinition for Checkout {
    fn saga_type(&self) -> &str {
        "checkout"
    }

    fn react(&self, _instance: Option<&SagaInstance>, event: &DomainEvent) -> Option<SagaReaction> {
        match event.event_type.as_str() {
            "OrderPlaced" => {
                let total = event.payload["total"].as_i64().unwrap_or_default();
                Some(
                    SagaReaction::new(SagaInput::Start)
                        .dispatch(SagaCommand::new(
                            "RequestPayment",
                            format!("pay-{}", event.aggregate_id),
                            json!({ "order_id": event.aggregate_id, "amount": total }),
                        ))
                        .with_context(json!({ "order_id": event.aggregate_id })),
                )
            }
            "PaymentConfirmed" => {
                let order_id = event.payload["order_id"].as_str().unwrap_or_default();
                Some(
                    SagaReaction::new(SagaInput::StepConfirmed)
                        .dispatch(SagaCommand::new("ShipOrder", order_id, json!({}))),
                )
            }
            "OrderShipped" => Some(SagaReaction::new(SagaInput::Complete)),
            "PaymentFailed" => Some(SagaReaction::new(SagaInput::Fail)),
            "OrderCancelled" => Some(SagaReaction::new(SagaInput::CompensationConfirmed)),
            _ => None,
        }
    }

    fn compensations(&self, instance: &SagaInstance) -> Vec<SagaCommand> {
        let order_id = instance.context["order_id"].as_str().unwrap_or_default();
        vec![SagaCommand::new(
            "CancelOrder",
            order_id,
            json!({ "reason": "payment failed" }),
        )]
    }
}

/// Routes saga commands to the order and payment command handlers
pub struct ShopBus {
    pub orders: CommandHandler<Order>,
    pub payments: CommandHandler<Payment>,
}

#[async_trait]
impl CommandBus for ShopBus {
    async fn dispatch(&self, command: SagaCommand) -> Result<(), String> {
        let metadata = command.metadata.clone();
        let result = match command.command_type.as_str() {
            "RequestPayment" => {
                let request = RequestPayment {
                    order_id: command.payload["order_id"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                    amount: command.payload["amount"].as_i64().unwrap_or_default(),
                };
                self.payments
                    .execute(&command.aggregate_id, request, metadata)
                    .await
            }
            "ShipOrder" => {
                self.orders
                    .execute(&command.aggregate_id, OrderCommand::Ship, metadata)
                    .await
            }
            "CancelOrder" => {
                let reason = command.payload["reason"]
                    .as_str()
                    .unwrap_or("cancelled")
                    .to_string();
                self.orders
                    .execute(&command.aggregate_id, OrderCommand::Cancel { reason }, metadata)
                    .await
            }
            other => return Err(format!("unknown command {other}")),
        };
        result.map(|_| ()).map_err(|e| e.to_string())
    }
}

pub struct Shop {
    pub store: Arc<InMemoryEventStore>,
    pub orders: CommandHandler<Order>,
    pub bus: Arc<ShopBus>,
}

pub fn shop() -> Shop {
    let store = Arc::new(InMemoryEventStore::new());
    let snapshots = Arc::new(InMemorySnapshotStore::new());
    let orders = EventSourcedRepository::<Order>::new(store.clone(), snapshots.clone());
    let payments = EventSourcedRepository::<Payment>::new(store.clone(), snapshots);
    Shop {
        store,
        orders: CommandHandler::new(orders.clone()),
        bus: Arc::new(ShopBus {
            orders: CommandHandler::new(orders),
            payments: CommandHandler::new(payments),
        }),
    }
}
