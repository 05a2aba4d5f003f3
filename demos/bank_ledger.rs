// Copyright 2025 Cowboy AI, LLC.

//! Bank ledger walkthrough
//!
//! Opens an account, shows a stale writer losing the version race, reads the
//! balance back through a projection with read-your-writes, and rebuilds the
//! projection from the log.
//!
//! Run with `RUST_LOG=cim_ledger=debug cargo run --example bank_ledger` to see
//! the library's tracing output.

use anyhow::{bail, Context};
use cim_ledger::{
    Aggregate, CommandHandler, DomainError, DomainEvent, DomainResult, EventMetadata,
    EventSourcedRepository, InMemoryEventStore, InMemorySnapshotStore, LedgerConfig, Projection,
    ProjectionEngine, ProjectionError, ProjectionRunner, QueryService, RepositoryError,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const CONFIG: &str = r#"
[snapshot]
enabled = true
interval = 3

[query]
timeout_ms = 500
poll_interval_ms = 5

[retry]
max_attempts = 5
backoff_ms = 2
"#;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Account {
    owner: String,
    balance: i64,
    open: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
enum AccountEvent {
    AccountOpened { owner: String },
    MoneyDeposited { amount: i64 },
    MoneyWithdrawn { amount: i64 },
}

#[derive(Debug, Clone)]
enum AccountCommand {
    Open { owner: String },
    Deposit { amount: i64 },
    Withdraw { amount: i64 },
}

impl Aggregate for Account {
    const AGGREGATE_TYPE: &'static str = "Account";
    type Event = AccountEvent;
    type Command = AccountCommand;

    fn handle(&self, command: AccountCommand) -> DomainResult<Vec<AccountEvent>> {
        match command {
            AccountCommand::Open { owner } if !self.open => {
                Ok(vec![AccountEvent::AccountOpened { owner }])
            }
            AccountCommand::Open { .. } => Err(DomainError::AlreadyExists(self.owner.clone())),
            _ if !self.open => Err(DomainError::invalid_operation("account is not open")),
            AccountCommand::Deposit { amount } => Ok(vec![AccountEvent::MoneyDeposited { amount }]),
            AccountCommand::Withdraw { amount } if amount > self.balance => {
                Err(DomainError::BusinessRuleViolation {
                    rule: format!("balance {} cannot cover {amount}", self.balance),
                })
            }
            AccountCommand::Withdraw { amount } => {
                Ok(vec![AccountEvent::MoneyWithdrawn { amount }])
            }
        }
    }

    fn apply(&mut self, event: &AccountEvent) {
        match event {
            AccountEvent::AccountOpened { owner } => {
                self.owner = owner.clone();
                self.open = true;
            }
            AccountEvent::MoneyDeposited { amount } => self.balance += amount,
            AccountEvent::MoneyWithdrawn { amount } => self.balance -= amount,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Statement {
    owner: String,
    balance: i64,
    movements: u32,
}

struct Statements;

impl Projection for Statements {
    const NAME: &'static str = "statements";
    type Row = Statement;

    fn apply(
        &self,
        current: Option<&Statement>,
        event: &DomainEvent,
    ) -> Result<Option<Statement>, ProjectionError> {
        let row = match (event.decode::<AccountEvent>()?, current) {
            (AccountEvent::AccountOpened { owner }, _) => Statement {
                owner,
                balance: 0,
                movements: 0,
            },
            (AccountEvent::MoneyDeposited { amount }, Some(row)) => Statement {
                balance: row.balance + amount,
                movements: row.movements + 1,
                ..row.clone()
            },
            (AccountEvent::MoneyWithdrawn { amount }, Some(row)) => Statement {
                balance: row.balance - amount,
                movements: row.movements + 1,
                ..row.clone()
            },
            (_, None) => return Err(ProjectionError::apply("movement before opening")),
        };
        Ok(Some(row))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = LedgerConfig::from_toml_str(CONFIG).context("demo configuration")?;

    let store = Arc::new(InMemoryEventStore::new());
    let snapshots = Arc::new(InMemorySnapshotStore::new());
    let repository = EventSourcedRepository::<Account>::new(store.clone(), snapshots.clone())
        .with_snapshot_policy(config.snapshot.clone());
    let handler = CommandHandler::new(repository.clone()).with_retry_policy(config.retry.clone());

    let engine = Arc::new(ProjectionEngine::new(Statements, store.clone()));
    let runner = ProjectionRunner::spawn(engine.clone(), store.clone(), config.subscription.clone());
    let queries = QueryService::with_config(engine.clone(), config.query.clone());

    handler
        .execute(
            "acc-1",
            AccountCommand::Open {
                owner: "ada".into(),
            },
            EventMetadata::now().with_actor("teller-1"),
        )
        .await?;

    // Two writers load the same version; the second one to save loses.
    let mut first = repository.load("acc-1").await?;
    let mut second = repository.load("acc-1").await?;
    first.execute(AccountCommand::Deposit { amount: 100 })?;
    second.execute(AccountCommand::Deposit { amount: 100 })?;
    repository.save(&mut first).await?;
    match repository.save(&mut second).await {
        Err(RepositoryError::ConcurrencyConflict {
            expected, actual, ..
        }) => info!(expected, actual, "Stale writer rejected"),
        other => bail!("expected a concurrency conflict, got {other:?}"),
    }

    // The handler reloads and retries on its own.
    for amount in [40, 25, 10] {
        handler
            .execute(
                "acc-1",
                AccountCommand::Deposit { amount },
                EventMetadata::now().with_actor("teller-2"),
            )
            .await?;
    }
    let outcome = handler
        .execute(
            "acc-1",
            AccountCommand::Withdraw { amount: 75 },
            EventMetadata::now().with_actor("atm-9"),
        )
        .await?;

    if let Err(rejected) = handler
        .execute(
            "acc-1",
            AccountCommand::Withdraw { amount: 10_000 },
            EventMetadata::now(),
        )
        .await
    {
        info!(error = %rejected, "Overdraft refused");
    }

    let statement = queries.get("acc-1", Some(outcome.version)).await?;
    info!(
        owner = %statement.row.owner,
        balance = statement.row.balance,
        movements = statement.row.movements,
        projected_version = statement.projected_version,
        "Statement read back"
    );

    let snapshot_versions: Vec<u64> = snapshots
        .history("acc-1")
        .await
        .iter()
        .map(|s| s.version)
        .collect();
    info!(?snapshot_versions, "Snapshots taken");

    let before = engine.snapshot_model().await?;
    let replayed = engine.rebuild().await?;
    let after = engine.snapshot_model().await?;
    info!(replayed, identical = before == after, "Projection rebuilt");

    runner.stop().await;
    Ok(())
}
