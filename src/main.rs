//! Settlement Queue - demo node
//!
//! Wires the in-memory ledger and queue to the simulated bank, opens two
//! demo accounts, books a deposit and a transfer, and lets the worker pool
//! settle them.
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌──────────┐    ┌──────────┐
//! │  Funds   │───▶│  Ledger  │───▶│  Queue   │───▶│  Worker  │
//! │ (reserve)│    │ (commit) │    │ (stages) │    │  (pool)  │
//! └──────────┘    └──────────┘    └──────────┘    └──────────┘
//! ```
//!
//! Usage: `settlement_queue [--env dev] [--run-secs 600]`

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use rust_decimal::Decimal;
use tracing::{info, warn};

use settlement_queue::clock::{Clock, SystemClock};
use settlement_queue::config::AppConfig;
use settlement_queue::funds::{AddFundsRequest, FundsService, TransferRequest};
use settlement_queue::ledger::{AccountLocks, InMemoryLedger, LedgerStore};
use settlement_queue::queue::{
    InMemoryQueue, QueueRepository, SimulatedBank, StageProcessor, TransactionQueueEngine,
    WorkerPool,
};

// ============================================================
// ARGS
// ============================================================

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

fn get_run_secs() -> u64 {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if args[i] == "--run-secs" && i + 1 < args.len() {
            return args[i + 1].parse().unwrap_or(600);
        }
    }
    600
}

// ============================================================
// MAIN
// ============================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let app_config = match AppConfig::load(&env) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Config '{}' unavailable ({:#}), using defaults", env, e);
            AppConfig::default()
        }
    };
    let _log_guard = settlement_queue::logging::init_logging(&app_config);

    info!(
        env = %env,
        git = env!("GIT_HASH"),
        node = %app_config.node_id,
        "Starting settlement node"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ledger = Arc::new(InMemoryLedger::new());
    let queue = Arc::new(InMemoryQueue::new(clock.clone()));
    let gateway = Arc::new(SimulatedBank::from_config(
        &app_config.simulation,
        clock.clone(),
    ));
    let processor = Arc::new(StageProcessor::new(
        ledger.clone(),
        gateway,
        Arc::new(AccountLocks::new()),
        clock.clone(),
    ));
    let engine = Arc::new(TransactionQueueEngine::new(
        queue.clone(),
        processor,
        &app_config.queue,
        app_config.node_id.clone(),
        clock,
    ));
    let funds = FundsService::new(engine.clone());

    // Demo accounts and movements
    let alice = funds.open_account(1, Decimal::from(1000)).await;
    let bob = funds.open_account(2, Decimal::from(250)).await;
    let (Some(alice), Some(bob)) = (alice.data, bob.data) else {
        bail!("failed to open demo accounts");
    };
    info!(alice = %alice.account_number, bob = %bob.account_number, "Demo accounts opened");

    let deposit = funds
        .add_funds(
            1,
            AddFundsRequest {
                amount: Decimal::new(50000, 2),
                payment_method: "card".to_string(),
            },
        )
        .await;
    info!(success = deposit.success, message = %deposit.message, "Deposit submitted");

    let transfer = funds
        .transfer_funds(
            1,
            TransferRequest {
                beneficiary_account_number: bob.account_number.clone(),
                beneficiary_bank_name: "Demo Bank".to_string(),
                amount: Decimal::new(30000, 2),
                description: Some("Demo transfer".to_string()),
            },
        )
        .await;
    info!(success = transfer.success, message = %transfer.message, "Transfer submitted");

    let pool = WorkerPool::spawn(engine.clone(), app_config.worker.clone());

    let deadline = Instant::now() + Duration::from_secs(get_run_secs());
    let mut tick = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, shutting down");
                break;
            }
            _ = tick.tick() => {
                let open = queue.count_unresolved().await.context("queue count")?;
                if open == 0 {
                    info!("All transactions settled");
                    break;
                }
                if Instant::now() >= deadline {
                    warn!(open, "Run time elapsed with items still queued");
                    break;
                }
            }
        }
    }

    let stats = pool.shutdown().await;
    info!(
        batches_run = stats.batches_run,
        items_settled = stats.items_settled,
        recovered = stats.recovered,
        task_failures = stats.task_failures,
        "Worker pool drained"
    );

    for account in ledger.accounts() {
        info!(
            account_number = %account.account_number,
            balance = %account.balance,
            pending = %account.pending_balance,
            "Final balance"
        );
        for tx in ledger
            .transactions_for_account(account.id, None, None)
            .await
            .context("history")?
        {
            info!(
                reference = %tx.reference,
                kind = %tx.kind,
                status = %tx.status,
                reason = tx.failure_reason.as_deref().unwrap_or("-"),
                "Transaction"
            );
        }
    }

    Ok(())
}
