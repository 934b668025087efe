//! Settlement Queue - queue-driven settlement engine
//!
//! Funds movements are reserved on a ledger and then advanced through the
//! settlement stages by a persistent, retryable queue.
//!
//! # Modules
//!
//! - [`core_types`] - Identifier newtypes (AccountId, TransactionId, etc.)
//! - [`clock`] - Injectable wall clock
//! - [`config`] - YAML application config
//! - [`logging`] - Tracing subscriber setup
//! - [`response`] - Uniform response envelope
//! - [`ledger`] - Accounts, transactions and the atomic change set
//! - [`queue`] - Settlement state machine, queue engine and worker pool
//! - [`funds`] - Transfer and deposit entry points

// Core types - must be first!
pub mod core_types;

pub mod clock;
pub mod config;
pub mod logging;
pub mod response;

pub mod funds;
pub mod ledger;
pub mod queue;

// Convenient re-exports at crate root
pub use core_types::{AccountId, QueueItemId, TransactionId, UserId};
pub use funds::{FundsError, FundsService};
pub use ledger::{Account, InMemoryLedger, LedgerError, LedgerStore, Transaction};
pub use queue::{
    InMemoryQueue, QueueError, SettlementStatus, StageProcessor, TransactionQueueEngine,
    TransactionQueueService, WorkerPool,
};
pub use response::ApiResponse;
