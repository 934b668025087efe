//! Settlement Queue
//!
//! Moves each ledger transaction through the settlement stages by way of a
//! persistent, retryable queue.
//!
//! # State Machine
//!
//! ```text
//! Initiated → Pending → Sent → Completed
//!     ↓          ↓        ↓
//!   Failed     Failed   Failed
//! ```
//!
//! # Invariants
//!
//! 1. **One unresolved item per transaction**: a stage's successor is
//!    enqueued in the same repository operation that resolves it
//! 2. **Exclusive claim**: an item is processed only by the worker that won
//!    the compare-and-set on `is_processing`
//! 3. **Bounded retries**: after `max_retries` failed attempts the
//!    transaction is failed and its reservation reversed
//! 4. **Replay safety**: re-running a stage that already applied is a no-op

pub mod engine;
pub mod error;
pub mod gateway;
pub mod memory;
pub mod policy;
pub mod processor;
pub mod repository;
pub mod service;
pub mod state;
pub mod types;
pub mod worker;

pub use engine::{BatchReport, StepOutcome, TransactionQueueEngine};
pub use error::QueueError;
pub use gateway::{
    BankGateway, BankStep, FixedOutcome, OutcomeSource, ProbabilisticOutcome, ScriptedOutcome,
    SimulatedBank,
};
pub use memory::InMemoryQueue;
pub use policy::SchedulePolicy;
pub use processor::StageProcessor;
pub use repository::QueueRepository;
pub use service::TransactionQueueService;
pub use state::SettlementStatus;
pub use types::{Priority, QueueItem, QueueType};
pub use worker::{PoolCommand, PoolHandle, PoolStats, WorkerPool};
