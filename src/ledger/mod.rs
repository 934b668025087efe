//! Ledger
//!
//! Accounts with a settled `balance` and an in-flight `pending_balance`, and
//! the transactions that move money between them. The persistence technology
//! sits behind [`LedgerStore`]; [`InMemoryLedger`] is the bundled
//! implementation.

pub mod error;
pub mod locks;
pub mod memory;
pub mod models;
pub mod store;

pub use error::LedgerError;
pub use locks::{AccountGuard, AccountLocks};
pub use memory::InMemoryLedger;
pub use models::{Account, Transaction, TransactionKind};
pub use store::{LedgerChangeSet, LedgerStore};
