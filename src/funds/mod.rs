//! Funds-movement entry points
//!
//! Validates transfer and deposit requests, reserves funds on the ledger and
//! hands the new transaction to the settlement queue. Also serves account
//! details and transaction history.

pub mod error;
pub mod service;
pub mod types;

pub use error::FundsError;
pub use service::FundsService;
pub use types::{
    AccountDetails, AddFundsRequest, EntryType, TransactionHistoryEntry, TransactionReceipt,
    TransferRequest,
};
