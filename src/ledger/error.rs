//! Ledger Error Types

use thiserror::Error;

use crate::core_types::{AccountId, TransactionId};
use crate::response::EnvelopeError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("Account not found for number {0}")]
    AccountNumberNotFound(String),

    #[error("Transaction not found: {0}")]
    TransactionNotFound(TransactionId),

    #[error("Account {0} was modified concurrently")]
    VersionConflict(AccountId),

    #[error("Account number already exists: {0}")]
    DuplicateAccountNumber(String),

    #[error("User already owns an account")]
    DuplicateOwner,

    #[error("Transaction reference already exists: {0}")]
    DuplicateReference(String),

    #[error("Transaction {0} is terminal and cannot change")]
    ImmutableTransaction(TransactionId),

    #[error("Insufficient funds")]
    InsufficientFunds,

    #[error("Operation would drive {field} negative on account {account_id}")]
    NegativeBalance {
        account_id: AccountId,
        field: &'static str,
    },

    #[error("Storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    /// True when re-reading and retrying the same operation may succeed
    pub fn is_conflict(&self) -> bool {
        matches!(self, LedgerError::VersionConflict(_))
    }
}

impl EnvelopeError for LedgerError {
    fn code(&self) -> &'static str {
        match self {
            LedgerError::AccountNotFound(_) | LedgerError::AccountNumberNotFound(_) => {
                "ACCOUNT_NOT_FOUND"
            }
            LedgerError::TransactionNotFound(_) => "TRANSACTION_NOT_FOUND",
            LedgerError::VersionConflict(_) => "VERSION_CONFLICT",
            LedgerError::DuplicateAccountNumber(_) => "DUPLICATE_ACCOUNT_NUMBER",
            LedgerError::DuplicateOwner => "DUPLICATE_OWNER",
            LedgerError::DuplicateReference(_) => "DUPLICATE_REFERENCE",
            LedgerError::ImmutableTransaction(_) => "IMMUTABLE_TRANSACTION",
            LedgerError::InsufficientFunds => "INSUFFICIENT_FUNDS",
            LedgerError::NegativeBalance { .. } => "NEGATIVE_BALANCE",
            LedgerError::Storage(_) => "STORAGE_ERROR",
        }
    }

    fn http_status(&self) -> u16 {
        match self {
            LedgerError::AccountNotFound(_)
            | LedgerError::AccountNumberNotFound(_)
            | LedgerError::TransactionNotFound(_) => 404,
            LedgerError::VersionConflict(_)
            | LedgerError::DuplicateAccountNumber(_)
            | LedgerError::DuplicateOwner
            | LedgerError::DuplicateReference(_)
            | LedgerError::ImmutableTransaction(_) => 409,
            LedgerError::InsufficientFunds | LedgerError::NegativeBalance { .. } => 422,
            LedgerError::Storage(_) => 500,
        }
    }
}
