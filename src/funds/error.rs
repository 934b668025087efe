//! Funds Error Types

use thiserror::Error;

use crate::ledger::LedgerError;
use crate::queue::QueueError;
use crate::response::EnvelopeError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FundsError {
    #[error("Validation failed")]
    Validation(Vec<String>),

    #[error("Account not found")]
    AccountNotFound,

    #[error("Beneficiary account not found")]
    BeneficiaryNotFound,

    #[error("Cannot transfer to your own account")]
    SelfTransfer,

    #[error("Insufficient funds")]
    InsufficientFunds,

    #[error("Transaction not found")]
    TransactionNotFound,

    #[error(transparent)]
    Ledger(LedgerError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl From<LedgerError> for FundsError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientFunds => FundsError::InsufficientFunds,
            other => FundsError::Ledger(other),
        }
    }
}

impl EnvelopeError for FundsError {
    fn code(&self) -> &'static str {
        match self {
            FundsError::Validation(_) => "VALIDATION_FAILED",
            FundsError::AccountNotFound => "ACCOUNT_NOT_FOUND",
            FundsError::BeneficiaryNotFound => "BENEFICIARY_NOT_FOUND",
            FundsError::SelfTransfer => "SELF_TRANSFER",
            FundsError::InsufficientFunds => "INSUFFICIENT_FUNDS",
            FundsError::TransactionNotFound => "TRANSACTION_NOT_FOUND",
            FundsError::Ledger(e) => e.code(),
            FundsError::Queue(e) => e.code(),
        }
    }

    fn http_status(&self) -> u16 {
        match self {
            FundsError::Validation(_) | FundsError::SelfTransfer => 400,
            FundsError::AccountNotFound
            | FundsError::BeneficiaryNotFound
            | FundsError::TransactionNotFound => 404,
            FundsError::InsufficientFunds => 422,
            FundsError::Ledger(e) => e.http_status(),
            FundsError::Queue(e) => e.http_status(),
        }
    }

    fn field_errors(&self) -> Option<Vec<String>> {
        match self {
            FundsError::Validation(errors) => Some(errors.clone()),
            _ => None,
        }
    }
}
