//! Queue Error Types

use thiserror::Error;

use crate::ledger::LedgerError;
use crate::response::EnvelopeError;

use super::state::SettlementStatus;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueueError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transaction already has an unresolved queue item")]
    AlreadyQueued,

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        from: SettlementStatus,
        to: SettlementStatus,
    },

    #[error("Validation failed")]
    ValidationFailure(Vec<String>),

    #[error("Stage processing failed: {0}")]
    TransientProcessingFailure(String),

    #[error("Max retry attempts exceeded")]
    RetryExhausted,

    #[error("Queue item is claimed or resolved by another worker")]
    ConcurrencyConflict,

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl QueueError {
    /// Whether a later attempt of the same stage may succeed
    ///
    /// Invalid transitions and missing records never heal by themselves.
    pub fn is_retryable(&self) -> bool {
        match self {
            QueueError::TransientProcessingFailure(_)
            | QueueError::ConcurrencyConflict
            | QueueError::Storage(_) => true,
            QueueError::Ledger(e) => matches!(
                e,
                LedgerError::VersionConflict(_) | LedgerError::Storage(_)
            ),
            QueueError::NotFound(_)
            | QueueError::AlreadyQueued
            | QueueError::InvalidTransition { .. }
            | QueueError::ValidationFailure(_)
            | QueueError::RetryExhausted => false,
        }
    }
}

impl EnvelopeError for QueueError {
    fn code(&self) -> &'static str {
        match self {
            QueueError::NotFound(_) => "NOT_FOUND",
            QueueError::AlreadyQueued => "ALREADY_QUEUED",
            QueueError::InvalidTransition { .. } => "INVALID_TRANSITION",
            QueueError::ValidationFailure(_) => "VALIDATION_FAILURE",
            QueueError::TransientProcessingFailure(_) => "PROCESSING_FAILURE",
            QueueError::RetryExhausted => "RETRY_EXHAUSTED",
            QueueError::ConcurrencyConflict => "CONCURRENCY_CONFLICT",
            QueueError::Ledger(e) => e.code(),
            QueueError::Storage(_) => "STORAGE_ERROR",
        }
    }

    fn http_status(&self) -> u16 {
        match self {
            QueueError::NotFound(_) => 404,
            QueueError::AlreadyQueued | QueueError::ConcurrencyConflict => 409,
            QueueError::InvalidTransition { .. } | QueueError::ValidationFailure(_) => 400,
            QueueError::RetryExhausted => 422,
            QueueError::TransientProcessingFailure(_) => 502,
            QueueError::Ledger(e) => e.http_status(),
            QueueError::Storage(_) => 500,
        }
    }

    fn field_errors(&self) -> Option<Vec<String>> {
        match self {
            QueueError::ValidationFailure(errors) => Some(errors.clone()),
            _ => None,
        }
    }
}
