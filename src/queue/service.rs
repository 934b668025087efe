//! Queue service facade
//!
//! Envelope-returning wrapper around [`TransactionQueueEngine`] for callers
//! that speak [`ApiResponse`].

use std::sync::Arc;

use tracing::error;

use super::engine::{StepOutcome, TransactionQueueEngine};
use super::state::SettlementStatus;
use super::types::{Priority, QueueItem};
use crate::core_types::TransactionId;
use crate::response::ApiResponse;

pub struct TransactionQueueService {
    engine: Arc<TransactionQueueEngine>,
}

impl TransactionQueueService {
    pub fn new(engine: Arc<TransactionQueueEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<TransactionQueueEngine> {
        &self.engine
    }

    pub async fn enqueue_transaction(
        &self,
        transaction_id: TransactionId,
        target_status: SettlementStatus,
        priority: Priority,
    ) -> ApiResponse<QueueItem> {
        ApiResponse::from_result(
            self.engine
                .enqueue(transaction_id, target_status, priority)
                .await,
            "Transaction enqueued successfully",
        )
    }

    /// Returns the number of items whose stage succeeded
    pub async fn process_next_batch(&self) -> ApiResponse<usize> {
        match self
            .engine
            .process_next_batch(self.engine.batch_size())
            .await
        {
            Ok(report) => ApiResponse::success_with(
                report.processed(),
                format!("Processed {} transactions", report.processed()),
            ),
            Err(e) => {
                error!(error = %e, "Batch processing failed");
                ApiResponse::from_error(&e)
            }
        }
    }

    pub async fn process_transaction_state(
        &self,
        transaction_id: TransactionId,
    ) -> ApiResponse<StepOutcome> {
        ApiResponse::from_result(
            self.engine.process_item(transaction_id).await,
            "Transaction state processed",
        )
    }

    pub async fn get_queue_status(&self) -> ApiResponse<Vec<QueueItem>> {
        ApiResponse::from_result(
            self.engine.get_queue_status().await,
            "Queue status retrieved successfully",
        )
    }

    pub async fn retry_failed_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> ApiResponse<QueueItem> {
        ApiResponse::from_result(
            self.engine.retry_failed_transaction(transaction_id).await,
            "Transaction queued for retry",
        )
    }

    pub async fn get_queue_count(&self) -> ApiResponse<usize> {
        ApiResponse::from_result(
            self.engine.get_queue_count().await,
            "Queue count retrieved successfully",
        )
    }
}
