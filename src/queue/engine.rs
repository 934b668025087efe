//! Transaction Queue Engine
//!
//! Drives the settlement state machine through the queue: enqueue, batch
//! claim, dispatch to the [`StageProcessor`], retry with exponential backoff
//! and recovery of orphaned claims.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::error::QueueError;
use super::policy::SchedulePolicy;
use super::processor::StageProcessor;
use super::repository::QueueRepository;
use super::state::SettlementStatus;
use super::types::{Priority, QueueItem, QueueType};
use crate::clock::Clock;
use crate::config::QueueConfig;
use crate::core_types::TransactionId;

/// What one step did to its queue item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    /// Stage applied, item resolved, successor (if any) enqueued
    Advanced { status: SettlementStatus },
    /// Stage failed, item rescheduled
    Retrying {
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
    },
    /// Retries exhausted, transaction failed and item resolved
    Failed,
    /// Target stage can no longer be reached; item resolved without effect
    Discarded,
}

/// Tally of one `process_next_batch` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// Items selected as due
    pub selected: usize,
    pub advanced: usize,
    pub retried: usize,
    pub failed: usize,
    pub discarded: usize,
    /// Lost claim races
    pub skipped: usize,
    /// Steps that errored outside the retry path
    pub errors: usize,
}

impl BatchReport {
    /// Items whose stage succeeded
    pub fn processed(&self) -> usize {
        self.advanced
    }

    fn record(&mut self, result: &Result<StepOutcome, QueueError>) {
        match result {
            Ok(StepOutcome::Advanced { .. }) => self.advanced += 1,
            Ok(StepOutcome::Retrying { .. }) => self.retried += 1,
            Ok(StepOutcome::Failed) => self.failed += 1,
            Ok(StepOutcome::Discarded) => self.discarded += 1,
            Err(QueueError::ConcurrencyConflict) => self.skipped += 1,
            Err(_) => self.errors += 1,
        }
    }
}

pub struct TransactionQueueEngine {
    queue: Arc<dyn QueueRepository>,
    processor: Arc<StageProcessor>,
    policy: SchedulePolicy,
    clock: Arc<dyn Clock>,
    node_id: String,
    batch_size: usize,
    status_page_size: usize,
    stuck_timeout: Duration,
}

impl TransactionQueueEngine {
    pub fn new(
        queue: Arc<dyn QueueRepository>,
        processor: Arc<StageProcessor>,
        config: &QueueConfig,
        node_id: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            queue,
            processor,
            policy: SchedulePolicy::new(config),
            clock,
            node_id: node_id.into(),
            batch_size: config.batch_size.max(1),
            status_page_size: config.status_page_size,
            stuck_timeout: config.stuck_timeout(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn stuck_timeout(&self) -> Duration {
        self.stuck_timeout
    }

    pub fn queue(&self) -> &Arc<dyn QueueRepository> {
        &self.queue
    }

    pub fn processor(&self) -> &Arc<StageProcessor> {
        &self.processor
    }

    pub fn policy(&self) -> &SchedulePolicy {
        &self.policy
    }

    fn new_item(
        &self,
        transaction_id: TransactionId,
        current: SettlementStatus,
        target: SettlementStatus,
        priority: Priority,
        queue_type: QueueType,
        now: DateTime<Utc>,
    ) -> QueueItem {
        QueueItem::new(
            transaction_id,
            current,
            target,
            self.policy.scheduled_time(target, now),
            priority,
            self.policy.max_retries(),
            queue_type,
            now,
        )
    }

    /// Schedule the transaction's move into `target`
    pub async fn enqueue(
        &self,
        transaction_id: TransactionId,
        target: SettlementStatus,
        priority: Priority,
    ) -> Result<QueueItem, QueueError> {
        let tx = self
            .processor
            .ledger()
            .get_transaction(transaction_id)
            .await?
            .ok_or_else(|| QueueError::NotFound(format!("transaction {}", transaction_id)))?;

        if self.queue.get_unresolved(transaction_id).await?.is_some() {
            return Err(QueueError::AlreadyQueued);
        }
        if !tx.status.can_transition_to(target) {
            return Err(QueueError::InvalidTransition {
                from: tx.status,
                to: target,
            });
        }

        let now = self.clock.now();
        let item = self.new_item(
            transaction_id,
            tx.status,
            target,
            priority,
            self.policy.queue_type(tx.amount),
            now,
        );
        self.queue.add(item.clone()).await?;

        info!(
            transaction_id = %transaction_id,
            from = %tx.status,
            stage = %target,
            queue_type = %item.queue_type,
            scheduled = %item.scheduled_process_time,
            "Transaction enqueued"
        );
        Ok(item)
    }

    /// Claim and process up to `batch_size` due items concurrently
    pub async fn process_next_batch(&self, batch_size: usize) -> Result<BatchReport, QueueError> {
        if batch_size == 0 {
            return Err(QueueError::ValidationFailure(vec![
                "Batch size must be greater than zero".to_string(),
            ]));
        }
        let now = self.clock.now();
        let items = self.queue.get_pending_items(batch_size, now).await?;
        let mut report = BatchReport {
            selected: items.len(),
            ..BatchReport::default()
        };
        if items.is_empty() {
            return Ok(report);
        }

        let results = join_all(items.into_iter().map(|item| self.run_item(item))).await;
        for result in &results {
            if let Err(e) = result
                && !matches!(e, QueueError::ConcurrencyConflict)
            {
                error!(error = %e, "Queue step failed");
            }
            report.record(result);
        }

        debug!(
            selected = report.selected,
            advanced = report.advanced,
            retried = report.retried,
            failed = report.failed,
            skipped = report.skipped,
            "Batch processed"
        );
        Ok(report)
    }

    /// Process the transaction's unresolved item now, regardless of schedule
    pub async fn process_item(
        &self,
        transaction_id: TransactionId,
    ) -> Result<StepOutcome, QueueError> {
        let item = self
            .queue
            .get_unresolved(transaction_id)
            .await?
            .ok_or_else(|| {
                QueueError::NotFound(format!("queue item for transaction {}", transaction_id))
            })?;
        self.run_item(item).await
    }

    /// Claim tag unique to one attempt of this node
    ///
    /// Tasks of the same node never share a tag, so a worker whose claim was
    /// swept cannot write over a sibling's fresh claim.
    fn claim_tag(&self) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{}:{}", self.node_id, &suffix[..8])
    }

    /// Claim `item`, run its stage and record the result
    pub async fn run_item(&self, item: QueueItem) -> Result<StepOutcome, QueueError> {
        let holder = self.claim_tag();
        let claimed = match self
            .queue
            .try_claim(item.id, &holder, self.clock.now())
            .await
        {
            Ok(claimed) => claimed,
            Err(QueueError::ConcurrencyConflict) => {
                debug!(transaction_id = %item.transaction_id, "Claim lost to another worker");
                return Err(QueueError::ConcurrencyConflict);
            }
            Err(e) => return Err(e),
        };

        match self.processor.execute(&claimed).await {
            Ok(outcome) => {
                let now = self.clock.now();
                let successor = outcome.successor.map(|next| {
                    self.new_item(
                        claimed.transaction_id,
                        outcome.status,
                        next,
                        claimed.priority,
                        claimed.queue_type,
                        now,
                    )
                });
                self.queue
                    .resolve(claimed.id, &holder, now, successor)
                    .await?;
                info!(
                    transaction_id = %claimed.transaction_id,
                    stage = %outcome.status,
                    replayed = outcome.replayed,
                    "Stage advanced"
                );
                Ok(StepOutcome::Advanced {
                    status: outcome.status,
                })
            }
            Err(e @ (QueueError::InvalidTransition { .. } | QueueError::NotFound(_))) => {
                self.discard(claimed, &holder, &e).await
            }
            Err(e) => self.record_failure(claimed, &holder, e).await,
        }
    }

    async fn discard(
        &self,
        mut item: QueueItem,
        holder: &str,
        cause: &QueueError,
    ) -> Result<StepOutcome, QueueError> {
        warn!(
            transaction_id = %item.transaction_id,
            stage = %item.next_status,
            error = %cause,
            "Discarding unreachable stage"
        );
        item.error_message = Some(cause.to_string());
        item.processed_at = Some(self.clock.now());
        self.queue.release(item, holder).await?;
        Ok(StepOutcome::Discarded)
    }

    async fn record_failure(
        &self,
        mut item: QueueItem,
        holder: &str,
        cause: QueueError,
    ) -> Result<StepOutcome, QueueError> {
        let attempt = item.retry_count;
        item.retry_count = attempt + 1;
        item.error_message = Some(cause.to_string());

        if item.retries_exhausted() {
            warn!(
                transaction_id = %item.transaction_id,
                stage = %item.next_status,
                retry_count = item.retry_count,
                error = %cause,
                "Retries exhausted, failing transaction"
            );
            return self.finalize(item, holder).await;
        }

        let now = self.clock.now();
        let next_attempt_at = now + self.policy.retry_delay(attempt);
        item.scheduled_process_time = next_attempt_at;
        let (transaction_id, stage, retry_count) =
            (item.transaction_id, item.next_status, item.retry_count);

        if let Err(e) = self.queue.release(item, holder).await {
            debug!(%transaction_id, error = %e, "Failure not recorded, claim no longer held");
            return Err(e);
        }

        if cause.is_retryable() {
            warn!(
                %transaction_id,
                %stage,
                retry_count,
                next_attempt_at = %next_attempt_at,
                error = %cause,
                "Stage failed, retry scheduled"
            );
        } else {
            error!(
                %transaction_id,
                %stage,
                retry_count,
                error = %cause,
                "Stage failed with non-transient error, retry scheduled"
            );
        }
        if let Err(e) = self.processor.record_retry(transaction_id, retry_count).await {
            warn!(%transaction_id, error = %e, "Could not mirror retry count to ledger");
        }

        Ok(StepOutcome::Retrying {
            retry_count,
            next_attempt_at,
        })
    }

    /// Fail the transaction of a claimed, exhausted item and resolve the item
    async fn finalize(
        &self,
        mut item: QueueItem,
        holder: &str,
    ) -> Result<StepOutcome, QueueError> {
        match self
            .processor
            .fail_exhausted(item.transaction_id, item.retry_count)
            .await
        {
            Ok(_) | Err(QueueError::InvalidTransition { .. }) => {
                item.processed_at = Some(self.clock.now());
                self.queue.release(item, holder).await?;
                Ok(StepOutcome::Failed)
            }
            Err(e) => {
                // Left exhausted and unclaimed; the maintenance sweep retries it
                error!(
                    transaction_id = %item.transaction_id,
                    error = %e,
                    "Could not fail exhausted transaction"
                );
                self.queue.release(item, holder).await?;
                Err(e)
            }
        }
    }

    /// Claimable items, up to the status page size
    pub async fn get_queue_status(&self) -> Result<Vec<QueueItem>, QueueError> {
        self.queue
            .get_pending_items(self.status_page_size, self.clock.now())
            .await
    }

    /// Number of unresolved items
    pub async fn get_queue_count(&self) -> Result<usize, QueueError> {
        self.queue.count_unresolved().await
    }

    /// Reset the transaction's item so it is due immediately
    ///
    /// Targets the unresolved item, else the latest resolved one.
    pub async fn retry_failed_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<QueueItem, QueueError> {
        let item = match self.queue.get_unresolved(transaction_id).await? {
            Some(item) => item,
            None => self
                .queue
                .get_by_transaction_id(transaction_id)
                .await?
                .ok_or_else(|| {
                    QueueError::NotFound(format!("queue item for transaction {}", transaction_id))
                })?,
        };
        let tx = self
            .processor
            .ledger()
            .get_transaction(transaction_id)
            .await?
            .ok_or_else(|| QueueError::NotFound(format!("transaction {}", transaction_id)))?;

        if tx.is_terminal() {
            return Err(QueueError::InvalidTransition {
                from: tx.status,
                to: item.next_status,
            });
        }

        let item = self
            .queue
            .reset_for_retry(item.id, self.clock.now())
            .await?;
        info!(
            transaction_id = %transaction_id,
            stage = %item.next_status,
            "Queue item reset for retry"
        );
        Ok(item)
    }

    /// Claimed items not touched for longer than `timeout`
    pub async fn get_stuck_transactions(
        &self,
        timeout: Duration,
    ) -> Result<Vec<QueueItem>, QueueError> {
        self.queue.get_stuck_items(timeout, self.clock.now()).await
    }

    /// Release orphaned claims; returns how many were released
    pub async fn recover_stuck_transactions(&self, timeout: Duration) -> Result<usize, QueueError> {
        let cutoff = self.clock.now() - timeout;
        let stuck = self.get_stuck_transactions(timeout).await?;
        let mut recovered = 0;
        for item in stuck {
            match self.queue.release_stale(item.id, cutoff).await {
                Ok(true) => {
                    warn!(
                        transaction_id = %item.transaction_id,
                        node = item.processing_node.as_deref().unwrap_or_default(),
                        retry_count = item.retry_count,
                        "Recovered stuck queue item"
                    );
                    recovered += 1;
                }
                // Finished or re-claimed since it was read
                Ok(false) => {}
                Err(e) => error!(error = %e, "Failed to recover stuck item"),
            }
        }
        if recovered > 0 {
            info!(count = recovered, "Recovered stuck queue items");
        }
        Ok(recovered)
    }

    /// Fail transactions whose items ran out of attempts without being
    /// finalized; returns how many were finalized
    pub async fn finalize_exhausted(&self, limit: usize) -> Result<usize, QueueError> {
        let mut finalized = 0;
        for item in self.queue.get_exhausted_items(limit).await? {
            let holder = self.claim_tag();
            let claimed = match self
                .queue
                .try_claim(item.id, &holder, self.clock.now())
                .await
            {
                Ok(claimed) => claimed,
                Err(QueueError::ConcurrencyConflict) => continue,
                Err(e) => return Err(e),
            };
            if self.finalize(claimed, &holder).await.is_ok() {
                finalized += 1;
            }
        }
        Ok(finalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::StageDelays;
    use crate::ledger::{
        Account, AccountLocks, InMemoryLedger, LedgerChangeSet, LedgerStore, Transaction,
        TransactionKind,
    };
    use crate::queue::gateway::{
        Acknowledgment, BankGateway, BankReply, BankStep, FixedOutcome, OutcomeSource,
        ScriptedOutcome, SimulatedBank,
    };
    use crate::queue::memory::InMemoryQueue;
    use crate::queue::processor::MAX_RETRIES_REASON;
    use rust_decimal::Decimal;

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    struct Harness {
        clock: Arc<ManualClock>,
        ledger: Arc<InMemoryLedger>,
        queue: Arc<InMemoryQueue>,
        engine: TransactionQueueEngine,
        account: Account,
    }

    async fn harness(outcomes: Arc<dyn OutcomeSource>) -> Harness {
        let clock = Arc::new(ManualClock::default());
        let ledger = Arc::new(InMemoryLedger::new());
        let queue = Arc::new(InMemoryQueue::new(clock.clone()));
        let account = Account::open(1, "1000000001", d("1000.00"), clock.now());
        ledger.add_account(account.clone()).await.unwrap();

        let processor = Arc::new(StageProcessor::new(
            ledger.clone(),
            Arc::new(SimulatedBank::instant(outcomes, clock.clone())),
            Arc::new(AccountLocks::new()),
            clock.clone(),
        ));
        let engine = TransactionQueueEngine::new(
            queue.clone(),
            processor,
            &QueueConfig::default(),
            "node-test",
            clock.clone(),
        );
        Harness {
            clock,
            ledger,
            queue,
            engine,
            account,
        }
    }

    async fn deposit(h: &Harness, amount: &str) -> Transaction {
        let mut acc = h.ledger.get_account(h.account.id).await.unwrap().unwrap();
        acc.reserve(TransactionKind::Deposit, d(amount)).unwrap();
        let tx = Transaction::deposit(&acc, d(amount), "card", h.clock.now());
        h.ledger
            .commit(LedgerChangeSet::new().account(acc).insert(tx.clone()))
            .await
            .unwrap();
        tx
    }

    #[tokio::test]
    async fn test_enqueue_schedules_stage_delay() {
        let h = harness(Arc::new(FixedOutcome(true))).await;
        let tx = deposit(&h, "500.00").await;
        let item = h
            .engine
            .enqueue(tx.id, SettlementStatus::Pending, Priority::Normal)
            .await
            .unwrap();

        assert_eq!(item.current_status, SettlementStatus::Initiated);
        assert_eq!(item.next_status, SettlementStatus::Pending);
        assert_eq!(item.scheduled_process_time, h.clock.now() + Duration::seconds(10));
        assert_eq!(item.max_retries, 3);
        assert_eq!(item.queue_type, QueueType::Standard);
        assert_eq!(h.engine.get_queue_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_rejections() {
        let h = harness(Arc::new(FixedOutcome(true))).await;
        let missing = h
            .engine
            .enqueue(TransactionId::new(), SettlementStatus::Pending, Priority::Normal)
            .await;
        assert!(matches!(missing, Err(QueueError::NotFound(_))));

        let tx = deposit(&h, "5.00").await;
        let skip = h
            .engine
            .enqueue(tx.id, SettlementStatus::Sent, Priority::Normal)
            .await;
        assert!(matches!(skip, Err(QueueError::InvalidTransition { .. })));

        h.engine
            .enqueue(tx.id, SettlementStatus::Pending, Priority::Normal)
            .await
            .unwrap();
        let dup = h
            .engine
            .enqueue(tx.id, SettlementStatus::Pending, Priority::Normal)
            .await;
        assert_eq!(dup.unwrap_err(), QueueError::AlreadyQueued);
    }

    #[tokio::test]
    async fn test_zero_batch_is_rejected() {
        let h = harness(Arc::new(FixedOutcome(true))).await;
        let err = h.engine.process_next_batch(0).await.unwrap_err();
        assert!(matches!(err, QueueError::ValidationFailure(_)));
    }

    #[tokio::test]
    async fn test_batch_respects_schedule() {
        let h = harness(Arc::new(FixedOutcome(true))).await;
        let tx = deposit(&h, "500.00").await;
        h.engine
            .enqueue(tx.id, SettlementStatus::Pending, Priority::Normal)
            .await
            .unwrap();

        let early = h.engine.process_next_batch(10).await.unwrap();
        assert_eq!(early.selected, 0);

        h.clock.advance(Duration::seconds(10));
        let report = h.engine.process_next_batch(10).await.unwrap();
        assert_eq!(report.processed(), 1);

        let stored = h.ledger.get_transaction(tx.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SettlementStatus::Pending);

        let next = h.queue.get_unresolved(tx.id).await.unwrap().unwrap();
        assert_eq!(next.current_status, SettlementStatus::Pending);
        assert_eq!(next.next_status, SettlementStatus::Sent);
        assert_eq!(next.scheduled_process_time, h.clock.now() + Duration::seconds(30));
        assert_eq!(h.engine.get_queue_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_backoff_then_exhaustion() {
        let outcomes = Arc::new(ScriptedOutcome::new(true));
        outcomes.script(BankStep::InterbankSend, [false, false, false]);
        let h = harness(outcomes.clone()).await;
        let tx = deposit(&h, "500.00").await;
        h.engine
            .enqueue(tx.id, SettlementStatus::Pending, Priority::Normal)
            .await
            .unwrap();
        h.engine.process_item(tx.id).await.unwrap();

        // attempt 0 and 1 back off by 30s and 60s
        for (attempt, wait) in [(0u32, 30i64), (1, 60)] {
            let at = h.clock.now();
            let outcome = h.engine.process_item(tx.id).await.unwrap();
            assert_eq!(
                outcome,
                StepOutcome::Retrying {
                    retry_count: attempt + 1,
                    next_attempt_at: at + Duration::seconds(wait),
                }
            );
            h.clock.advance(Duration::seconds(wait));
        }

        let outcome = h.engine.process_item(tx.id).await.unwrap();
        assert_eq!(outcome, StepOutcome::Failed);

        let stored = h.ledger.get_transaction(tx.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SettlementStatus::Failed);
        assert_eq!(stored.failure_reason.as_deref(), Some(MAX_RETRIES_REASON));
        assert_eq!(stored.retry_count, 3);
        let acc = h.ledger.get_account(h.account.id).await.unwrap().unwrap();
        assert_eq!(acc.pending_balance, d("0.00"));
        assert_eq!(acc.balance, d("1000.00"));
        assert_eq!(h.engine.get_queue_count().await.unwrap(), 0);
        assert_eq!(outcomes.calls(BankStep::InterbankSend), 3);
    }

    #[tokio::test]
    async fn test_retry_failed_transaction() {
        let outcomes = Arc::new(ScriptedOutcome::new(true));
        outcomes.script(BankStep::InterbankSend, [false]);
        let h = harness(outcomes).await;
        let tx = deposit(&h, "20.00").await;
        h.engine
            .enqueue(tx.id, SettlementStatus::Pending, Priority::Normal)
            .await
            .unwrap();
        h.engine.process_item(tx.id).await.unwrap();
        h.engine.process_item(tx.id).await.unwrap();

        // Pending item is resolved; the unresolved Sent item is the one reset
        let item = h.engine.retry_failed_transaction(tx.id).await.unwrap();
        assert_eq!(item.next_status, SettlementStatus::Sent);
        assert_eq!(item.retry_count, 0);
        assert!(item.error_message.is_none());
        assert_eq!(item.scheduled_process_time, h.clock.now());

        let report = h.engine.process_next_batch(10).await.unwrap();
        assert_eq!(report.processed(), 1);
        let stored = h.ledger.get_transaction(tx.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SettlementStatus::Sent);

        assert!(matches!(
            h.engine.retry_failed_transaction(TransactionId::new()).await,
            Err(QueueError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_retry_refuses_terminal_transaction() {
        let h = harness(Arc::new(FixedOutcome(true))).await;
        let tx = deposit(&h, "20.00").await;
        h.engine
            .enqueue(tx.id, SettlementStatus::Failed, Priority::High)
            .await
            .unwrap();
        assert_eq!(
            h.engine.process_item(tx.id).await.unwrap(),
            StepOutcome::Advanced {
                status: SettlementStatus::Failed
            }
        );
        assert!(matches!(
            h.engine.retry_failed_transaction(tx.id).await,
            Err(QueueError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_stuck_recovery() {
        let h = harness(Arc::new(FixedOutcome(true))).await;
        let tx = deposit(&h, "20.00").await;
        let item = h
            .engine
            .enqueue(tx.id, SettlementStatus::Pending, Priority::Normal)
            .await
            .unwrap();
        // A worker that crashed right after claiming
        h.queue
            .try_claim(item.id, "node-dead", h.clock.now())
            .await
            .unwrap();

        let timeout = Duration::minutes(5);
        assert!(h.engine.get_stuck_transactions(timeout).await.unwrap().is_empty());

        h.clock.advance(Duration::minutes(6));
        let stuck = h.engine.get_stuck_transactions(timeout).await.unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(h.engine.recover_stuck_transactions(timeout).await.unwrap(), 1);

        let released = h.queue.get(item.id).await.unwrap().unwrap();
        assert!(!released.is_processing);
        assert!(released.processing_node.is_none());
        assert_eq!(h.engine.get_queue_status().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_finalize_exhausted_after_failed_reversal() {
        let outcomes = Arc::new(ScriptedOutcome::new(true));
        outcomes.script(BankStep::InterbankSend, [false, false]);
        let h = harness(outcomes).await;
        let config = QueueConfig {
            max_retries: 1,
            stage_delays: StageDelays::immediate(),
            ..QueueConfig::default()
        };
        let engine = TransactionQueueEngine::new(
            h.queue.clone(),
            h.engine.processor.clone(),
            &config,
            "node-test",
            h.clock.clone(),
        );
        let tx = deposit(&h, "20.00").await;
        engine
            .enqueue(tx.id, SettlementStatus::Pending, Priority::Normal)
            .await
            .unwrap();
        engine.process_item(tx.id).await.unwrap();

        // Sending declines; the reversal commit also fails once
        h.ledger.fail_next_commits(1);
        assert!(engine.process_item(tx.id).await.is_err());
        assert_eq!(engine.get_queue_count().await.unwrap(), 1);
        assert!(engine.get_queue_status().await.unwrap().is_empty());

        assert_eq!(engine.finalize_exhausted(10).await.unwrap(), 1);
        let stored = h.ledger.get_transaction(tx.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SettlementStatus::Failed);
        assert_eq!(engine.get_queue_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_discard_unreachable_stage() {
        let h = harness(Arc::new(FixedOutcome(true))).await;
        let tx = deposit(&h, "20.00").await;
        let item = h
            .engine
            .enqueue(tx.id, SettlementStatus::Pending, Priority::Normal)
            .await
            .unwrap();
        // Transaction failed out of band while the item waited
        h.engine
            .processor
            .fail_transaction(tx.id, "Cancelled")
            .await
            .unwrap();

        assert_eq!(
            h.engine.process_item(tx.id).await.unwrap(),
            StepOutcome::Discarded
        );
        let resolved = h.queue.get(item.id).await.unwrap().unwrap();
        assert!(resolved.is_resolved());
        assert!(resolved.error_message.is_some());
    }

    /// Bank whose `send` blocks until the test opens that call's gate, then
    /// declines
    struct GatedBank {
        gates: std::sync::Mutex<std::collections::VecDeque<tokio::sync::oneshot::Receiver<()>>>,
        entered: tokio::sync::mpsc::UnboundedSender<()>,
    }

    #[async_trait::async_trait]
    impl BankGateway for GatedBank {
        fn name(&self) -> &'static str {
            "gated"
        }

        async fn screen(&self, _tx: &Transaction) -> BankReply<()> {
            BankReply::Accepted(())
        }

        async fn send(&self, _tx: &Transaction) -> BankReply<String> {
            let gate = self.gates.lock().unwrap().pop_front();
            let _ = self.entered.send(());
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            BankReply::Declined("Interbank timeout".to_string())
        }

        async fn acknowledge(&self, _tx: &Transaction) -> BankReply<Acknowledgment> {
            BankReply::Accepted(Acknowledgment {
                response_code: "00".to_string(),
                bank_reference: "ACK".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_swept_worker_cannot_release_new_claim() {
        let h = harness(Arc::new(FixedOutcome(true))).await;
        let (entered_tx, mut entered) = tokio::sync::mpsc::unbounded_channel();
        let (open_a, gate_a) = tokio::sync::oneshot::channel();
        let (open_b, gate_b) = tokio::sync::oneshot::channel();
        let bank = Arc::new(GatedBank {
            gates: std::sync::Mutex::new([gate_a, gate_b].into()),
            entered: entered_tx,
        });
        let processor = Arc::new(StageProcessor::new(
            h.ledger.clone(),
            bank,
            Arc::new(AccountLocks::new()),
            h.clock.clone(),
        ));
        let engine = |node: &str| {
            Arc::new(TransactionQueueEngine::new(
                h.queue.clone(),
                processor.clone(),
                &QueueConfig::default(),
                node,
                h.clock.clone(),
            ))
        };
        let (node_a, node_b, node_c) = (engine("node-a"), engine("node-b"), engine("node-c"));

        let tx = deposit(&h, "20.00").await;
        node_a
            .enqueue(tx.id, SettlementStatus::Pending, Priority::Normal)
            .await
            .unwrap();
        node_a.process_item(tx.id).await.unwrap();

        // node-a stalls inside the interbank send
        let a = tokio::spawn({
            let node_a = node_a.clone();
            async move { node_a.process_item(tx.id).await }
        });
        entered.recv().await.unwrap();

        // Its claim goes stale and node-b picks the item up
        h.clock.advance(Duration::seconds(301));
        assert_eq!(
            node_c
                .recover_stuck_transactions(Duration::minutes(5))
                .await
                .unwrap(),
            1
        );
        let b = tokio::spawn({
            let node_b = node_b.clone();
            async move { node_b.process_item(tx.id).await }
        });
        entered.recv().await.unwrap();
        let held = h.queue.get_unresolved(tx.id).await.unwrap().unwrap();
        assert!(held.processing_node.as_deref().unwrap().starts_with("node-b:"));

        // node-a's late decline must not touch node-b's claim
        open_a.send(()).unwrap();
        assert_eq!(a.await.unwrap(), Err(QueueError::ConcurrencyConflict));
        let still = h.queue.get_unresolved(tx.id).await.unwrap().unwrap();
        assert!(still.is_processing);
        assert_eq!(still.processing_node, held.processing_node);
        assert_eq!(still.retry_count, 0);
        assert_eq!(node_c.process_next_batch(10).await.unwrap().selected, 0);
        assert_eq!(
            h.queue
                .try_claim(still.id, "node-c", h.clock.now())
                .await
                .unwrap_err(),
            QueueError::ConcurrencyConflict
        );

        // node-b's decline is the one recorded
        open_b.send(()).unwrap();
        assert!(matches!(
            b.await.unwrap(),
            Ok(StepOutcome::Retrying { retry_count: 1, .. })
        ));
        let after = h.queue.get_unresolved(tx.id).await.unwrap().unwrap();
        assert!(!after.is_processing);
        assert_eq!(after.retry_count, 1);
        let stored = h.ledger.get_transaction(tx.id).await.unwrap().unwrap();
        assert_eq!(stored.retry_count, 1);
    }

    #[tokio::test]
    async fn test_claims_of_one_node_are_distinct() {
        let h = harness(Arc::new(FixedOutcome(true))).await;
        let tags: std::collections::HashSet<_> =
            (0..5).map(|_| h.engine.claim_tag()).collect();
        assert_eq!(tags.len(), 5);
        assert!(tags.iter().all(|t| t.starts_with("node-test:")));
    }
}
