//! Stage Processor
//!
//! One handler per target stage. A handler talks to the bank first, with no
//! account lock held, then locks the affected accounts, re-reads everything
//! and commits the transaction together with its balance effects as one
//! [`LedgerChangeSet`].
//!
//! Handlers are replay-safe: when the transaction already sits at the
//! handler's target status the handler reports success and applies nothing.
//! This covers a crash between the ledger commit and the queue resolution.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::error::QueueError;
use super::gateway::{BankGateway, BankReply};
use super::state::SettlementStatus;
use super::types::QueueItem;
use crate::clock::Clock;
use crate::core_types::{AccountId, TransactionId};
use crate::ledger::{
    Account, AccountLocks, LedgerChangeSet, LedgerError, LedgerStore, Transaction,
    TransactionKind,
};

pub const MAX_RETRIES_REASON: &str = "Max retry attempts exceeded";
pub const DEFAULT_FAILURE_REASON: &str = "Transaction processing failed";

/// Result of a successful stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageOutcome {
    /// Status the transaction now holds
    pub status: SettlementStatus,
    /// Stage to enqueue next, `None` once terminal
    pub successor: Option<SettlementStatus>,
    /// True when the stage had already been applied
    pub replayed: bool,
}

impl StageOutcome {
    fn applied(status: SettlementStatus) -> Self {
        Self {
            status,
            successor: status.next_stage(),
            replayed: false,
        }
    }

    fn replayed(status: SettlementStatus) -> Self {
        Self {
            replayed: true,
            ..Self::applied(status)
        }
    }
}

/// How `to_failed` treats an existing failure reason
#[derive(Debug, Clone)]
enum FailureReason {
    /// Keep a recorded reason, else use the default
    KeepOrDefault,
    /// Overwrite with this reason
    Force(String),
}

pub struct StageProcessor {
    ledger: Arc<dyn LedgerStore>,
    gateway: Arc<dyn BankGateway>,
    locks: Arc<AccountLocks>,
    clock: Arc<dyn Clock>,
}

impl StageProcessor {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        gateway: Arc<dyn BankGateway>,
        locks: Arc<AccountLocks>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ledger,
            gateway,
            locks,
            clock,
        }
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerStore> {
        &self.ledger
    }

    /// Lock table shared with every other writer of the same ledger
    pub fn locks(&self) -> &Arc<AccountLocks> {
        &self.locks
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Run the handler for `item.next_status`
    pub async fn execute(&self, item: &QueueItem) -> Result<StageOutcome, QueueError> {
        let tx_id = item.transaction_id;
        match item.next_status {
            SettlementStatus::Initiated => Err(QueueError::InvalidTransition {
                from: item.current_status,
                to: SettlementStatus::Initiated,
            }),
            SettlementStatus::Pending => self.to_pending(tx_id).await,
            SettlementStatus::Sent => self.to_sent(tx_id).await,
            SettlementStatus::Completed => self.to_completed(tx_id).await,
            SettlementStatus::Failed => {
                self.to_failed(tx_id, FailureReason::KeepOrDefault, None)
                    .await
            }
        }
    }

    /// Terminally fail a transaction with `reason`, reversing its reservation
    pub async fn fail_transaction(
        &self,
        tx_id: TransactionId,
        reason: &str,
    ) -> Result<StageOutcome, QueueError> {
        self.to_failed(tx_id, FailureReason::Force(reason.to_string()), None)
            .await
    }

    /// Fail a transaction whose queue item ran out of attempts
    pub async fn fail_exhausted(
        &self,
        tx_id: TransactionId,
        retry_count: u32,
    ) -> Result<StageOutcome, QueueError> {
        self.to_failed(
            tx_id,
            FailureReason::Force(MAX_RETRIES_REASON.to_string()),
            Some(retry_count),
        )
        .await
    }

    /// Copy the queue item's retry count onto a live transaction
    ///
    /// A terminal transaction is left alone.
    pub async fn record_retry(
        &self,
        tx_id: TransactionId,
        retry_count: u32,
    ) -> Result<(), QueueError> {
        let tx = self.load(tx_id).await?;
        let _guard = self.locks.lock(&[tx.account_id]).await;
        let mut tx = self.load(tx_id).await?;
        if tx.is_terminal() || tx.retry_count == retry_count {
            return Ok(());
        }
        tx.retry_count = retry_count;
        tx.updated_at = self.clock.now();
        self.ledger.commit(LedgerChangeSet::new().update(tx)).await?;
        Ok(())
    }

    async fn load(&self, tx_id: TransactionId) -> Result<Transaction, QueueError> {
        self.ledger
            .get_transaction(tx_id)
            .await?
            .ok_or_else(|| QueueError::NotFound(format!("transaction {}", tx_id)))
    }

    async fn load_account(&self, id: AccountId) -> Result<Account, QueueError> {
        Ok(self
            .ledger
            .get_account(id)
            .await?
            .ok_or(LedgerError::AccountNotFound(id))?)
    }

    /// True when `tx` already sits at `target`; error when `target` is
    /// unreachable from its status
    fn already_at(tx: &Transaction, target: SettlementStatus) -> Result<bool, QueueError> {
        if tx.status == target {
            return Ok(true);
        }
        if !tx.status.can_transition_to(target) {
            return Err(QueueError::InvalidTransition {
                from: tx.status,
                to: target,
            });
        }
        Ok(false)
    }

    async fn to_pending(&self, tx_id: TransactionId) -> Result<StageOutcome, QueueError> {
        let target = SettlementStatus::Pending;
        let tx = self.load(tx_id).await?;
        if Self::already_at(&tx, target)? {
            return Ok(StageOutcome::replayed(target));
        }

        info!(reference = %tx.reference, "Processing transaction to Pending");
        if let BankReply::Declined(reason) = self.gateway.screen(&tx).await {
            return Err(QueueError::TransientProcessingFailure(reason));
        }

        let _guard = self.locks.lock(&[tx.account_id]).await;
        let mut tx = self.load(tx_id).await?;
        if Self::already_at(&tx, target)? {
            return Ok(StageOutcome::replayed(target));
        }

        let now = self.clock.now();
        tx.status = target;
        tx.pending_at = Some(now);
        tx.status_message = Some("Transaction validated and pending processing".to_string());
        tx.updated_at = now;
        self.ledger.commit(LedgerChangeSet::new().update(tx)).await?;

        Ok(StageOutcome::applied(target))
    }

    async fn to_sent(&self, tx_id: TransactionId) -> Result<StageOutcome, QueueError> {
        let target = SettlementStatus::Sent;
        let tx = self.load(tx_id).await?;
        if Self::already_at(&tx, target)? {
            return Ok(StageOutcome::replayed(target));
        }

        info!(
            reference = %tx.reference,
            gateway = self.gateway.name(),
            "Sending transaction to recipient bank"
        );
        let session_id = match self.gateway.send(&tx).await {
            BankReply::Accepted(session_id) => session_id,
            BankReply::Declined(reason) => {
                return Err(QueueError::TransientProcessingFailure(reason));
            }
        };

        let _guard = self.locks.lock(&[tx.account_id]).await;
        let mut tx = self.load(tx_id).await?;
        if Self::already_at(&tx, target)? {
            return Ok(StageOutcome::replayed(target));
        }

        let now = self.clock.now();
        tx.status = target;
        tx.sent_at = Some(now);
        tx.session_id = Some(session_id);
        tx.status_message = Some("Sent to recipient bank and acknowledged".to_string());
        tx.updated_at = now;
        self.ledger.commit(LedgerChangeSet::new().update(tx)).await?;

        Ok(StageOutcome::applied(target))
    }

    async fn to_completed(&self, tx_id: TransactionId) -> Result<StageOutcome, QueueError> {
        let target = SettlementStatus::Completed;
        let tx = self.load(tx_id).await?;
        if Self::already_at(&tx, target)? {
            return Ok(StageOutcome::replayed(target));
        }

        info!(reference = %tx.reference, "Completing transaction");
        let ack = match self.gateway.acknowledge(&tx).await {
            BankReply::Accepted(ack) => ack,
            BankReply::Declined(reason) => {
                return Err(QueueError::TransientProcessingFailure(reason));
            }
        };

        let beneficiary_id = match tx.kind {
            TransactionKind::Deposit => None,
            TransactionKind::Transfer => {
                let number = tx.beneficiary_account_number.clone().unwrap_or_default();
                let beneficiary = self
                    .ledger
                    .get_account_by_number(&number)
                    .await?
                    .ok_or(LedgerError::AccountNumberNotFound(number))?;
                Some(beneficiary.id)
            }
        };

        let mut lock_ids = vec![tx.account_id];
        lock_ids.extend(beneficiary_id);
        let _guard = self.locks.lock(&lock_ids).await;

        let mut tx = self.load(tx_id).await?;
        if Self::already_at(&tx, target)? {
            return Ok(StageOutcome::replayed(target));
        }
        let now = self.clock.now();
        let mut originator = self.load_account(tx.account_id).await?;
        originator.settle(tx.kind, tx.amount)?;

        tx.status = target;
        tx.completed_at = Some(now);
        tx.response_code = Some(ack.response_code);
        tx.bank_reference = Some(ack.bank_reference);
        tx.status_message = Some("Transaction completed successfully".to_string());
        tx.updated_at = now;

        let mut changes = LedgerChangeSet::new();
        match beneficiary_id {
            Some(id) if id == originator.id => {
                // Transfer to self: settle and credit land on the same row
                originator.credit(tx.amount);
                changes = changes.insert(tx.beneficiary_credit(&originator, now));
            }
            Some(id) => {
                let mut beneficiary = self.load_account(id).await?;
                beneficiary.credit(tx.amount);
                beneficiary.updated_at = now;
                changes = changes
                    .insert(tx.beneficiary_credit(&beneficiary, now))
                    .account(beneficiary);
            }
            None => {}
        }
        originator.updated_at = now;

        let (amount, kind, reference) = (tx.amount, tx.kind, tx.reference.clone());
        self.ledger
            .commit(changes.account(originator).update(tx))
            .await?;

        debug!(%reference, %kind, %amount, "Reservation settled");
        Ok(StageOutcome::applied(target))
    }

    async fn to_failed(
        &self,
        tx_id: TransactionId,
        reason: FailureReason,
        retry_count: Option<u32>,
    ) -> Result<StageOutcome, QueueError> {
        let target = SettlementStatus::Failed;
        let tx = self.load(tx_id).await?;
        if Self::already_at(&tx, target)? {
            return Ok(StageOutcome::replayed(target));
        }

        let _guard = self.locks.lock(&[tx.account_id]).await;
        let mut tx = self.load(tx_id).await?;
        if Self::already_at(&tx, target)? {
            return Ok(StageOutcome::replayed(target));
        }

        let now = self.clock.now();
        let mut account = self.load_account(tx.account_id).await?;
        account.reverse(tx.kind, tx.amount)?;
        account.updated_at = now;

        tx.status = target;
        tx.failed_at = Some(now);
        tx.response_code = Some("01".to_string());
        tx.failure_reason = match reason {
            FailureReason::Force(reason) => Some(reason),
            FailureReason::KeepOrDefault => tx
                .failure_reason
                .take()
                .or_else(|| Some(DEFAULT_FAILURE_REASON.to_string())),
        };
        tx.status_message = Some("Transaction failed".to_string());
        if let Some(retry_count) = retry_count {
            tx.retry_count = retry_count;
        }
        tx.updated_at = now;

        warn!(
            reference = %tx.reference,
            reason = tx.failure_reason.as_deref().unwrap_or_default(),
            "Transaction failed, reservation reversed"
        );
        self.ledger
            .commit(LedgerChangeSet::new().account(account).update(tx))
            .await?;

        Ok(StageOutcome::applied(target))
    }
}
