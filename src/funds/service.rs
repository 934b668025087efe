//! Funds Service
//!
//! User-facing funds movement. A request is validated, its reservation is
//! committed to the ledger together with a new `Initiated` transaction, and
//! the transaction is handed to the settlement queue for its move into
//! `Pending`. Nothing settles here; the queue does that.
//!
//! Reservations take the same [`AccountLocks`] the stage processor uses, so a
//! reservation and a settlement on one account never interleave.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use tracing::{error, info, warn};
use validator::Validate;

use super::error::FundsError;
use super::types::{
    AccountDetails, AddFundsRequest, TransactionHistoryEntry, TransactionReceipt,
    TransferRequest, validation_messages,
};
use crate::clock::Clock;
use crate::core_types::UserId;
use crate::ledger::{
    Account, AccountLocks, LedgerChangeSet, LedgerError, LedgerStore, Transaction,
    TransactionKind,
};
use crate::queue::{Priority, SettlementStatus, TransactionQueueEngine};
use crate::response::ApiResponse;

/// Attempts at drawing an unused account number before giving up
const ACCOUNT_NUMBER_ATTEMPTS: usize = 5;

pub const ENQUEUE_FAILURE_REASON: &str = "Failed to enqueue transaction";

pub struct FundsService {
    ledger: Arc<dyn LedgerStore>,
    locks: Arc<AccountLocks>,
    engine: Arc<TransactionQueueEngine>,
    clock: Arc<dyn Clock>,
}

impl FundsService {
    /// Shares the ledger, lock table and clock of the engine's processor
    pub fn new(engine: Arc<TransactionQueueEngine>) -> Self {
        let processor = engine.processor();
        Self {
            ledger: processor.ledger().clone(),
            locks: processor.locks().clone(),
            clock: processor.clock().clone(),
            engine,
        }
    }

    pub async fn transfer_funds(
        &self,
        user_id: UserId,
        request: TransferRequest,
    ) -> ApiResponse<TransactionReceipt> {
        let result = self.transfer(user_id, request).await;
        if let Err(e) = &result {
            log_failure(user_id, "transfer", e);
        }
        ApiResponse::from_result(result, "Transfer initiated successfully")
    }

    pub async fn add_funds(
        &self,
        user_id: UserId,
        request: AddFundsRequest,
    ) -> ApiResponse<TransactionReceipt> {
        let result = self.deposit(user_id, request).await;
        if let Err(e) = &result {
            log_failure(user_id, "deposit", e);
        }
        ApiResponse::from_result(result, "Deposit initiated successfully")
    }

    pub async fn get_account_details(&self, user_id: UserId) -> ApiResponse<AccountDetails> {
        let result = self
            .account_for(user_id)
            .await
            .map(|account| AccountDetails::from(&account));
        ApiResponse::from_result(result, "Account details retrieved successfully")
    }

    /// Newest first; `from` and `to` bound the creation time inclusively
    pub async fn get_transaction_history(
        &self,
        user_id: UserId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> ApiResponse<Vec<TransactionHistoryEntry>> {
        ApiResponse::from_result(
            self.history(user_id, from, to).await,
            "Transaction history retrieved successfully",
        )
    }

    pub async fn get_transaction_status(
        &self,
        user_id: UserId,
        reference: &str,
    ) -> ApiResponse<TransactionHistoryEntry> {
        ApiResponse::from_result(
            self.status(user_id, reference).await,
            "Transaction status retrieved successfully",
        )
    }

    /// Provision an account with a freshly drawn 10-digit number
    pub async fn open_account(
        &self,
        user_id: UserId,
        opening_balance: Decimal,
    ) -> ApiResponse<AccountDetails> {
        ApiResponse::from_result(
            self.open(user_id, opening_balance).await,
            "Account opened successfully",
        )
    }

    async fn account_for(&self, user_id: UserId) -> Result<Account, FundsError> {
        self.ledger
            .get_account_by_user(user_id)
            .await?
            .ok_or(FundsError::AccountNotFound)
    }

    async fn transfer(
        &self,
        user_id: UserId,
        request: TransferRequest,
    ) -> Result<TransactionReceipt, FundsError> {
        request
            .validate()
            .map_err(|e| FundsError::Validation(validation_messages(&e)))?;

        let account = self.account_for(user_id).await?;
        // Early answer only; the authoritative check is the reservation below
        if account.balance < request.amount {
            return Err(FundsError::InsufficientFunds);
        }
        let beneficiary = self
            .ledger
            .get_account_by_number(&request.beneficiary_account_number)
            .await?
            .ok_or(FundsError::BeneficiaryNotFound)?;
        if beneficiary.id == account.id {
            return Err(FundsError::SelfTransfer);
        }

        let tx = {
            let _guard = self.locks.lock(&[account.id]).await;
            let mut account = self
                .ledger
                .get_account(account.id)
                .await?
                .ok_or(FundsError::AccountNotFound)?;
            account.reserve(TransactionKind::Transfer, request.amount)?;
            let tx = Transaction::transfer(
                &account,
                request.amount,
                &request.beneficiary_account_number,
                &request.beneficiary_bank_name,
                request.description.clone(),
                self.clock.now(),
            );
            self.ledger
                .commit(LedgerChangeSet::new().account(account).insert(tx.clone()))
                .await?;
            tx
        };

        info!(
            user_id,
            reference = %tx.reference,
            amount = %tx.amount,
            beneficiary = %request.beneficiary_account_number,
            "Transfer reserved"
        );
        self.hand_off(&tx).await?;
        Ok(self.receipt(&tx, &account, &beneficiary.account_number, "Transfer processing"))
    }

    async fn deposit(
        &self,
        user_id: UserId,
        request: AddFundsRequest,
    ) -> Result<TransactionReceipt, FundsError> {
        request
            .validate()
            .map_err(|e| FundsError::Validation(validation_messages(&e)))?;

        let account = self.account_for(user_id).await?;
        let tx = {
            let _guard = self.locks.lock(&[account.id]).await;
            let mut account = self
                .ledger
                .get_account(account.id)
                .await?
                .ok_or(FundsError::AccountNotFound)?;
            account.reserve(TransactionKind::Deposit, request.amount)?;
            let tx = Transaction::deposit(
                &account,
                request.amount,
                &request.payment_method,
                self.clock.now(),
            );
            self.ledger
                .commit(LedgerChangeSet::new().account(account).insert(tx.clone()))
                .await?;
            tx
        };

        info!(
            user_id,
            reference = %tx.reference,
            amount = %tx.amount,
            payment_method = %request.payment_method,
            "Deposit reserved"
        );
        self.hand_off(&tx).await?;
        Ok(self.receipt(&tx, &account, &account.account_number, "Deposit processing"))
    }

    /// Queue the move into Pending; a transaction that cannot be queued is
    /// failed at once so its reservation does not linger
    async fn hand_off(&self, tx: &Transaction) -> Result<(), FundsError> {
        let enqueued = self
            .engine
            .enqueue(tx.id, SettlementStatus::Pending, Priority::Normal)
            .await;
        let Err(cause) = enqueued else {
            return Ok(());
        };

        warn!(
            reference = %tx.reference,
            error = %cause,
            "Enqueue failed, reversing reservation"
        );
        if let Err(e) = self
            .engine
            .processor()
            .fail_transaction(tx.id, ENQUEUE_FAILURE_REASON)
            .await
        {
            error!(reference = %tx.reference, error = %e, "Reversal after enqueue failure failed");
        }
        Err(cause.into())
    }

    fn receipt(
        &self,
        tx: &Transaction,
        originator: &Account,
        beneficiary_account_number: &str,
        description: &str,
    ) -> TransactionReceipt {
        TransactionReceipt {
            transaction_reference: tx.reference.clone(),
            response_code: "00".to_string(),
            response_description: description.to_string(),
            settlement_date: self.engine.policy().settlement_eta(tx.created_at),
            status: tx.status,
            amount: tx.amount,
            originator_account_number: originator.account_number.clone(),
            beneficiary_account_number: beneficiary_account_number.to_string(),
        }
    }

    async fn history(
        &self,
        user_id: UserId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<TransactionHistoryEntry>, FundsError> {
        if let (Some(from), Some(to)) = (from, to)
            && from > to
        {
            return Err(FundsError::Validation(vec![
                "Start date must not be after end date".to_string(),
            ]));
        }
        let account = self.account_for(user_id).await?;
        let transactions = self
            .ledger
            .transactions_for_account(account.id, from, to)
            .await?;
        Ok(transactions
            .iter()
            .map(|tx| TransactionHistoryEntry::new(tx, &account))
            .collect())
    }

    async fn status(
        &self,
        user_id: UserId,
        reference: &str,
    ) -> Result<TransactionHistoryEntry, FundsError> {
        let account = self.account_for(user_id).await?;
        match self.ledger.get_transaction_by_reference(reference).await? {
            Some(tx) if tx.account_id == account.id => {
                Ok(TransactionHistoryEntry::new(&tx, &account))
            }
            _ => Err(FundsError::TransactionNotFound),
        }
    }

    async fn open(
        &self,
        user_id: UserId,
        opening_balance: Decimal,
    ) -> Result<AccountDetails, FundsError> {
        if opening_balance < Decimal::ZERO {
            return Err(FundsError::Validation(vec![
                "Opening balance must not be negative".to_string(),
            ]));
        }
        let mut last = None;
        for _ in 0..ACCOUNT_NUMBER_ATTEMPTS {
            let account = Account::open(
                user_id,
                new_account_number(),
                opening_balance,
                self.clock.now(),
            );
            match self.ledger.add_account(account.clone()).await {
                Ok(()) => {
                    info!(user_id, account_number = %account.account_number, "Account opened");
                    return Ok(AccountDetails::from(&account));
                }
                Err(e @ LedgerError::DuplicateAccountNumber(_)) => last = Some(e),
                Err(e) => return Err(e.into()),
            }
        }
        Err(last
            .unwrap_or_else(|| LedgerError::Storage("no account number available".to_string()))
            .into())
    }
}

fn new_account_number() -> String {
    let n: u64 = rand::thread_rng().gen_range(1_000_000_000..=9_999_999_999);
    n.to_string()
}

fn log_failure(user_id: UserId, operation: &str, err: &FundsError) {
    match err {
        FundsError::Ledger(_) | FundsError::Queue(_) => {
            error!(user_id, operation, error = %err, "Funds request failed")
        }
        _ => info!(user_id, operation, error = %err, "Funds request rejected"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{QueueConfig, StageDelays};
    use crate::funds::types::EntryType;
    use crate::ledger::InMemoryLedger;
    use crate::queue::{
        FixedOutcome, InMemoryQueue, QueueRepository, SimulatedBank, StageProcessor,
    };

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    struct Harness {
        ledger: Arc<InMemoryLedger>,
        queue: Arc<InMemoryQueue>,
        engine: Arc<TransactionQueueEngine>,
        funds: FundsService,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::default());
        let ledger = Arc::new(InMemoryLedger::new());
        let queue = Arc::new(InMemoryQueue::new(clock.clone()));
        let processor = Arc::new(StageProcessor::new(
            ledger.clone(),
            Arc::new(SimulatedBank::instant(
                Arc::new(FixedOutcome(true)),
                clock.clone(),
            )),
            Arc::new(AccountLocks::new()),
            clock.clone(),
        ));
        let config = QueueConfig {
            stage_delays: StageDelays::immediate(),
            ..QueueConfig::default()
        };
        let engine = Arc::new(TransactionQueueEngine::new(
            queue.clone(),
            processor,
            &config,
            "node-funds",
            clock,
        ));
        Harness {
            ledger,
            queue,
            funds: FundsService::new(engine.clone()),
            engine,
        }
    }

    async fn open(h: &Harness, user_id: UserId, balance: &str) -> AccountDetails {
        h.funds.open_account(user_id, d(balance)).await.data.unwrap()
    }

    async fn settle_all(h: &Harness) {
        while h.engine.process_next_batch(10).await.unwrap().selected > 0 {}
    }

    fn transfer_to(number: &str, amount: &str) -> TransferRequest {
        TransferRequest {
            beneficiary_account_number: number.to_string(),
            beneficiary_bank_name: "Settlement Bank".to_string(),
            amount: d(amount),
            description: Some("rent".to_string()),
        }
    }

    #[tokio::test]
    async fn test_open_account() {
        let h = harness();
        let details = open(&h, 1, "1000.00").await;
        assert_eq!(details.account_number.len(), 10);
        assert!(details.account_number.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(details.available_to_spend, d("1000.00"));

        let again = h.funds.open_account(1, Decimal::ZERO).await;
        assert_eq!(again.status_code, 409);
    }

    #[tokio::test]
    async fn test_deposit_reserves_then_settles() {
        let h = harness();
        open(&h, 1, "1000.00").await;
        let resp = h
            .funds
            .add_funds(
                1,
                AddFundsRequest {
                    amount: d("500.00"),
                    payment_method: "card".to_string(),
                },
            )
            .await;
        assert!(resp.success);
        let receipt = resp.data.unwrap();
        assert_eq!(receipt.response_description, "Deposit processing");
        assert_eq!(receipt.status, SettlementStatus::Initiated);
        assert_eq!(receipt.originator_account_number, receipt.beneficiary_account_number);

        let details = h.funds.get_account_details(1).await.data.unwrap();
        assert_eq!(details.balance, d("1000.00"));
        assert_eq!(details.pending_balance, d("500.00"));
        assert_eq!(h.engine.get_queue_count().await.unwrap(), 1);

        settle_all(&h).await;
        let details = h.funds.get_account_details(1).await.data.unwrap();
        assert_eq!(details.balance, d("1500.00"));
        assert_eq!(details.pending_balance, Decimal::ZERO);

        let status = h
            .funds
            .get_transaction_status(1, &receipt.transaction_reference)
            .await
            .data
            .unwrap();
        assert_eq!(status.status, SettlementStatus::Completed);
    }

    #[tokio::test]
    async fn test_transfer_rejections() {
        let h = harness();
        let alice = open(&h, 1, "100.00").await;
        open(&h, 2, "0").await;

        let resp = h.funds.transfer_funds(9, transfer_to("0000000001", "1")).await;
        assert_eq!(resp.message, "Account not found");

        // generated numbers never start with 0
        let resp = h.funds.transfer_funds(1, transfer_to("0000000001", "1")).await;
        assert_eq!(resp.message, "Beneficiary account not found");
        assert_eq!(resp.status_code, 404);

        let resp = h
            .funds
            .transfer_funds(1, transfer_to(&alice.account_number, "1"))
            .await;
        assert_eq!(resp.message, "Cannot transfer to your own account");

        let bob = h.funds.get_account_details(2).await.data.unwrap();
        let resp = h
            .funds
            .transfer_funds(1, transfer_to(&bob.account_number, "100.01"))
            .await;
        assert_eq!(resp.message, "Insufficient funds");
        assert_eq!(resp.status_code, 422);

        let resp = h.funds.transfer_funds(1, transfer_to("12", "0")).await;
        assert_eq!(resp.status_code, 400);
        assert_eq!(resp.errors.map(|e| e.len()), Some(2));

        assert_eq!(h.engine.get_queue_count().await.unwrap(), 0);
        let alice = h.funds.get_account_details(1).await.data.unwrap();
        assert_eq!(alice.balance, d("100.00"));
    }

    #[tokio::test]
    async fn test_transfer_settles_both_sides() {
        let h = harness();
        open(&h, 1, "1000.00").await;
        let bob = open(&h, 2, "50.00").await;

        let receipt = h
            .funds
            .transfer_funds(1, transfer_to(&bob.account_number, "300.00"))
            .await
            .data
            .unwrap();
        let alice = h.funds.get_account_details(1).await.data.unwrap();
        assert_eq!(alice.balance, d("700.00"));
        assert_eq!(alice.pending_balance, d("300.00"));

        settle_all(&h).await;

        let alice = h.funds.get_account_details(1).await.data.unwrap();
        assert_eq!(alice.balance, d("700.00"));
        assert_eq!(alice.pending_balance, Decimal::ZERO);
        let bob_now = h.funds.get_account_details(2).await.data.unwrap();
        assert_eq!(bob_now.balance, d("350.00"));

        let sent = h.funds.get_transaction_history(1, None, None).await.data.unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].entry_type, EntryType::Sent);

        let received = h.funds.get_transaction_history(2, None, None).await.data.unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(
            received[0].transaction_reference,
            format!("{}-RCV", receipt.transaction_reference)
        );
        assert_eq!(received[0].entry_type, EntryType::Received);

        // Another user's reference is not visible
        let hidden = h
            .funds
            .get_transaction_status(2, &receipt.transaction_reference)
            .await;
        assert_eq!(hidden.message, "Transaction not found");
    }

    #[tokio::test]
    async fn test_enqueue_failure_reverses_reservation() {
        let h = harness();
        open(&h, 1, "1000.00").await;
        let bob = open(&h, 2, "0").await;

        let receipt = h
            .funds
            .transfer_funds(1, transfer_to(&bob.account_number, "10.00"))
            .await
            .data
            .unwrap();
        let tx = h
            .ledger
            .get_transaction_by_reference(&receipt.transaction_reference)
            .await
            .unwrap()
            .unwrap();
        let item = h.queue.get_unresolved(tx.id).await.unwrap().unwrap();
        h.queue.delete(item.id).await.unwrap();

        h.funds.hand_off(&tx).await.unwrap();
        // The slot is taken now, so a second hand-off is refused
        let err = h.funds.hand_off(&tx).await.unwrap_err();
        assert!(matches!(err, FundsError::Queue(_)));

        let stored = h.ledger.get_transaction(tx.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SettlementStatus::Failed);
        assert_eq!(stored.failure_reason.as_deref(), Some(ENQUEUE_FAILURE_REASON));
        let alice = h.funds.get_account_details(1).await.data.unwrap();
        assert_eq!(alice.balance, d("1000.00"));
        assert_eq!(alice.pending_balance, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_history_range_validation() {
        let h = harness();
        open(&h, 1, "1").await;
        let now = Utc::now();
        let resp = h
            .funds
            .get_transaction_history(1, Some(now), Some(now - chrono::Duration::days(1)))
            .await;
        assert_eq!(resp.status_code, 400);
    }
}
