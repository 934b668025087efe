//! In-memory ledger store
//!
//! Backs tests, the demo binary and single-process deployments. All state
//! sits behind one `RwLock`, so a commit is validated and applied under a
//! single write guard.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::error::LedgerError;
use super::models::{Account, Transaction};
use super::store::{LedgerChangeSet, LedgerStore};
use crate::core_types::{AccountId, TransactionId, UserId};

#[derive(Default)]
struct LedgerState {
    accounts: HashMap<AccountId, Account>,
    transactions: HashMap<TransactionId, Transaction>,
    by_reference: HashMap<String, TransactionId>,
}

#[derive(Default)]
pub struct InMemoryLedger {
    state: RwLock<LedgerState>,
    /// Commits still to reject (fault injection)
    failing_commits: AtomicUsize,
    commit_count: AtomicUsize,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail with a storage error without applying
    /// anything
    pub fn fail_next_commits(&self, n: usize) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }

    /// Number of successfully applied commits
    pub fn commit_count(&self) -> usize {
        self.commit_count.load(Ordering::SeqCst)
    }

    /// Snapshot of every account
    pub fn accounts(&self) -> Vec<Account> {
        match self.state.read() {
            Ok(state) => state.accounts.values().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().accounts.values().cloned().collect(),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, LedgerState>, LedgerError> {
        self.state
            .read()
            .map_err(|_| LedgerError::Storage("ledger lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, LedgerState>, LedgerError> {
        self.state
            .write()
            .map_err(|_| LedgerError::Storage("ledger lock poisoned".to_string()))
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn validate(state: &LedgerState, changes: &LedgerChangeSet) -> Result<(), LedgerError> {
    for account in &changes.accounts {
        let stored = state
            .accounts
            .get(&account.id)
            .ok_or(LedgerError::AccountNotFound(account.id))?;
        if stored.version != account.version {
            return Err(LedgerError::VersionConflict(account.id));
        }
    }

    for tx in &changes.new_transactions {
        if state.transactions.contains_key(&tx.id) || state.by_reference.contains_key(&tx.reference)
        {
            return Err(LedgerError::DuplicateReference(tx.reference.clone()));
        }
    }

    for tx in &changes.updated_transactions {
        let stored = state
            .transactions
            .get(&tx.id)
            .ok_or(LedgerError::TransactionNotFound(tx.id))?;
        if stored.is_terminal() && stored != tx {
            return Err(LedgerError::ImmutableTransaction(tx.id));
        }
    }

    Ok(())
}

#[async_trait]
impl LedgerStore for InMemoryLedger {
    async fn get_account(&self, id: AccountId) -> Result<Option<Account>, LedgerError> {
        Ok(self.read()?.accounts.get(&id).cloned())
    }

    async fn get_account_by_number(&self, number: &str) -> Result<Option<Account>, LedgerError> {
        Ok(self
            .read()?
            .accounts
            .values()
            .find(|a| a.account_number == number)
            .cloned())
    }

    async fn get_account_by_user(&self, user_id: UserId) -> Result<Option<Account>, LedgerError> {
        Ok(self
            .read()?
            .accounts
            .values()
            .find(|a| a.user_id == user_id)
            .cloned())
    }

    async fn add_account(&self, account: Account) -> Result<(), LedgerError> {
        let mut state = self.write()?;
        if state
            .accounts
            .values()
            .any(|a| a.account_number == account.account_number)
        {
            return Err(LedgerError::DuplicateAccountNumber(account.account_number));
        }
        if state.accounts.values().any(|a| a.user_id == account.user_id) {
            return Err(LedgerError::DuplicateOwner);
        }
        state.accounts.insert(account.id, account);
        Ok(())
    }

    async fn get_transaction(
        &self,
        id: TransactionId,
    ) -> Result<Option<Transaction>, LedgerError> {
        Ok(self.read()?.transactions.get(&id).cloned())
    }

    async fn get_transaction_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<Transaction>, LedgerError> {
        let state = self.read()?;
        Ok(state
            .by_reference
            .get(reference)
            .and_then(|id| state.transactions.get(id))
            .cloned())
    }

    async fn transactions_for_account(
        &self,
        account_id: AccountId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<Transaction>, LedgerError> {
        let state = self.read()?;
        let mut txs: Vec<Transaction> = state
            .transactions
            .values()
            .filter(|t| t.account_id == account_id)
            .filter(|t| from.is_none_or(|f| t.created_at >= f))
            .filter(|t| to.is_none_or(|e| t.created_at <= e))
            .cloned()
            .collect();
        txs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(txs)
    }

    async fn commit(&self, changes: LedgerChangeSet) -> Result<(), LedgerError> {
        if self.take_injected_failure() {
            return Err(LedgerError::Storage("injected commit failure".to_string()));
        }

        let mut state = self.write()?;
        validate(&state, &changes)?;

        let LedgerChangeSet {
            accounts,
            new_transactions,
            updated_transactions,
        } = changes;

        for mut account in accounts {
            account.version += 1;
            state.accounts.insert(account.id, account);
        }
        for tx in new_transactions {
            state.by_reference.insert(tx.reference.clone(), tx.id);
            state.transactions.insert(tx.id, tx);
        }
        for tx in updated_transactions {
            state.transactions.insert(tx.id, tx);
        }

        self.commit_count.fetch_add(1, Ordering::SeqCst);
        debug!("Ledger commit applied");
        Ok(())
    }
}
