//! Ledger store contract
//!
//! Reads are plain lookups. Every write goes through [`LedgerStore::commit`],
//! which applies a whole [`LedgerChangeSet`] or nothing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::LedgerError;
use super::models::{Account, Transaction};
use crate::core_types::{AccountId, TransactionId, UserId};

/// Unit of work applied atomically by [`LedgerStore::commit`]
///
/// Accounts carry the `version` they were read at; the store rejects the
/// whole set with [`LedgerError::VersionConflict`] if any of them moved.
#[derive(Debug, Default, Clone)]
pub struct LedgerChangeSet {
    pub accounts: Vec<Account>,
    pub new_transactions: Vec<Transaction>,
    pub updated_transactions: Vec<Transaction>,
}

impl LedgerChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn account(mut self, account: Account) -> Self {
        self.accounts.push(account);
        self
    }

    pub fn insert(mut self, tx: Transaction) -> Self {
        self.new_transactions.push(tx);
        self
    }

    pub fn update(mut self, tx: Transaction) -> Self {
        self.updated_transactions.push(tx);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
            && self.new_transactions.is_empty()
            && self.updated_transactions.is_empty()
    }
}

/// Accounts and transactions
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn get_account(&self, id: AccountId) -> Result<Option<Account>, LedgerError>;

    async fn get_account_by_number(&self, number: &str) -> Result<Option<Account>, LedgerError>;

    async fn get_account_by_user(&self, user_id: UserId) -> Result<Option<Account>, LedgerError>;

    /// Insert a freshly opened account (unique number, one per user)
    async fn add_account(&self, account: Account) -> Result<(), LedgerError>;

    async fn get_transaction(&self, id: TransactionId)
    -> Result<Option<Transaction>, LedgerError>;

    async fn get_transaction_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<Transaction>, LedgerError>;

    /// Transactions booked on `account_id`, newest first, optionally bounded
    /// by creation time (inclusive)
    async fn transactions_for_account(
        &self,
        account_id: AccountId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<Transaction>, LedgerError>;

    /// Apply the change set atomically
    async fn commit(&self, changes: LedgerChangeSet) -> Result<(), LedgerError>;
}
