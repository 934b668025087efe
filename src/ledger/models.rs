//! Ledger data models
//!
//! # Reconciliation policy
//!
//! Every funds movement follows one deferred path:
//!
//! ```text
//!              reserve            settle
//! authorize ───────────▶ pending ─────────▶ balance / beneficiary
//!                          │
//!                          └──── reverse ──▶ back where it came from
//! ```
//!
//! | kind     | reserve                        | settle                                  | reverse                          |
//! |----------|--------------------------------|-----------------------------------------|----------------------------------|
//! | Deposit  | pending += amt                 | pending -= amt, balance += amt          | pending -= amt                   |
//! | Transfer | balance -= amt, pending += amt | pending -= amt (beneficiary credited)   | pending -= amt, balance += amt   |
//!
//! The helpers on [`Account`] are the only code that touches balances.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::error::LedgerError;
use crate::core_types::{AccountId, TransactionId, UserId};
use crate::queue::state::SettlementStatus;

/// Kind of funds movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionKind {
    /// External money entering the owner's account
    Deposit,
    /// Money leaving the owner's account for a beneficiary account
    Transfer,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Deposit => "Deposit",
            TransactionKind::Transfer => "Transfer",
        }
    }

    fn reference_prefix(&self) -> &'static str {
        match self {
            TransactionKind::Deposit => "DEP",
            TransactionKind::Transfer => "TRX",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Ledger account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub user_id: UserId,
    pub account_number: String,
    /// Settled funds
    pub balance: Decimal,
    /// Reserved, not yet settled
    pub pending_balance: Decimal,
    /// Bumped by the store on every committed change
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn open(
        user_id: UserId,
        account_number: impl Into<String>,
        opening_balance: Decimal,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: AccountId::new(),
            user_id,
            account_number: account_number.into(),
            balance: opening_balance,
            pending_balance: Decimal::ZERO,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Settled plus in-flight funds
    pub fn total(&self) -> Decimal {
        self.balance + self.pending_balance
    }

    /// Authorization-time reservation
    pub fn reserve(&mut self, kind: TransactionKind, amount: Decimal) -> Result<(), LedgerError> {
        match kind {
            TransactionKind::Deposit => {
                self.pending_balance += amount;
            }
            TransactionKind::Transfer => {
                if self.balance < amount {
                    return Err(LedgerError::InsufficientFunds);
                }
                self.balance -= amount;
                self.pending_balance += amount;
            }
        }
        Ok(())
    }

    /// Resolve a reservation into settled funds.
    ///
    /// For transfers only the originator side is handled here; the
    /// beneficiary receives [`Account::credit`].
    pub fn settle(&mut self, kind: TransactionKind, amount: Decimal) -> Result<(), LedgerError> {
        self.release_pending(amount)?;
        if kind == TransactionKind::Deposit {
            self.balance += amount;
        }
        Ok(())
    }

    /// Undo a reservation
    pub fn reverse(&mut self, kind: TransactionKind, amount: Decimal) -> Result<(), LedgerError> {
        self.release_pending(amount)?;
        if kind == TransactionKind::Transfer {
            self.balance += amount;
        }
        Ok(())
    }

    /// Beneficiary side of a completed transfer
    pub fn credit(&mut self, amount: Decimal) {
        self.balance += amount;
    }

    fn release_pending(&mut self, amount: Decimal) -> Result<(), LedgerError> {
        if self.pending_balance < amount {
            return Err(LedgerError::NegativeBalance {
                account_id: self.id,
                field: "pending_balance",
            });
        }
        self.pending_balance -= amount;
        Ok(())
    }
}

/// Ledger transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub reference: String,
    pub account_id: AccountId,
    pub amount: Decimal,
    pub kind: TransactionKind,
    pub status: SettlementStatus,
    pub beneficiary_account_number: Option<String>,
    pub beneficiary_bank_name: Option<String>,
    pub description: Option<String>,

    // Per-stage timestamps
    pub initiated_at: DateTime<Utc>,
    pub pending_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,

    pub retry_count: u32,
    pub failure_reason: Option<String>,
    pub status_message: Option<String>,

    // Simulated bank response
    pub session_id: Option<String>,
    pub response_code: Option<String>,
    pub bank_reference: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    fn initiated(
        kind: TransactionKind,
        account_id: AccountId,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TransactionId::new(),
            reference: new_reference(kind, now),
            account_id,
            amount,
            kind,
            status: SettlementStatus::Initiated,
            beneficiary_account_number: None,
            beneficiary_bank_name: None,
            description: None,
            initiated_at: now,
            pending_at: None,
            sent_at: None,
            completed_at: None,
            failed_at: None,
            retry_count: 0,
            failure_reason: None,
            status_message: None,
            session_id: None,
            response_code: None,
            bank_reference: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// New deposit into `account`
    pub fn deposit(
        account: &Account,
        amount: Decimal,
        payment_method: &str,
        now: DateTime<Utc>,
    ) -> Self {
        let mut tx = Self::initiated(TransactionKind::Deposit, account.id, amount, now);
        tx.description = Some(format!("Deposit via {}", payment_method));
        tx
    }

    /// New transfer out of `account`
    pub fn transfer(
        account: &Account,
        amount: Decimal,
        beneficiary_account_number: &str,
        beneficiary_bank_name: &str,
        description: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut tx = Self::initiated(TransactionKind::Transfer, account.id, amount, now);
        tx.beneficiary_account_number = Some(beneficiary_account_number.to_string());
        tx.beneficiary_bank_name = Some(beneficiary_bank_name.to_string());
        tx.description = description;
        tx
    }

    /// Completed credit record kept on the beneficiary side of a transfer
    pub fn beneficiary_credit(&self, beneficiary: &Account, now: DateTime<Utc>) -> Self {
        Self {
            id: TransactionId::new(),
            reference: format!("{}-RCV", self.reference),
            account_id: beneficiary.id,
            amount: self.amount,
            kind: TransactionKind::Transfer,
            status: SettlementStatus::Completed,
            beneficiary_account_number: Some(beneficiary.account_number.clone()),
            beneficiary_bank_name: self.beneficiary_bank_name.clone(),
            description: Some(format!("Credit from transfer {}", self.reference)),
            initiated_at: now,
            pending_at: None,
            sent_at: None,
            completed_at: Some(now),
            failed_at: None,
            retry_count: 0,
            failure_reason: None,
            status_message: Some("Transfer received".to_string()),
            session_id: self.session_id.clone(),
            response_code: Some("00".to_string()),
            bank_reference: self.bank_reference.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

fn new_reference(kind: TransactionKind, now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}-{}",
        kind.reference_prefix(),
        now.format("%Y%m%d"),
        &suffix[..8]
    )
}
