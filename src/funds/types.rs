//! Request and response types for the funds entry points

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError, ValidationErrors};

use crate::core_types::UserId;
use crate::ledger::{Account, Transaction, TransactionKind};
use crate::queue::SettlementStatus;

/// Amounts carry at most cent precision
pub const AMOUNT_SCALE: u32 = 2;

/// Outgoing transfer to another account in the ledger
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    #[validate(custom(function = "validate_account_number"))]
    pub beneficiary_account_number: String,
    #[validate(custom(function = "validate_bank_name"))]
    pub beneficiary_bank_name: String,
    #[validate(custom(function = "validate_amount"))]
    pub amount: Decimal,
    #[validate(length(max = 250, message = "Description must be 250 characters or fewer"))]
    pub description: Option<String>,
}

/// External money entering the caller's own account
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AddFundsRequest {
    #[validate(custom(function = "validate_amount"))]
    pub amount: Decimal,
    #[validate(custom(function = "validate_payment_method"))]
    pub payment_method: String,
}

fn rule(code: &'static str, message: &'static str) -> ValidationError {
    let mut err = ValidationError::new(code);
    err.message = Some(Cow::Borrowed(message));
    err
}

fn validate_amount(amount: &Decimal) -> Result<(), ValidationError> {
    if *amount <= Decimal::ZERO {
        return Err(rule("amount", "Amount must be greater than zero"));
    }
    if amount.normalize().scale() > AMOUNT_SCALE {
        return Err(rule(
            "amount_precision",
            "Amount must have at most 2 decimal places",
        ));
    }
    Ok(())
}

fn validate_account_number(number: &str) -> Result<(), ValidationError> {
    if number.trim().is_empty() {
        return Err(rule(
            "account_number",
            "Beneficiary account number is required",
        ));
    }
    let digits = number.len();
    if !(8..=20).contains(&digits) || !number.chars().all(|c| c.is_ascii_digit()) {
        return Err(rule(
            "account_number_format",
            "Beneficiary account number must be numeric and between 8 and 20 digits",
        ));
    }
    Ok(())
}

fn validate_bank_name(name: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        return Err(rule("bank_name", "Beneficiary bank name is required"));
    }
    if name.chars().count() > 100 {
        return Err(rule(
            "bank_name_length",
            "Bank name must be 100 characters or fewer",
        ));
    }
    Ok(())
}

fn validate_payment_method(method: &str) -> Result<(), ValidationError> {
    if method.trim().is_empty() {
        return Err(rule("payment_method", "Payment method is required"));
    }
    if method.chars().count() > 100 {
        return Err(rule(
            "payment_method_length",
            "Payment method must be 100 characters or fewer",
        ));
    }
    Ok(())
}

/// Flatten validator output into the envelope's message list, ordered by
/// field name
pub fn validation_messages(errors: &ValidationErrors) -> Vec<String> {
    let mut fields: Vec<_> = errors.field_errors().into_iter().collect();
    fields.sort_by(|a, b| a.0.cmp(&b.0));
    fields
        .into_iter()
        .flat_map(|(field, errs)| {
            errs.iter()
                .map(|e| match &e.message {
                    Some(message) => message.to_string(),
                    None => format!("{} is invalid", field),
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Acknowledgement returned once a movement is reserved and queued
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReceipt {
    pub transaction_reference: String,
    pub response_code: String,
    pub response_description: String,
    /// Earliest time the queue can complete the movement
    pub settlement_date: DateTime<Utc>,
    pub status: SettlementStatus,
    pub amount: Decimal,
    pub originator_account_number: String,
    pub beneficiary_account_number: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountDetails {
    pub user_id: UserId,
    pub account_number: String,
    pub balance: Decimal,
    pub pending_balance: Decimal,
    /// Settled funds; reservations are already deducted from `balance`
    pub available_to_spend: Decimal,
}

impl From<&Account> for AccountDetails {
    fn from(account: &Account) -> Self {
        Self {
            user_id: account.user_id,
            account_number: account.account_number.clone(),
            balance: account.balance,
            pending_balance: account.pending_balance,
            available_to_spend: account.balance,
        }
    }
}

/// Direction of a history entry from the viewing account's side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EntryType {
    Sent,
    Received,
}

impl EntryType {
    /// Deposits and `-RCV` credit records read as Received, the originator
    /// side of a transfer as Sent
    pub fn classify(tx: &Transaction, viewer: &Account) -> Self {
        match tx.kind {
            TransactionKind::Deposit => EntryType::Received,
            TransactionKind::Transfer => {
                let to_viewer = tx.beneficiary_account_number.as_deref()
                    == Some(viewer.account_number.as_str());
                if to_viewer { EntryType::Received } else { EntryType::Sent }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionHistoryEntry {
    pub transaction_reference: String,
    pub date: DateTime<Utc>,
    pub amount: Decimal,
    #[serde(rename = "type")]
    pub kind: TransactionKind,
    pub status: SettlementStatus,
    pub status_message: Option<String>,
    /// Latest retry count recorded by the settlement queue
    pub retry_count: u32,
    pub failure_reason: Option<String>,
    pub beneficiary_account_number: Option<String>,
    pub beneficiary_bank_name: Option<String>,
    pub description: Option<String>,
    pub entry_type: EntryType,
}

impl TransactionHistoryEntry {
    pub fn new(tx: &Transaction, viewer: &Account) -> Self {
        Self {
            transaction_reference: tx.reference.clone(),
            date: tx.created_at,
            amount: tx.amount,
            kind: tx.kind,
            status: tx.status,
            status_message: tx.status_message.clone(),
            retry_count: tx.retry_count,
            failure_reason: tx.failure_reason.clone(),
            beneficiary_account_number: tx.beneficiary_account_number.clone(),
            beneficiary_bank_name: tx.beneficiary_bank_name.clone(),
            description: tx.description.clone(),
            entry_type: EntryType::classify(tx, viewer),
        }
    }
}
