//! Queue item and classification types

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::state::SettlementStatus;
use crate::core_types::{QueueItemId, TransactionId};

/// Scheduling priority
///
/// Selection orders by the numeric value ascending, so `Normal` items are
/// served before `High` and `Urgent` ones scheduled at the same time.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum Priority {
    #[default]
    Normal = 1,
    High = 2,
    Urgent = 3,
}

impl Priority {
    #[inline]
    pub fn value(&self) -> u8 {
        *self as u8
    }

    pub fn from_value(value: u8) -> Option<Self> {
        match value {
            1 => Some(Priority::Normal),
            2 => Some(Priority::High),
            3 => Some(Priority::Urgent),
            _ => None,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::Normal => "Normal",
            Priority::High => "High",
            Priority::Urgent => "Urgent",
        };
        write!(f, "{}", name)
    }
}

/// Lane derived from the transaction amount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueType {
    Standard,
    Priority,
    Express,
}

impl QueueType {
    /// Above 1,000,000 → Express, above 100,000 → Priority
    pub fn from_amount(amount: Decimal) -> Self {
        if amount > Decimal::from(1_000_000) {
            QueueType::Express
        } else if amount > Decimal::from(100_000) {
            QueueType::Priority
        } else {
            QueueType::Standard
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueType::Standard => "Standard",
            QueueType::Priority => "Priority",
            QueueType::Express => "Express",
        }
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Scheduled request to advance one transaction by one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: QueueItemId,
    pub transaction_id: TransactionId,
    /// Transaction status when the item was enqueued
    pub current_status: SettlementStatus,
    /// Stage this item moves the transaction into
    pub next_status: SettlementStatus,
    pub scheduled_process_time: DateTime<Utc>,
    pub priority: Priority,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Claim flag
    pub is_processing: bool,
    /// Node holding the claim
    pub processing_node: Option<String>,
    pub queue_type: QueueType,
    pub error_message: Option<String>,
    /// Set once the item is resolved
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueItem {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transaction_id: TransactionId,
        current_status: SettlementStatus,
        next_status: SettlementStatus,
        scheduled_process_time: DateTime<Utc>,
        priority: Priority,
        max_retries: u32,
        queue_type: QueueType,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: QueueItemId::new(),
            transaction_id,
            current_status,
            next_status,
            scheduled_process_time,
            priority,
            retry_count: 0,
            max_retries,
            is_processing: false,
            processing_node: None,
            queue_type,
            error_message: None,
            processed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[inline]
    pub fn is_resolved(&self) -> bool {
        self.processed_at.is_some()
    }

    #[inline]
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Eligible for selection by a batch at `now`
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        !self.is_processing
            && !self.is_resolved()
            && self.scheduled_process_time <= now
            && !self.retries_exhausted()
    }

    /// Drop the claim
    pub fn clear_claim(&mut self) {
        self.is_processing = false;
        self.processing_node = None;
    }
}
