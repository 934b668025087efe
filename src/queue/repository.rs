//! Queue repository contract
//!
//! Each method is its own unit of work. The methods that coordinate workers
//! ([`QueueRepository::try_claim`], [`QueueRepository::resolve`],
//! [`QueueRepository::release`], [`QueueRepository::release_stale`] and
//! [`QueueRepository::reset_for_retry`]) must be implemented as conditional
//! updates so that concurrent callers observe exactly one winner.
//!
//! A claimed item is only ever written back through `resolve` or `release`,
//! both of which check the claim tag first.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use super::error::QueueError;
use super::types::QueueItem;
use crate::core_types::{QueueItemId, TransactionId};

#[async_trait]
pub trait QueueRepository: Send + Sync {
    /// Insert a new item
    ///
    /// Fails with [`QueueError::AlreadyQueued`] when the transaction already
    /// has an unresolved item.
    async fn add(&self, item: QueueItem) -> Result<(), QueueError>;

    /// Overwrite an existing item, stamping `updated_at`
    ///
    /// Unconditional; not for items a worker may hold.
    async fn update(&self, item: QueueItem) -> Result<(), QueueError>;

    async fn delete(&self, id: QueueItemId) -> Result<(), QueueError>;

    async fn get(&self, id: QueueItemId) -> Result<Option<QueueItem>, QueueError>;

    /// Latest item for the transaction
    ///
    /// The unresolved item wins; among resolved ones the latest by creation
    /// time, then resolution time, then stage.
    async fn get_by_transaction_id(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Option<QueueItem>, QueueError>;

    /// The single unresolved item for the transaction, if any
    async fn get_unresolved(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Option<QueueItem>, QueueError>;

    /// Claimable items at `now`, ordered by priority then creation time
    async fn get_pending_items(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueItem>, QueueError>;

    /// Claimed items whose `updated_at` is older than `now - timeout`
    async fn get_stuck_items(
        &self,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueItem>, QueueError>;

    /// Unresolved, unclaimed items that ran out of attempts
    async fn get_exhausted_items(&self, limit: usize) -> Result<Vec<QueueItem>, QueueError>;

    async fn count_unresolved(&self) -> Result<usize, QueueError>;

    /// Atomically tag the item with `holder` if it is unclaimed and unresolved
    ///
    /// The tag lands in `processing_node`. Returns the claimed item, or
    /// [`QueueError::ConcurrencyConflict`] if another worker holds it or it
    /// is already resolved.
    async fn try_claim(
        &self,
        id: QueueItemId,
        holder: &str,
        now: DateTime<Utc>,
    ) -> Result<QueueItem, QueueError>;

    /// Atomically resolve a claimed item and insert its successor
    ///
    /// Fails with [`QueueError::ConcurrencyConflict`] when `holder` no longer
    /// holds the claim; nothing is written in that case.
    async fn resolve(
        &self,
        id: QueueItemId,
        holder: &str,
        now: DateTime<Utc>,
        successor: Option<QueueItem>,
    ) -> Result<(), QueueError>;

    /// Write back a claimed item and drop the claim
    ///
    /// `item` carries the holder's changes; a set `processed_at` resolves it.
    /// Fails with [`QueueError::ConcurrencyConflict`] when `holder` no longer
    /// holds the claim; nothing is written in that case.
    async fn release(&self, item: QueueItem, holder: &str) -> Result<(), QueueError>;

    /// Drop a claim last touched before `cutoff`
    ///
    /// Returns `false`, writing nothing, when the item was resolved, released
    /// or re-claimed since it was read.
    async fn release_stale(
        &self,
        id: QueueItemId,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, QueueError>;

    /// Make an unclaimed item due at `now` with a fresh retry budget
    ///
    /// Reopens a resolved item. Fails with [`QueueError::ConcurrencyConflict`]
    /// while the item is claimed and [`QueueError::AlreadyQueued`] when
    /// another item of the transaction is unresolved.
    async fn reset_for_retry(
        &self,
        id: QueueItemId,
        now: DateTime<Utc>,
    ) -> Result<QueueItem, QueueError>;
}
