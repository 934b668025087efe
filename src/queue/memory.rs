//! In-memory queue repository

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::trace;

use super::error::QueueError;
use super::repository::QueueRepository;
use super::state::SettlementStatus;
use super::types::QueueItem;
use crate::clock::{Clock, SystemClock};
use crate::core_types::{QueueItemId, TransactionId};

/// Mutex-guarded map of queue items
///
/// Every operation runs under the single lock, which gives the claim
/// operations their compare-and-set semantics.
pub struct InMemoryQueue {
    items: Mutex<HashMap<QueueItemId, QueueItem>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl InMemoryQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Every stored item, unordered
    pub fn snapshot(&self) -> Vec<QueueItem> {
        match self.items.lock() {
            Ok(items) => items.values().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().values().cloned().collect(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<QueueItemId, QueueItem>>, QueueError> {
        self.items
            .lock()
            .map_err(|_| QueueError::Storage("queue lock poisoned".to_string()))
    }
}

fn held_by(item: &QueueItem, holder: &str) -> bool {
    item.is_processing && !item.is_resolved() && item.processing_node.as_deref() == Some(holder)
}

/// Ordering for "latest item of a transaction"
fn recency(item: &QueueItem) -> (bool, DateTime<Utc>, Option<DateTime<Utc>>, SettlementStatus) {
    (
        !item.is_resolved(),
        item.created_at,
        item.processed_at,
        item.next_status,
    )
}

fn has_other_unresolved(
    items: &HashMap<QueueItemId, QueueItem>,
    transaction_id: TransactionId,
    except: QueueItemId,
) -> bool {
    items
        .values()
        .any(|i| i.transaction_id == transaction_id && i.id != except && !i.is_resolved())
}

#[async_trait]
impl QueueRepository for InMemoryQueue {
    async fn add(&self, mut item: QueueItem) -> Result<(), QueueError> {
        let mut items = self.lock()?;
        if !item.is_resolved() && has_other_unresolved(&items, item.transaction_id, item.id) {
            return Err(QueueError::AlreadyQueued);
        }
        item.updated_at = self.clock.now();
        items.insert(item.id, item);
        Ok(())
    }

    async fn update(&self, mut item: QueueItem) -> Result<(), QueueError> {
        let mut items = self.lock()?;
        if !items.contains_key(&item.id) {
            return Err(QueueError::NotFound(format!("queue item {}", item.id)));
        }
        if !item.is_resolved() && has_other_unresolved(&items, item.transaction_id, item.id) {
            return Err(QueueError::AlreadyQueued);
        }
        item.updated_at = self.clock.now();
        items.insert(item.id, item);
        Ok(())
    }

    async fn delete(&self, id: QueueItemId) -> Result<(), QueueError> {
        self.lock()?
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| QueueError::NotFound(format!("queue item {}", id)))
    }

    async fn get(&self, id: QueueItemId) -> Result<Option<QueueItem>, QueueError> {
        Ok(self.lock()?.get(&id).cloned())
    }

    async fn get_by_transaction_id(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Option<QueueItem>, QueueError> {
        Ok(self
            .lock()?
            .values()
            .filter(|i| i.transaction_id == transaction_id)
            .max_by_key(|i| recency(i))
            .cloned())
    }

    async fn get_unresolved(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Option<QueueItem>, QueueError> {
        Ok(self
            .lock()?
            .values()
            .find(|i| i.transaction_id == transaction_id && !i.is_resolved())
            .cloned())
    }

    async fn get_pending_items(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueItem>, QueueError> {
        let items = self.lock()?;
        let mut due: Vec<QueueItem> = items
            .values()
            .filter(|i| i.is_claimable(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        due.truncate(limit);
        Ok(due)
    }

    async fn get_stuck_items(
        &self,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueItem>, QueueError> {
        let cutoff = now - timeout;
        Ok(self
            .lock()?
            .values()
            .filter(|i| i.is_processing && !i.is_resolved() && i.updated_at < cutoff)
            .cloned()
            .collect())
    }

    async fn get_exhausted_items(&self, limit: usize) -> Result<Vec<QueueItem>, QueueError> {
        Ok(self
            .lock()?
            .values()
            .filter(|i| !i.is_processing && !i.is_resolved() && i.retries_exhausted())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count_unresolved(&self) -> Result<usize, QueueError> {
        Ok(self.lock()?.values().filter(|i| !i.is_resolved()).count())
    }

    async fn try_claim(
        &self,
        id: QueueItemId,
        holder: &str,
        now: DateTime<Utc>,
    ) -> Result<QueueItem, QueueError> {
        let mut items = self.lock()?;
        let item = items
            .get_mut(&id)
            .ok_or_else(|| QueueError::NotFound(format!("queue item {}", id)))?;
        if item.is_processing || item.is_resolved() {
            trace!(item_id = %id, holder, "Claim lost");
            return Err(QueueError::ConcurrencyConflict);
        }
        item.is_processing = true;
        item.processing_node = Some(holder.to_string());
        item.updated_at = now;
        Ok(item.clone())
    }

    async fn resolve(
        &self,
        id: QueueItemId,
        holder: &str,
        now: DateTime<Utc>,
        successor: Option<QueueItem>,
    ) -> Result<(), QueueError> {
        let mut items = self.lock()?;
        let item = items
            .get(&id)
            .ok_or_else(|| QueueError::NotFound(format!("queue item {}", id)))?;
        if !held_by(item, holder) {
            return Err(QueueError::ConcurrencyConflict);
        }
        if let Some(next) = &successor
            && has_other_unresolved(&items, next.transaction_id, id)
        {
            return Err(QueueError::AlreadyQueued);
        }

        if let Some(item) = items.get_mut(&id) {
            item.processed_at = Some(now);
            item.clear_claim();
            item.updated_at = now;
        }
        if let Some(mut next) = successor {
            next.updated_at = now;
            items.insert(next.id, next);
        }
        Ok(())
    }

    async fn release(&self, mut item: QueueItem, holder: &str) -> Result<(), QueueError> {
        let mut items = self.lock()?;
        let stored = items
            .get(&item.id)
            .ok_or_else(|| QueueError::NotFound(format!("queue item {}", item.id)))?;
        if !held_by(stored, holder) {
            trace!(item_id = %item.id, holder, "Release refused, claim no longer held");
            return Err(QueueError::ConcurrencyConflict);
        }
        item.clear_claim();
        item.updated_at = self.clock.now();
        items.insert(item.id, item);
        Ok(())
    }

    async fn release_stale(
        &self,
        id: QueueItemId,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        let mut items = self.lock()?;
        let now = self.clock.now();
        let item = items
            .get_mut(&id)
            .ok_or_else(|| QueueError::NotFound(format!("queue item {}", id)))?;
        if !item.is_processing || item.is_resolved() || item.updated_at >= cutoff {
            return Ok(false);
        }
        item.clear_claim();
        item.updated_at = now;
        Ok(true)
    }

    async fn reset_for_retry(
        &self,
        id: QueueItemId,
        now: DateTime<Utc>,
    ) -> Result<QueueItem, QueueError> {
        let mut items = self.lock()?;
        let item = items
            .get(&id)
            .ok_or_else(|| QueueError::NotFound(format!("queue item {}", id)))?;
        if item.is_processing {
            return Err(QueueError::ConcurrencyConflict);
        }
        if has_other_unresolved(&items, item.transaction_id, id) {
            return Err(QueueError::AlreadyQueued);
        }

        let item = items
            .get_mut(&id)
            .ok_or_else(|| QueueError::NotFound(format!("queue item {}", id)))?;
        item.retry_count = 0;
        item.processed_at = None;
        item.error_message = None;
        item.scheduled_process_time = now;
        item.updated_at = now;
        Ok(item.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::queue::types::{Priority, QueueType};

    fn item(tx: TransactionId, priority: Priority, at: DateTime<Utc>) -> QueueItem {
        QueueItem::new(
            tx,
            SettlementStatus::Initiated,
            SettlementStatus::Pending,
            at,
            priority,
            3,
            QueueType::Standard,
            at,
        )
    }

    #[tokio::test]
    async fn test_one_unresolved_item_per_transaction() {
        let queue = InMemoryQueue::default();
        let tx = TransactionId::new();
        let now = Utc::now();
        queue.add(item(tx, Priority::Normal, now)).await.unwrap();
        assert_eq!(
            queue.add(item(tx, Priority::Normal, now)).await,
            Err(QueueError::AlreadyQueued)
        );
        assert_eq!(queue.count_unresolved().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_pending_items_ordering_and_limit() {
        let queue = InMemoryQueue::default();
        let t0 = Utc::now() - Duration::minutes(10);

        let late_normal = item(TransactionId::new(), Priority::Normal, t0 + Duration::seconds(5));
        let early_normal = item(TransactionId::new(), Priority::Normal, t0);
        let urgent = item(TransactionId::new(), Priority::Urgent, t0 - Duration::seconds(5));
        let mut future = item(TransactionId::new(), Priority::Normal, t0);
        future.scheduled_process_time = Utc::now() + Duration::hours(1);

        for it in [&late_normal, &early_normal, &urgent, &future] {
            queue.add(it.clone()).await.unwrap();
        }

        let due = queue.get_pending_items(10, Utc::now()).await.unwrap();
        let ids: Vec<_> = due.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![early_normal.id, late_normal.id, urgent.id]);

        let limited = queue.get_pending_items(1, Utc::now()).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, early_normal.id);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let queue = InMemoryQueue::default();
        let it = item(TransactionId::new(), Priority::Normal, Utc::now());
        queue.add(it.clone()).await.unwrap();

        let claimed = queue.try_claim(it.id, "node-a", Utc::now()).await.unwrap();
        assert!(claimed.is_processing);
        assert_eq!(claimed.processing_node.as_deref(), Some("node-a"));

        assert_eq!(
            queue.try_claim(it.id, "node-b", Utc::now()).await,
            Err(QueueError::ConcurrencyConflict)
        );
        assert!(queue.get_pending_items(10, Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_requires_claim_holder() {
        let queue = InMemoryQueue::default();
        let tx = TransactionId::new();
        let now = Utc::now();
        let it = item(tx, Priority::Normal, now);
        queue.add(it.clone()).await.unwrap();
        queue.try_claim(it.id, "node-a", now).await.unwrap();

        let mut successor = item(tx, Priority::Normal, now);
        successor.current_status = SettlementStatus::Pending;
        successor.next_status = SettlementStatus::Sent;

        assert_eq!(
            queue
                .resolve(it.id, "node-b", now, Some(successor.clone()))
                .await,
            Err(QueueError::ConcurrencyConflict)
        );
        assert!(queue.get(successor.id).await.unwrap().is_none());

        queue
            .resolve(it.id, "node-a", now, Some(successor.clone()))
            .await
            .unwrap();
        let resolved = queue.get(it.id).await.unwrap().unwrap();
        assert_eq!(resolved.processed_at, Some(now));
        assert!(!resolved.is_processing);

        let unresolved = queue.get_unresolved(tx).await.unwrap().unwrap();
        assert_eq!(unresolved.id, successor.id);
        assert_eq!(queue.count_unresolved().await.unwrap(), 1);

        // resolving twice is rejected
        assert_eq!(
            queue.resolve(it.id, "node-a", now, None).await,
            Err(QueueError::ConcurrencyConflict)
        );
    }

    #[tokio::test]
    async fn test_release_after_reclaim_keeps_live_claim() {
        let clock = Arc::new(ManualClock::default());
        let queue = InMemoryQueue::new(clock.clone());
        let it = item(TransactionId::new(), Priority::Normal, clock.now());
        queue.add(it.clone()).await.unwrap();

        // node-a claims, stalls, and its claim is swept
        let mut stale = queue.try_claim(it.id, "node-a", clock.now()).await.unwrap();
        clock.advance(Duration::minutes(6));
        assert!(queue.release_stale(it.id, clock.now() - Duration::minutes(5)).await.unwrap());
        queue.try_claim(it.id, "node-b", clock.now()).await.unwrap();

        // node-a wakes up and tries to record its failure
        stale.retry_count += 1;
        stale.error_message = Some("declined".to_string());
        assert_eq!(
            queue.release(stale, "node-a").await,
            Err(QueueError::ConcurrencyConflict)
        );

        let stored = queue.get(it.id).await.unwrap().unwrap();
        assert!(stored.is_processing);
        assert_eq!(stored.processing_node.as_deref(), Some("node-b"));
        assert_eq!(stored.retry_count, 0);
        assert_eq!(
            queue.try_claim(it.id, "node-c", clock.now()).await,
            Err(QueueError::ConcurrencyConflict)
        );

        // The live holder can still write back
        let mut live = stored.clone();
        live.retry_count = 1;
        queue.release(live, "node-b").await.unwrap();
        let stored = queue.get(it.id).await.unwrap().unwrap();
        assert!(!stored.is_processing);
        assert_eq!(stored.retry_count, 1);
    }

    #[tokio::test]
    async fn test_release_stale_skips_resolved_item() {
        let clock = Arc::new(ManualClock::default());
        let queue = InMemoryQueue::new(clock.clone());
        let it = item(TransactionId::new(), Priority::Normal, clock.now());
        queue.add(it.clone()).await.unwrap();
        queue.try_claim(it.id, "node-a", clock.now()).await.unwrap();

        clock.advance(Duration::minutes(6));
        let timeout = Duration::minutes(5);
        let stuck = queue.get_stuck_items(timeout, clock.now()).await.unwrap();
        assert_eq!(stuck.len(), 1);

        // The slow worker finishes between the sweep's read and its release
        queue.resolve(it.id, "node-a", clock.now(), None).await.unwrap();
        assert!(!queue.release_stale(stuck[0].id, clock.now() - timeout).await.unwrap());

        let stored = queue.get(it.id).await.unwrap().unwrap();
        assert!(stored.is_resolved());
        assert_eq!(queue.count_unresolved().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_release_stale_skips_fresh_claim() {
        let clock = Arc::new(ManualClock::default());
        let queue = InMemoryQueue::new(clock.clone());
        let it = item(TransactionId::new(), Priority::Normal, clock.now());
        queue.add(it.clone()).await.unwrap();
        let cutoff = clock.now();
        queue.try_claim(it.id, "node-a", clock.now()).await.unwrap();

        assert!(!queue.release_stale(it.id, cutoff).await.unwrap());
        assert!(queue.get(it.id).await.unwrap().unwrap().is_processing);
    }

    #[tokio::test]
    async fn test_latest_item_prefers_unresolved_then_later_stage() {
        let queue = InMemoryQueue::default();
        let tx = TransactionId::new();
        let now = Utc::now();

        // Every stage item created at the same instant
        let first = item(tx, Priority::Normal, now);
        queue.add(first.clone()).await.unwrap();
        queue.try_claim(first.id, "node-a", now).await.unwrap();
        let mut second = item(tx, Priority::Normal, now);
        second.current_status = SettlementStatus::Pending;
        second.next_status = SettlementStatus::Sent;
        queue
            .resolve(first.id, "node-a", now, Some(second.clone()))
            .await
            .unwrap();

        for _ in 0..10 {
            let latest = queue.get_by_transaction_id(tx).await.unwrap().unwrap();
            assert_eq!(latest.id, second.id);
        }

        queue.try_claim(second.id, "node-a", now).await.unwrap();
        queue.resolve(second.id, "node-a", now, None).await.unwrap();
        for _ in 0..10 {
            let latest = queue.get_by_transaction_id(tx).await.unwrap().unwrap();
            assert_eq!(latest.id, second.id);
        }
    }

    #[tokio::test]
    async fn test_reset_for_retry() {
        let clock = Arc::new(ManualClock::default());
        let queue = InMemoryQueue::new(clock.clone());
        let tx = TransactionId::new();
        let mut it = item(tx, Priority::Normal, clock.now());
        it.retry_count = 2;
        it.error_message = Some("declined".to_string());
        it.scheduled_process_time = clock.now() + Duration::minutes(2);
        queue.add(it.clone()).await.unwrap();

        queue.try_claim(it.id, "node-a", clock.now()).await.unwrap();
        assert_eq!(
            queue.reset_for_retry(it.id, clock.now()).await,
            Err(QueueError::ConcurrencyConflict)
        );
        queue.resolve(it.id, "node-a", clock.now(), None).await.unwrap();

        // A resolved item is reopened
        clock.advance(Duration::seconds(5));
        let reset = queue.reset_for_retry(it.id, clock.now()).await.unwrap();
        assert_eq!(reset.retry_count, 0);
        assert!(reset.error_message.is_none());
        assert!(!reset.is_resolved());
        assert_eq!(reset.scheduled_process_time, clock.now());
        assert_eq!(queue.get_pending_items(10, clock.now()).await.unwrap().len(), 1);

        // Not while a newer item is unresolved
        queue.try_claim(it.id, "node-a", clock.now()).await.unwrap();
        let successor = item(tx, Priority::Normal, clock.now());
        queue
            .resolve(it.id, "node-a", clock.now(), Some(successor))
            .await
            .unwrap();
        assert_eq!(
            queue.reset_for_retry(it.id, clock.now()).await,
            Err(QueueError::AlreadyQueued)
        );
    }

    #[tokio::test]
    async fn test_stuck_items_by_updated_at() {
        let clock = Arc::new(ManualClock::default());
        let queue = InMemoryQueue::new(clock.clone());
        let start = clock.now();

        let it = item(TransactionId::new(), Priority::Normal, start);
        queue.add(it.clone()).await.unwrap();
        queue.try_claim(it.id, "node-a", start).await.unwrap();

        let timeout = Duration::minutes(5);
        assert!(queue.get_stuck_items(timeout, start).await.unwrap().is_empty());

        let later = start + Duration::minutes(6);
        let stuck = queue.get_stuck_items(timeout, later).await.unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].id, it.id);
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let clock = Arc::new(ManualClock::default());
        let queue = InMemoryQueue::new(clock.clone());
        let mut it = item(TransactionId::new(), Priority::Normal, clock.now());
        queue.add(it.clone()).await.unwrap();

        clock.advance(Duration::seconds(30));
        it.error_message = Some("declined".to_string());
        queue.update(it.clone()).await.unwrap();
        let stored = queue.get(it.id).await.unwrap().unwrap();
        assert_eq!(stored.updated_at, clock.now());
        assert_eq!(stored.error_message.as_deref(), Some("declined"));

        queue.delete(it.id).await.unwrap();
        assert!(matches!(
            queue.update(it).await,
            Err(QueueError::NotFound(_))
        ));
    }
}
