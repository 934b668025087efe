//! Per-account write serialization
//!
//! Stage handlers and entry points lock every account they are about to
//! mutate, re-read them under the lock, then commit. Locks for several
//! accounts are always taken in ascending id order so two transfers between
//! the same pair of accounts cannot deadlock.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::core_types::AccountId;

#[derive(Default)]
pub struct AccountLocks {
    locks: DashMap<AccountId, Arc<Mutex<()>>>,
}

/// Held locks; released on drop
pub struct AccountGuard {
    _guards: Vec<OwnedMutexGuard<()>>,
    accounts: Vec<AccountId>,
}

impl AccountGuard {
    pub fn accounts(&self) -> &[AccountId] {
        &self.accounts
    }
}

impl AccountLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock one or more accounts
    pub async fn lock(&self, ids: &[AccountId]) -> AccountGuard {
        let mut ordered = ids.to_vec();
        ordered.sort();
        ordered.dedup();

        let mut guards = Vec::with_capacity(ordered.len());
        for id in &ordered {
            // Clone the Arc out so no map shard is held across the await
            let mutex = self
                .locks
                .entry(*id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();
            guards.push(mutex.lock_owned().await);
        }

        AccountGuard {
            _guards: guards,
            accounts: ordered,
        }
    }

    /// Number of accounts that have ever been locked
    pub fn tracked(&self) -> usize {
        self.locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_lock_dedups_and_orders() {
        let locks = AccountLocks::new();
        let a = AccountId::new();
        let b = AccountId::new();
        let guard = locks.lock(&[b, a, b]).await;
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(guard.accounts(), expected.as_slice());
        assert_eq!(locks.tracked(), 2);
    }

    #[tokio::test]
    async fn test_second_locker_waits() {
        let locks = Arc::new(AccountLocks::new());
        let id = AccountId::new();
        let guard = locks.lock(&[id]).await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock(&[id]).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .expect("contender should acquire after release")
            .unwrap();
    }

    #[tokio::test]
    async fn test_opposite_order_does_not_deadlock() {
        let locks = Arc::new(AccountLocks::new());
        let a = AccountId::new();
        let b = AccountId::new();

        let mut handles = Vec::new();
        for i in 0..20 {
            let locks = locks.clone();
            let pair = if i % 2 == 0 { [a, b] } else { [b, a] };
            handles.push(tokio::spawn(async move {
                let _g = locks.lock(&pair).await;
                tokio::task::yield_now().await;
            }));
        }

        tokio::time::timeout(Duration::from_secs(2), futures::future::join_all(handles))
            .await
            .expect("lock ordering must prevent deadlock");
    }
}
