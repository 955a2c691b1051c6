use crate::domain::account::AccountId;
use crate::domain::transfer::TransferId;
use crate::error::{EngineError, Result};
use dashmap::DashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

type LockTable<K> = Arc<DashMap<K, Arc<Mutex<()>>>>;

/// A table of exclusive async locks, one per key, created on demand.
///
/// Entries nobody holds or waits on are dropped on release, so the table only
/// grows with the number of keys in contention.
pub struct KeyedLocks<K: Eq + Hash + Clone> {
    table: LockTable<K>,
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            table: Arc::new(DashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone + Display> KeyedLocks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits up to `timeout` for exclusive ownership of `key`.
    pub async fn acquire(&self, key: &K, timeout: Duration) -> Result<KeyedLockGuard<K>> {
        let mutex = self.table.entry(key.clone()).or_default().clone();
        match tokio::time::timeout(timeout, mutex.lock_owned()).await {
            Ok(guard) => Ok(KeyedLockGuard {
                key: key.clone(),
                guard: Some(guard),
                table: self.table.clone(),
            }),
            Err(_) => {
                self.table
                    .remove_if(key, |_, m| Arc::strong_count(m) == 1);
                warn!(lock = %key, timeout_ms = timeout.as_millis() as u64, "Lock wait timed out");
                Err(EngineError::LockTimeout(key.to_string()))
            }
        }
    }

    /// Number of keys currently held or waited on.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// Releases its key on drop.
pub struct KeyedLockGuard<K: Eq + Hash + Clone> {
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
    table: LockTable<K>,
}

impl<K: Eq + Hash + Clone> Drop for KeyedLockGuard<K> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // The table keeps one reference; anything above that is a waiter.
        self.table
            .remove_if(&self.key, |_, m| Arc::strong_count(m) == 1);
    }
}

/// Both account locks of a transfer. Dropping it releases them.
pub struct AccountLocks {
    _first: KeyedLockGuard<AccountId>,
    _second: Option<KeyedLockGuard<AccountId>>,
}

/// Serializes balance mutations per account and submissions per
/// idempotency key.
///
/// Account pairs are always locked in ascending id order, so two transfers
/// between the same accounts in opposite directions cannot deadlock.
pub struct ConcurrencyGuard {
    accounts: KeyedLocks<AccountId>,
    keys: KeyedLocks<String>,
    lock_timeout: Duration,
}

impl ConcurrencyGuard {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            accounts: KeyedLocks::new(),
            keys: KeyedLocks::new(),
            lock_timeout,
        }
    }

    /// Locks both parties of a transfer in canonical order.
    pub async fn lock_accounts(&self, a: &AccountId, b: &AccountId) -> Result<AccountLocks> {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        let first = self.accounts.acquire(low, self.lock_timeout).await?;
        let second = if low == high {
            None
        } else {
            Some(self.accounts.acquire(high, self.lock_timeout).await?)
        };
        debug!(first = %low, second = %high, "Account locks acquired");
        Ok(AccountLocks {
            _first: first,
            _second: second,
        })
    }

    /// Serializes work on one idempotency key.
    pub async fn lock_key(&self, key: &str) -> Result<KeyedLockGuard<String>> {
        self.keys
            .acquire(&format!("key:{}", key), self.lock_timeout)
            .await
    }

    /// Serializes lifecycle changes of one transfer, waiting at most `timeout`.
    pub async fn lock_transfer(
        &self,
        id: TransferId,
        timeout: Duration,
    ) -> Result<KeyedLockGuard<String>> {
        self.keys.acquire(&format!("transfer:{}", id), timeout).await
    }

    pub fn held_account_locks(&self) -> usize {
        self.accounts.len()
    }
}
