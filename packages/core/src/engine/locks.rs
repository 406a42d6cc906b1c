// Per-key mutual exclusion (one critical section per session / device)

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::error::Elapsed;

/// Held for the duration of one mutation; released on drop
pub(crate) type KeyGuard = OwnedMutexGuard<()>;

/// Lazily created lock per key. Different keys never contend.
pub(crate) struct LockTable<K> {
    locks: Arc<Mutex<HashMap<K, Arc<Mutex<()>>>>>,
}

impl<K> Clone for LockTable<K> {
    fn clone(&self) -> Self {
        Self {
            locks: Arc::clone(&self.locks),
        }
    }
}

impl<K> Default for LockTable<K> {
    fn default() -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K: Eq + Hash + Clone> LockTable<K> {
    async fn entry(&self, key: &K) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    /// Waits at most `timeout` for the lock of `key`.
    pub(crate) async fn acquire(&self, key: &K, timeout: Duration) -> Result<KeyGuard, Elapsed> {
        let lock = self.entry(key).await;
        tokio::time::timeout(timeout, lock.lock_owned()).await
    }

    /// Waits for the lock of `key` without a deadline.
    pub(crate) async fn acquire_unbounded(&self, key: &K) -> KeyGuard {
        self.entry(key).await.lock_owned().await
    }

    /// Forgets the lock of a deleted key once nobody holds or awaits it.
    ///
    /// A waiter keeps its own `Arc` to the mutex, so the entry must outlive
    /// it; otherwise a newcomer would get a fresh mutex for the same key.
    pub(crate) async fn forget(&self, key: &K) {
        let mut locks = self.locks.lock().await;
        if locks.get(key).map_or(false, |lock| Arc::strong_count(lock) == 1) {
            locks.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_key_times_out_other_key_proceeds() {
        let table: LockTable<&'static str> = LockTable::default();
        let _held = table.acquire(&"a", Duration::from_millis(50)).await.unwrap();

        assert!(table.acquire(&"a", Duration::from_millis(20)).await.is_err());
        assert!(table.acquire(&"b", Duration::from_millis(20)).await.is_ok());
    }

    #[tokio::test]
    async fn test_forget_keeps_lock_while_awaited() {
        let table: LockTable<u32> = LockTable::default();
        let held = table.acquire(&1, Duration::from_millis(50)).await.unwrap();
        let waiter = {
            let table = table.clone();
            tokio::spawn(async move { table.acquire_unbounded(&1).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(held);
        table.forget(&1).await;
        let waiting = waiter.await.unwrap();

        // The waiter still excludes newcomers
        assert!(table.acquire(&1, Duration::from_millis(20)).await.is_err());

        drop(waiting);
        table.forget(&1).await;
        assert!(table.locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_lock_is_released_on_drop() {
        let table: LockTable<u32> = LockTable::default();
        drop(table.acquire(&1, Duration::from_millis(50)).await.unwrap());
        assert!(table.acquire(&1, Duration::from_millis(50)).await.is_ok());
    }
}
