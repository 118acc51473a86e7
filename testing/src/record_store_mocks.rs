//! In-memory record store for fast, deterministic tests.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Only panics on a poisoned lock

use exactly_once_core::record_store::{RecordStore, StoreError, Transition, Write};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// HashMap-backed [`RecordStore`].
///
/// Each `transact` runs its closure while holding the write lock, which
/// makes transactions on the same key (and on every other key) serializable.
/// Before taking the lock every call yields once to the scheduler, so
/// concurrent attempts in a test genuinely interleave.
///
/// Outages can be scripted with [`InMemoryRecordStore::fail_next`].
///
/// # Example
///
/// ```
/// use exactly_once_testing::InMemoryRecordStore;
/// use exactly_once_core::record_store::RecordStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryRecordStore::new();
///
/// assert!(store.insert_if_absent("orders/evt-1", b"first".to_vec()).await?);
/// assert!(!store.insert_if_absent("orders/evt-1", b"second".to_vec()).await?);
/// assert_eq!(store.get("orders/evt-1").await?, Some(b"first".to_vec()));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryRecordStore {
    data: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    pending_failures: Arc<AtomicUsize>,
    transactions: Arc<AtomicUsize>,
}

impl InMemoryRecordStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls (transactions and reads) fail with
    /// `StoreError::Unavailable` without touching any data.
    pub fn fail_next(&self, n: usize) {
        self.pending_failures.fetch_add(n, Ordering::SeqCst);
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.read().unwrap().len()
    }

    /// Check if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.read().unwrap().is_empty()
    }

    /// Check if a key exists.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.data.read().unwrap().contains_key(key)
    }

    /// Raw value of `key`, bypassing fault injection.
    #[must_use]
    pub fn value(&self, key: &str) -> Option<Vec<u8>> {
        self.data.read().unwrap().get(key).cloned()
    }

    /// Keys starting with `prefix`, sorted.
    ///
    /// `keys_with_prefix("orders/")` lists every persisted order.
    #[must_use]
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .data
            .read()
            .unwrap()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Number of `transact` calls that reached the store, failed ones included.
    #[must_use]
    pub fn transaction_count(&self) -> usize {
        self.transactions.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> bool {
        self.pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl RecordStore for InMemoryRecordStore {
    async fn transact<F, T>(&self, key: &str, apply: F) -> Result<T, StoreError>
    where
        F: FnOnce(Option<&[u8]>) -> Transition<T> + Send,
        T: Send,
    {
        tokio::task::yield_now().await;
        self.transactions.fetch_add(1, Ordering::SeqCst);

        if self.take_failure() {
            return Err(StoreError::Unavailable(format!(
                "injected outage during transaction on {key}"
            )));
        }

        let mut data = self.data.write().unwrap();
        let transition = apply(data.get(key).map(Vec::as_slice));
        if let Write::Put(value) = transition.write {
            data.insert(key.to_string(), value);
        }
        Ok(transition.output)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        tokio::task::yield_now().await;
        if self.take_failure() {
            return Err(StoreError::Unavailable(format!(
                "injected outage while reading {key}"
            )));
        }
        Ok(self.data.read().unwrap().get(key).cloned())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transact_reads_then_writes() {
        let store = InMemoryRecordStore::new();

        let first = store
            .transact("counter", |current| {
                assert!(current.is_none());
                Transition::put(vec![1], 1)
            })
            .await
            .unwrap();
        let second = store
            .transact("counter", |current| {
                let next = current.unwrap()[0] + 1;
                Transition::put(vec![next], next)
            })
            .await
            .unwrap();

        assert_eq!((first, second), (1, 2));
        assert_eq!(store.value("counter"), Some(vec![2]));
    }

    #[tokio::test]
    async fn keep_leaves_key_absent() {
        let store = InMemoryRecordStore::new();
        store
            .transact("untouched", |_| Transition::keep(()))
            .await
            .unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn injected_failures_write_nothing() {
        let store = InMemoryRecordStore::new();
        store.fail_next(2);

        let first = store.insert_if_absent("a", vec![1]).await;
        let second = store.get("a").await;
        assert!(matches!(first, Err(StoreError::Unavailable(_))));
        assert!(matches!(second, Err(StoreError::Unavailable(_))));
        assert!(store.is_empty());

        assert!(store.insert_if_absent("a", vec![1]).await.unwrap());
        assert_eq!(store.transaction_count(), 2);
    }

    #[tokio::test]
    async fn concurrent_inserts_create_once() {
        let store = InMemoryRecordStore::new();

        let handles: Vec<_> = (0..16u8)
            .map(|n| {
                let store = store.clone();
                tokio::spawn(async move { store.insert_if_absent("orders/evt-1", vec![n]).await })
            })
            .collect();

        let mut created = 0;
        for handle in handles {
            if handle.await.expect("task panicked").unwrap() {
                created += 1;
            }
        }

        assert_eq!(created, 1);
        assert_eq!(store.keys_with_prefix("orders/"), vec!["orders/evt-1".to_string()]);
    }
}
