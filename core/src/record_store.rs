//! Durable record store abstraction.
//!
//! The store is the single synchronization point of the whole system: every
//! per-identifier decision is made inside one `transact` call, and the store's
//! isolation guarantees that two concurrent transactions on the same key never
//! both observe the same "before" value and both write.
//!
//! # Implementations
//!
//! - `PostgresRecordStore` (in `exactly-once-postgres`): production implementation
//! - `InMemoryRecordStore` (in `exactly-once-testing`): fast, deterministic testing
//!
//! # Example
//!
//! ```ignore
//! use exactly_once_core::record_store::{RecordStore, Transition};
//!
//! // Increment a counter atomically
//! let next = store
//!     .transact("counters/a", |current| {
//!         let n = current.map_or(0, |bytes| bytes[0]) + 1;
//!         Transition::put(vec![n], n)
//!     })
//!     .await?;
//! ```

use std::future::Future;
use thiserror::Error;

/// Errors from the record store.
///
/// Every variant is transient from the core's point of view: the whole event
/// can be retried from scratch because nothing was committed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached or the transaction aborted.
    #[error("Record store unavailable: {0}")]
    Unavailable(String),

    /// A concurrent transaction won the race for this key.
    #[error("Transaction conflict on key {key}")]
    Conflict {
        /// The contended key
        key: String,
    },
}

/// What a transaction does with its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Write {
    /// Replace (or create) the value.
    Put(Vec<u8>),
    /// Leave the key untouched.
    Keep,
}

/// Result of applying a transaction function to the current value.
///
/// `output` is handed back to the caller once the transaction commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition<T> {
    /// Write to perform before committing
    pub write: Write,
    /// Value returned from `transact`
    pub output: T,
}

impl<T> Transition<T> {
    /// Commit `value` under the key and return `output`.
    #[must_use]
    pub const fn put(value: Vec<u8>, output: T) -> Self {
        Self {
            write: Write::Put(value),
            output,
        }
    }

    /// Commit nothing and return `output`.
    #[must_use]
    pub const fn keep(output: T) -> Self {
        Self {
            write: Write::Keep,
            output,
        }
    }
}

/// Key-addressed store with atomic read-modify-write over a single key.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; one store handle is constructed at
/// process start and shared by every concurrent attempt.
///
/// # Isolation
///
/// `transact` must be atomic and isolated per key (serializable, or snapshot
/// isolation on a single key). The transaction function may be invoked at most
/// once per call; implementations that retry internally must not do so after
/// calling it.
pub trait RecordStore: Send + Sync {
    /// Read the current value of `key`, decide, and optionally write, atomically.
    ///
    /// `apply` receives the current value (or `None` when the key is absent)
    /// and returns the write to perform plus the value to hand back.
    ///
    /// # Errors
    ///
    /// - `Unavailable`: the store could not be reached, nothing was written
    /// - `Conflict`: a concurrent transaction on the same key won, nothing was written
    fn transact<F, T>(
        &self,
        key: &str,
        apply: F,
    ) -> impl Future<Output = Result<T, StoreError>> + Send
    where
        F: FnOnce(Option<&[u8]>) -> Transition<T> + Send,
        T: Send;

    /// Read the current value of `key`.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` if the store could not be reached.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>, StoreError>> + Send;

    /// Write `value` only if `key` is absent ("create if absent").
    ///
    /// Returns `true` if this call created the record, `false` if a record
    /// already existed (in which case it is left untouched).
    ///
    /// # Errors
    ///
    /// Propagates errors from [`RecordStore::transact`].
    fn insert_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send {
        self.transact(key, move |current| {
            if current.is_some() {
                Transition::keep(false)
            } else {
                Transition::put(value, true)
            }
        })
    }
}

/// Store key of the dedup record for an event identifier.
#[must_use]
pub fn dedup_key(id: &crate::EventId) -> String {
    format!("dedup/{id}")
}

/// Store key of a document in `collection` keyed by `id`.
#[must_use]
pub fn document_key(collection: &str, id: impl std::fmt::Display) -> String {
    format!("{collection}/{id}")
}
