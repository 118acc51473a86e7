//! `PostgreSQL` backing for exactly-once processing.
//!
//! - [`PostgresRecordStore`]: a `RecordStore` whose `transact` runs in a
//!   database transaction with the row locked, so ledger records and
//!   documents survive restarts and are shared between processes.
//! - [`DeadLetterQueue`]: events the delivery path gave up on, kept for
//!   inspection and requeueing.
//!
//! Both live in the same database; [`PostgresRecordStore::migrate`] creates
//! their tables.
//!
//! # Example
//!
//! ```ignore
//! use exactly_once_core::{DedupLedger, LedgerConfig};
//! use exactly_once_postgres::{DeadLetterQueue, PostgresRecordStore};
//! use std::sync::Arc;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PostgresRecordStore::new("postgres://localhost/orders").await?;
//!     store.migrate().await?;
//!
//!     let dlq = DeadLetterQueue::new(store.pool().clone());
//!     let ledger = DedupLedger::new(Arc::new(store), LedgerConfig::default());
//!     Ok(())
//! }
//! ```

pub mod dead_letter_queue;
pub mod record_store;

pub use dead_letter_queue::{DeadLetter, DeadLetterQueue, DeadLetterStatus};
pub use record_store::PostgresRecordStore;
