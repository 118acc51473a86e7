//! # Exactly Once Core
//!
//! Exactly-once side effects on top of at-least-once event delivery.
//!
//! Upstream delivery infrastructure may hand the same logical event to this
//! crate several times (after a timeout, a crash, or simply concurrently). The
//! types here decide, per event identifier, whether the side effect should run
//! now, has already run, or is currently owned by another attempt.
//!
//! ## Core Concepts
//!
//! - **Record Store**: durable key-value store with an atomic single-key `transact`
//! - **Side-Effect Invoker**: a call into an external, unreliable service
//! - **Dedup Ledger**: `Unseen → Leased → Done` state machine per event identifier
//! - **Idempotent Processor**: business logic guarded by one of several policies
//! - **Order Pipeline**: choose cook → persist order → notify cook, resumable after a crash
//!
//! ## Architecture Principles
//!
//! - The record store is the only shared mutable resource
//! - No in-process locks: per-identifier serialization comes from store transactions
//! - Lease expiry is evaluated lazily, only when another attempt calls `decide`
//! - Every dependency (store, invoker, clock) is injected, never ambient
//!
//! ## Example
//!
//! ```ignore
//! use exactly_once_core::{DedupLedger, Decision, EventId};
//!
//! let ledger = DedupLedger::new(store, LedgerConfig::default());
//! match ledger.decide(&EventId::new("evt-1"), clock.now(), lease).await? {
//!     Decision::ShouldRun { lease, .. } => {
//!         // run the side effect, then:
//!         ledger.mark_done(&EventId::new("evt-1"), &lease, clock.now(), Some(result)).await?;
//!     }
//!     Decision::AlreadyDone { .. } => { /* ack without running */ }
//!     Decision::LeaseHeld { .. } => { /* fail the attempt, retry later */ }
//! }
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Duration, Utc};
pub use serde::{Deserialize, Serialize};

pub mod envelope;
pub mod error;
pub mod invoker;
pub mod ledger;
pub mod pipeline;
pub mod processor;
pub mod record_store;

pub use envelope::{EventEnvelope, EventId};
pub use error::{DeliveryOutcome, ProcessingError};
pub use invoker::{InvokeError, ServiceCall, SideEffectInvoker};
pub use ledger::{
    Completion, Decision, DedupLedger, DedupRecord, Lease, LedgerConfig, LedgerError,
    min_lease_duration,
};
pub use pipeline::{Order, OrderPipeline, OrderRequest, OrderStage, PipelineOutcome};
pub use processor::{IdempotentProcessor, Processed, ProcessingPolicy, ProcessorConfig};
pub use record_store::{RecordStore, StoreError, Transition, Write};

/// Environment module - Dependency injection traits
///
/// All external dependencies are abstracted behind traits and injected
/// through constructors.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// Lease expiry is always computed from an injected clock, so tests can
    /// move time forward past a lease without sleeping.
    ///
    /// # Examples
    ///
    /// ```
    /// use exactly_once_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let before = clock.now();
    /// assert!(clock.now() >= before);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
