//! # Exactly Once Testing
//!
//! Testing utilities for exactly-once event processing.
//!
//! This crate provides:
//! - [`InMemoryRecordStore`]: mutex-backed record store with injectable outages
//! - [`RecordingInvoker`]: fake downstream services that record every call
//! - [`FaultInjectingInvoker`]: random failures in front of any invoker
//! - [`FixedClock`] / [`ManualClock`]: deterministic time
//!
//! ## Example
//!
//! ```ignore
//! use exactly_once_testing::{InMemoryRecordStore, ManualClock, RecordingInvoker, test_clock};
//!
//! #[tokio::test]
//! async fn test_redelivery() {
//!     let store = Arc::new(InMemoryRecordStore::new());
//!     let invoker = Arc::new(RecordingInvoker::new());
//!     let clock = Arc::new(ManualClock::new(test_clock().now()));
//!
//!     let pipeline = OrderPipeline::new(DedupLedger::new(store, LedgerConfig::default()), invoker, clock);
//!     pipeline.process(&envelope).await?;
//!     pipeline.process(&envelope).await?; // replayed, nothing runs twice
//! }
//! ```

mod invoker_mocks;
mod record_store_mocks;

pub use invoker_mocks::{FaultInjectingInvoker, FaultPoint, RecordedCall, RecordingInvoker};
pub use record_store_mocks::InMemoryRecordStore;

use chrono::{DateTime, Utc};
use exactly_once_core::environment::Clock;

/// Mock clocks.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, Mutex};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use exactly_once_testing::mocks::FixedClock;
    /// use exactly_once_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Clones share the same time, so a test can hand one clone to the
    /// pipeline and advance another to push leases past their expiry.
    ///
    /// # Example
    ///
    /// ```
    /// use exactly_once_testing::{ManualClock, test_clock};
    /// use exactly_once_core::environment::Clock;
    /// use chrono::Duration;
    ///
    /// let clock = ManualClock::new(test_clock().now());
    /// let start = clock.now();
    /// clock.advance(Duration::seconds(90));
    /// assert_eq!(clock.now() - start, Duration::seconds(90));
    /// ```
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    #[allow(clippy::unwrap_used)] // Poisoning only happens after a panicking test
    impl ManualClock {
        /// Create a clock starting at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move time forward by `by`.
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.lock().unwrap();
            *time += by;
        }

        /// Jump to `time`.
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.lock().unwrap() = time;
        }
    }

    #[allow(clippy::unwrap_used)]
    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap()
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Install a `tracing` subscriber that writes through the test harness.
///
/// Safe to call from every test; only the first call installs anything.
/// Honors `RUST_LOG`.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use mocks::{FixedClock, ManualClock, test_clock};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::new(test_clock().now());
        let handle = clock.clone();
        handle.advance(chrono::Duration::minutes(5));
        assert_eq!(clock.now(), test_clock().now() + chrono::Duration::minutes(5));
    }
}
