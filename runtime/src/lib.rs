//! # Exactly Once Runtime
//!
//! Runtime pieces around the exactly-once core.
//!
//! ## Core Components
//!
//! - **Delivery harness**: at-least-once redelivery with backoff and jitter,
//!   acknowledging, retrying or dead-lettering according to
//!   [`DeliveryOutcome`](exactly_once_core::DeliveryOutcome)
//! - **Metrics**: Prometheus exporter describing the ledger, processor,
//!   pipeline and delivery metrics
//!
//! ## Example
//!
//! ```ignore
//! use exactly_once_runtime::delivery::{DeliveryHarness, RedeliveryPolicy};
//!
//! let harness = DeliveryHarness::new(RedeliveryPolicy::default(), clock);
//! let deliveries = harness
//!     .deliver_duplicates(&event, 3, &|envelope| async move { pipeline.process(&envelope).await })
//!     .await;
//! ```

/// At-least-once delivery with backoff
pub mod delivery;

/// Prometheus metrics for observability
pub mod metrics;

pub use delivery::{Delivery, DeliveryHarness, RedeliveryPolicy, RedeliveryPolicyBuilder};
pub use metrics::{DeliveryMetrics, MetricsError, MetricsServer};
