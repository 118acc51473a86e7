//! Prometheus metrics for exactly-once processing.
//!
//! The core crate records through the `metrics` facade; this module installs
//! the Prometheus exporter and describes every metric:
//! - Ledger decisions and completions
//! - Processor attempts per policy and outcome
//! - Pipeline stages reached and failures
//! - Deliveries, redeliveries and dead letters
//!
//! # Example
//!
//! ```rust,no_run
//! use exactly_once_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Start metrics server on port 9090
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use exactly_once_core::DeliveryOutcome;
use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the exporter and start serving `/metrics`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a metrics recorder is already installed (e.g., in tests), this logs
    /// a warning and succeeds without a handle.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        let builder = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .set_buckets_for_metric(
                Matcher::Full("delivery_backoff_seconds".to_string()),
                &[0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let (recorder, exporter) = builder
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;
        let handle = recorder.handle();

        match metrics::set_global_recorder(recorder) {
            Ok(()) => {
                tokio::spawn(exporter);
                register_metrics();
                self.handle = Some(handle);
                tracing::info!(
                    addr = %self.addr,
                    "Metrics server started - available at http://{}/metrics",
                    self.addr
                );
                Ok(())
            },
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            },
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if server hasn't been started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Ledger
    describe_counter!(
        "ledger_decisions_total",
        "Ledger decisions, labelled should_run / already_done / lease_held"
    );
    describe_counter!(
        "ledger_claims_total",
        "Claim-once decisions, labelled like ledger_decisions_total"
    );
    describe_counter!(
        "ledger_completions_total",
        "Records moved to Done"
    );

    // Processor
    describe_counter!(
        "processor_attempts_total",
        "Processor attempts by policy and outcome"
    );
    describe_histogram!(
        "processor_attempt_duration_seconds",
        "Time taken by one processor attempt"
    );

    // Pipeline
    describe_counter!(
        "pipeline_stages_total",
        "Order pipeline stages reached"
    );
    describe_counter!(
        "pipeline_failures_total",
        "Order pipeline attempts that stopped, by last stage reached"
    );

    // Delivery
    describe_counter!(
        "delivery_attempts_total",
        "Handler invocations by resulting outcome (ack / retry / dead_letter)"
    );
    describe_counter!(
        "delivery_redeliveries_total",
        "Redeliveries scheduled after a transient failure"
    );
    describe_counter!(
        "delivery_dead_letters_total",
        "Events handed to the dead-letter path, by error kind"
    );
    describe_histogram!(
        "delivery_backoff_seconds",
        "Delay before each redelivery"
    );

    // Postgres record store
    describe_histogram!(
        "record_store_transaction_duration_seconds",
        "Time taken by one record store transaction"
    );
    describe_counter!(
        "record_store_conflicts_total",
        "Transactions that lost a race for the same key"
    );

    // Dead-letter queue
    describe_counter!(
        "dead_letters_added_total",
        "Events written to the dead-letter queue, by error kind"
    );
    describe_counter!(
        "dead_letters_resolved_total",
        "Dead letters marked resolved"
    );
    describe_counter!(
        "dead_letters_discarded_total",
        "Dead letters discarded"
    );
}

/// Delivery metrics recorder.
pub struct DeliveryMetrics;

impl DeliveryMetrics {
    /// Record one handler invocation.
    pub fn record_attempt(outcome: DeliveryOutcome) {
        let outcome = match outcome {
            DeliveryOutcome::Ack => "ack",
            DeliveryOutcome::Retry => "retry",
            DeliveryOutcome::DeadLetter => "dead_letter",
        };
        counter!("delivery_attempts_total", "outcome" => outcome).increment(1);
    }

    /// Record a scheduled redelivery.
    pub fn record_redelivery(delay: Duration) {
        counter!("delivery_redeliveries_total").increment(1);
        histogram!("delivery_backoff_seconds").record(delay.as_secs_f64());
    }

    /// Record a dead-lettered event.
    pub fn record_dead_letter(kind: &'static str) {
        counter!("delivery_dead_letters_total", "kind" => kind).increment(1);
    }
}
