//! At-least-once delivery with exponential backoff and jitter.
//!
//! Stands in for the message infrastructure in front of a processor: it
//! hands an event to a handler, acknowledges on success, redelivers transient
//! failures after a backoff, and dead-letters permanent failures (or events
//! that keep failing past the retry limit).
//!
//! The exactly-once guarantee does not depend on anything here. Redeliveries
//! only reach the handler again; deduplication is the ledger's job.
//!
//! # Example
//!
//! ```rust,no_run
//! use exactly_once_core::environment::SystemClock;
//! use exactly_once_core::EventEnvelope;
//! use exactly_once_runtime::delivery::{DeliveryHarness, RedeliveryPolicy};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example(processor: exactly_once_core::IdempotentProcessor<impl exactly_once_core::RecordStore>) {
//! let policy = RedeliveryPolicy::builder()
//!     .max_retries(5)
//!     .initial_delay(Duration::from_millis(100))
//!     .jitter(0.2)
//!     .build();
//! let harness = DeliveryHarness::new(policy, Arc::new(SystemClock));
//!
//! let event = EventEnvelope::new("evt-1", b"hello".to_vec(), chrono::Utc::now());
//! let delivery = harness.deliver(event, &|envelope| {
//!     let processor = &processor;
//!     async move { processor.process(&envelope).await }
//! }).await;
//! assert!(delivery.is_acked());
//! # }
//! ```

use crate::metrics::DeliveryMetrics;
use exactly_once_core::environment::Clock;
use exactly_once_core::{DeliveryOutcome, EventEnvelope, EventId, ProcessingError};
use futures::future::join_all;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Backoff between redeliveries.
///
/// # Default Values
///
/// - `max_retries`: 5
/// - `initial_delay`: 100ms
/// - `max_delay`: 30 seconds
/// - `multiplier`: 2.0 (delay doubles each redelivery)
/// - `jitter`: 0.2 (up to 20% shaved off each delay)
#[derive(Debug, Clone, PartialEq)]
pub struct RedeliveryPolicy {
    /// Redeliveries after the first attempt before dead-lettering
    pub max_retries: usize,
    /// Delay before the first redelivery
    pub initial_delay: Duration,
    /// Cap on any single delay
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
    /// Fraction of each delay that may be randomly removed (`0.0..=1.0`)
    pub jitter: f64,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RedeliveryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RedeliveryPolicyBuilder {
        RedeliveryPolicyBuilder {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }

    /// Delay before redelivery number `retry` (0-based), without jitter.
    ///
    /// `initial_delay * multiplier^retry`, capped at `max_delay`.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn delay_for_retry(&self, retry: usize) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let nanos = self.initial_delay.as_nanos() as f64 * self.multiplier.powi(exponent);
        if nanos.is_finite() && nanos < self.max_delay.as_nanos() as f64 {
            Duration::from_nanos(nanos as u64)
        } else {
            self.max_delay
        }
    }

    /// [`delay_for_retry`](Self::delay_for_retry) with up to `jitter` of it
    /// randomly removed, so that duplicates failing together spread out.
    #[must_use]
    pub fn jittered_delay(&self, retry: usize, rng: &mut impl Rng) -> Duration {
        let delay = self.delay_for_retry(retry);
        if self.jitter <= 0.0 {
            return delay;
        }
        let keep = 1.0 - self.jitter * rng.gen_range(0.0..=1.0);
        delay.mul_f64(keep)
    }
}

/// Builder for [`RedeliveryPolicy`].
#[derive(Debug, Clone)]
pub struct RedeliveryPolicyBuilder {
    max_retries: usize,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: f64,
}

impl RedeliveryPolicyBuilder {
    /// Set maximum number of redeliveries.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set delay before the first redelivery.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the cap on any single delay.
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the growth factor.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set the jitter fraction (clamped to `0.0..=1.0`).
    #[must_use]
    pub const fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Build the [`RedeliveryPolicy`].
    #[must_use]
    pub fn build(self) -> RedeliveryPolicy {
        RedeliveryPolicy {
            max_retries: self.max_retries,
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            multiplier: self.multiplier.max(1.0),
            jitter: self.jitter.clamp(0.0, 1.0),
        }
    }
}

/// Final state of one delivered event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery<T> {
    /// Event identifier
    pub id: EventId,
    /// Handler invocations, first attempt included
    pub attempts: usize,
    /// `Ack` or `DeadLetter`; never `Retry`
    pub outcome: DeliveryOutcome,
    /// Result of the last attempt
    pub result: Result<T, ProcessingError>,
}

impl<T> Delivery<T> {
    /// Whether the event was acknowledged.
    #[must_use]
    pub const fn is_acked(&self) -> bool {
        matches!(self.outcome, DeliveryOutcome::Ack)
    }
}

/// Simulated at-least-once delivery.
pub struct DeliveryHarness {
    policy: RedeliveryPolicy,
    clock: Arc<dyn Clock>,
}

impl DeliveryHarness {
    /// Create a harness.
    #[must_use]
    pub fn new(policy: RedeliveryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self { policy, clock }
    }

    /// Configured policy.
    #[must_use]
    pub const fn policy(&self) -> &RedeliveryPolicy {
        &self.policy
    }

    /// Deliver `envelope` to `handler` until it is acknowledged or dead-lettered.
    ///
    /// Every redelivery carries the same identifier and payload with a fresh
    /// `received_at`. A `LeaseConflict` waits at least until the other
    /// attempt's lease runs out (still capped at `max_delay`).
    #[tracing::instrument(skip(self, envelope, handler), fields(event_id = %envelope.id))]
    pub async fn deliver<F, Fut, T>(&self, envelope: EventEnvelope, handler: &F) -> Delivery<T>
    where
        F: Fn(EventEnvelope) -> Fut,
        Fut: Future<Output = Result<T, ProcessingError>>,
    {
        let id = envelope.id.clone();
        let mut attempts = 0;
        let mut next = envelope;

        loop {
            attempts += 1;
            let redelivery = next.redelivered_at(self.clock.now());
            let result = handler(next).await;
            let outcome = DeliveryOutcome::from_result(&result);
            DeliveryMetrics::record_attempt(outcome);

            let error = match result {
                Ok(value) => {
                    if attempts > 1 {
                        tracing::info!(attempts, "Delivered after redelivery");
                    }
                    return Delivery {
                        id,
                        attempts,
                        outcome,
                        result: Ok(value),
                    };
                },
                Err(error) => error,
            };

            if outcome == DeliveryOutcome::Retry && attempts <= self.policy.max_retries {
                let delay = self.backoff(attempts - 1, &error);
                tracing::warn!(
                    attempts,
                    delay_ms = delay.as_millis(),
                    %error,
                    "Attempt failed, redelivering"
                );
                DeliveryMetrics::record_redelivery(delay);
                sleep(delay).await;
                next = redelivery;
                continue;
            }

            if error.is_retryable() {
                tracing::error!(attempts, %error, "Redeliveries exhausted, dead-lettering");
            } else {
                tracing::error!(attempts, %error, "Permanent failure, dead-lettering");
            }
            DeliveryMetrics::record_dead_letter(error.kind());
            return Delivery {
                id,
                attempts,
                outcome: DeliveryOutcome::DeadLetter,
                result: Err(error),
            };
        }
    }

    /// Deliver `copies` duplicates of `envelope` concurrently, as a broker
    /// that redelivers after a timeout might.
    pub async fn deliver_duplicates<F, Fut, T>(
        &self,
        envelope: &EventEnvelope,
        copies: usize,
        handler: &F,
    ) -> Vec<Delivery<T>>
    where
        F: Fn(EventEnvelope) -> Fut,
        Fut: Future<Output = Result<T, ProcessingError>>,
    {
        join_all((0..copies).map(|_| self.deliver(envelope.clone(), handler))).await
    }

    fn backoff(&self, retry: usize, error: &ProcessingError) -> Duration {
        let delay = self.policy.jittered_delay(retry, &mut rand::thread_rng());
        match error {
            ProcessingError::LeaseConflict { expires_at, .. } => {
                let remaining = (*expires_at - self.clock.now()).to_std().unwrap_or_default();
                delay.max(remaining).min(self.policy.max_delay)
            },
            _ => delay,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use exactly_once_core::environment::SystemClock;
    use exactly_once_core::StoreError;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_policy(max_retries: usize) -> RedeliveryPolicy {
        RedeliveryPolicy::builder()
            .max_retries(max_retries)
            .initial_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(5))
            .build()
    }

    fn harness(max_retries: usize) -> DeliveryHarness {
        DeliveryHarness::new(fast_policy(max_retries), Arc::new(SystemClock))
    }

    fn event() -> EventEnvelope {
        EventEnvelope::new("evt-1", b"payload".to_vec(), chrono::Utc::now())
    }

    fn unavailable() -> ProcessingError {
        ProcessingError::TransientStore(StoreError::Unavailable("down".to_string()))
    }

    #[test]
    fn delay_grows_and_caps() {
        let policy = RedeliveryPolicy::builder()
            .initial_delay(Duration::from_millis(100))
            .multiplier(2.0)
            .max_delay(Duration::from_millis(500))
            .build();

        assert_eq!(policy.delay_for_retry(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for_retry(usize::MAX), Duration::from_millis(500));
    }

    proptest! {
        #[test]
        fn jitter_only_shortens(retry in 0usize..64, jitter in 0.0f64..=1.0, seed in any::<u64>()) {
            use rand::SeedableRng;
            let policy = RedeliveryPolicy::builder().jitter(jitter).build();
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed);

            let base = policy.delay_for_retry(retry);
            let jittered = policy.jittered_delay(retry, &mut rng);
            let slack = Duration::from_nanos(1);
            prop_assert!(jittered <= base + slack);
            prop_assert!(jittered + slack >= base.mul_f64(1.0 - jitter));
        }
    }

    #[tokio::test]
    async fn transient_failures_are_redelivered_until_acked() {
        let calls = AtomicUsize::new(0);
        let handler = |envelope: EventEnvelope| {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 { Err(unavailable()) } else { Ok(envelope.id) }
            }
        };

        let delivery = harness(5).deliver(event(), &handler).await;

        assert!(delivery.is_acked());
        assert_eq!(delivery.attempts, 3);
        assert_eq!(delivery.result, Ok(EventId::new("evt-1")));
    }

    #[tokio::test]
    async fn permanent_failure_is_dead_lettered_at_once() {
        let calls = AtomicUsize::new(0);
        let handler = |_: EventEnvelope| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(ProcessingError::Permanent("bad payload".to_string())) }
        };

        let delivery = harness(5).deliver(event(), &handler).await;

        assert_eq!(delivery.outcome, DeliveryOutcome::DeadLetter);
        assert_eq!(delivery.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_are_dead_lettered() {
        let handler = |_: EventEnvelope| async { Err::<(), _>(unavailable()) };

        let delivery = harness(2).deliver(event(), &handler).await;

        assert_eq!(delivery.outcome, DeliveryOutcome::DeadLetter);
        assert_eq!(delivery.attempts, 3);
        assert_eq!(delivery.result, Err(unavailable()));
    }

    #[tokio::test]
    async fn redeliveries_keep_identifier_and_payload() {
        let seen = std::sync::Mutex::new(Vec::new());
        let handler = |envelope: EventEnvelope| {
            let mut seen = seen.lock().unwrap();
            seen.push(envelope);
            let fail = seen.len() < 3;
            async move { if fail { Err(unavailable()) } else { Ok(()) } }
        };

        harness(5).deliver(event(), &handler).await;

        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|e| e.id == EventId::new("evt-1") && e.payload == b"payload"));
    }

    #[tokio::test]
    async fn duplicates_are_all_delivered() {
        let calls = AtomicUsize::new(0);
        let handler = |_: EventEnvelope| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, ProcessingError>(()) }
        };

        let deliveries = harness(0).deliver_duplicates(&event(), 4, &handler).await;

        assert_eq!(deliveries.len(), 4);
        assert!(deliveries.iter().all(Delivery::is_acked));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn lease_conflict_waits_for_expiry_within_cap() {
        let harness = DeliveryHarness::new(
            RedeliveryPolicy::builder()
                .initial_delay(Duration::from_millis(1))
                .max_delay(Duration::from_secs(10))
                .jitter(0.0)
                .build(),
            Arc::new(SystemClock),
        );
        let conflict = |secs| ProcessingError::LeaseConflict {
            id: EventId::new("evt-1"),
            expires_at: SystemClock.now() + chrono::Duration::seconds(secs),
        };

        let short = harness.backoff(0, &conflict(3));
        assert!(short > Duration::from_secs(2) && short <= Duration::from_secs(3));
        assert_eq!(harness.backoff(0, &conflict(3600)), Duration::from_secs(10));
        assert_eq!(harness.backoff(0, &unavailable()), Duration::from_millis(1));
    }
}
