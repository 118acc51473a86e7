//! The two demo runs: the order pipeline under duplicate delivery, and the
//! processing policies side by side.

use crate::config::DemoConfig;
use anyhow::Context;
use exactly_once_core::environment::{Clock, SystemClock};
use exactly_once_core::pipeline::{ASSIGN_COOK, NOTIFY_COOK};
use exactly_once_core::{
    DedupLedger, DeliveryOutcome, EventEnvelope, EventId, IdempotentProcessor, LedgerConfig,
    OrderPipeline, OrderRequest, ProcessingPolicy, ProcessorConfig, RecordStore,
};
use exactly_once_postgres::DeadLetterQueue;
use exactly_once_runtime::{DeliveryHarness, RedeliveryPolicy};
use exactly_once_testing::{FaultInjectingInvoker, InMemoryRecordStore, RecordingInvoker};
use std::sync::Arc;
use std::time::Duration;

const MEALS: [&str; 5] = ["ramen", "paella", "tagine", "pierogi", "feijoada"];

/// What happened to a batch of duplicate-delivered orders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KitchenSummary {
    /// Deliveries attempted (orders × copies)
    pub deliveries: usize,
    /// Deliveries that ended in an ack
    pub acked: usize,
    /// Acked deliveries that replayed an earlier result
    pub replayed: usize,
    /// Deliveries handed to the dead-letter path
    pub dead_lettered: usize,
    /// Handler invocations across all deliveries
    pub attempts: usize,
    /// Cook assignments the kitchen actually performed
    pub cooks_assigned: usize,
    /// Notifications the kitchen actually sent
    pub cooks_notified: usize,
    /// Kitchen calls failed on purpose
    pub injected_faults: usize,
}

/// Side effects observed for one processing policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyReport {
    /// The policy
    pub policy: ProcessingPolicy,
    /// Service calls actually executed
    pub calls: usize,
    /// Documents stored
    pub documents: usize,
}

fn redelivery_policy(config: &DemoConfig) -> RedeliveryPolicy {
    RedeliveryPolicy::builder()
        .max_retries(config.delivery.max_retries)
        .initial_delay(Duration::from_millis(config.delivery.initial_delay_ms))
        .max_delay(Duration::from_millis(config.delivery.max_delay_ms))
        .build()
}

/// Place `config.orders` orders, deliver each `config.duplicate_deliveries`
/// times concurrently through a flaky kitchen, and report what happened.
///
/// Dead-lettered deliveries are written to `dead_letters` when given.
///
/// # Errors
///
/// Returns an error if a dead letter cannot be recorded.
pub async fn run_orders<S>(
    store: Arc<S>,
    config: &DemoConfig,
    dead_letters: Option<&DeadLetterQueue>,
) -> anyhow::Result<KitchenSummary>
where
    S: RecordStore + 'static,
{
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let kitchen = Arc::new(RecordingInvoker::new().with_latency(config.kitchen_latency()));
    let flaky = Arc::new(FaultInjectingInvoker::new(
        kitchen.clone(),
        config.faults.rate,
        config.faults.seed,
    ));
    let ledger = DedupLedger::new(
        store,
        LedgerConfig::with_lease_duration(config.lease_duration()),
    );
    let pipeline = Arc::new(OrderPipeline::new(ledger, flaky.clone(), Arc::clone(&clock)));
    let harness = DeliveryHarness::new(redelivery_policy(config), Arc::clone(&clock));

    let mut summary = KitchenSummary::default();
    for n in 0..config.orders {
        let request = OrderRequest {
            meal: MEALS[n % MEALS.len()].to_string(),
        };
        let envelope = EventEnvelope::new(EventId::generate(), request.to_payload()?, clock.now());
        tracing::info!(event_id = %envelope.id, meal = %request.meal, "Order placed");

        let deliveries = harness
            .deliver_duplicates(&envelope, config.duplicate_deliveries, &|envelope| {
                let pipeline = Arc::clone(&pipeline);
                async move { pipeline.process(&envelope).await }
            })
            .await;

        for delivery in deliveries {
            summary.deliveries += 1;
            summary.attempts += delivery.attempts;
            match (&delivery.outcome, &delivery.result) {
                (DeliveryOutcome::Ack, Ok(outcome)) => {
                    summary.acked += 1;
                    if outcome.replayed {
                        summary.replayed += 1;
                    }
                },
                (_, Err(error)) => {
                    summary.dead_lettered += 1;
                    if let Some(queue) = dead_letters {
                        queue
                            .add(&envelope, error, delivery.attempts)
                            .await
                            .context("recording dead letter")?;
                    }
                },
                (_, Ok(_)) => {},
            }
        }
    }

    summary.cooks_assigned = kitchen.executions(ASSIGN_COOK);
    summary.cooks_notified = kitchen.executions(NOTIFY_COOK);
    summary.injected_faults = flaky.injected();

    Ok(summary)
}

/// Deliver one event `copies` times concurrently under every policy, each
/// against a fresh in-memory store, and count the resulting side effects.
pub async fn compare_policies(config: &DemoConfig, copies: usize) -> Vec<PolicyReport> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let harness = DeliveryHarness::new(redelivery_policy(config), Arc::clone(&clock));
    let mut reports = Vec::new();

    for policy in [
        ProcessingPolicy::Unguarded,
        ProcessingPolicy::KeyedWrite,
        ProcessingPolicy::LedgerGated,
        ProcessingPolicy::ClaimOnce,
    ] {
        let store = Arc::new(InMemoryRecordStore::new());
        let email = Arc::new(RecordingInvoker::new().with_latency(config.kitchen_latency()));
        let ledger = DedupLedger::new(
            Arc::clone(&store),
            LedgerConfig::with_lease_duration(config.lease_duration()),
        );
        let processor_config = ProcessorConfig::default().with_policy(policy);
        let processor = Arc::new(IdempotentProcessor::new(
            ledger,
            email.clone(),
            Arc::clone(&clock),
            processor_config.clone(),
        ));

        let envelope = EventEnvelope::new("welcome-email", b"hello".to_vec(), clock.now());
        harness
            .deliver_duplicates(&envelope, copies, &|envelope| {
                let processor = Arc::clone(&processor);
                async move { processor.process(&envelope).await }
            })
            .await;

        let report = PolicyReport {
            policy,
            calls: email.executions(&processor_config.service),
            documents: store
                .keys_with_prefix(&format!("{}/", processor_config.collection))
                .len(),
        };
        tracing::info!(
            policy = policy.as_str(),
            calls = report.calls,
            documents = report.documents,
            "Policy compared"
        );
        reports.push(report);
    }

    reports
}
