//! Redelivery behaviour of each processing policy.

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect
#![allow(clippy::panic)] // Tests can panic on unexpected outcomes

use chrono::Duration;
use exactly_once_core::environment::Clock;
use exactly_once_core::{
    DedupLedger, DedupRecord, DeliveryOutcome, EventEnvelope, EventId, IdempotentProcessor,
    InvokeError, LedgerConfig, Processed, ProcessingError, ProcessingPolicy, ProcessorConfig,
    ServiceCall, SideEffectInvoker,
};
use exactly_once_testing::{
    FaultInjectingInvoker, FaultPoint, InMemoryRecordStore, ManualClock, RecordingInvoker, test_clock,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

struct Fixture {
    store: Arc<InMemoryRecordStore>,
    invoker: Arc<RecordingInvoker>,
    clock: ManualClock,
    processor: Arc<IdempotentProcessor<InMemoryRecordStore>>,
}

fn fixture(policy: ProcessingPolicy) -> Fixture {
    fixture_with(policy, RecordingInvoker::new())
}

fn fixture_with(policy: ProcessingPolicy, invoker: RecordingInvoker) -> Fixture {
    let store = Arc::new(InMemoryRecordStore::new());
    let invoker = Arc::new(invoker);
    let clock = ManualClock::new(test_clock().now());
    let ledger = DedupLedger::new(
        Arc::clone(&store),
        LedgerConfig::with_lease_duration(Duration::seconds(30)),
    );
    let processor = IdempotentProcessor::new(
        ledger,
        invoker.clone(),
        Arc::new(clock.clone()),
        ProcessorConfig::default().with_policy(policy),
    );
    Fixture {
        store,
        invoker,
        clock,
        processor: Arc::new(processor),
    }
}

fn envelope(fixture: &Fixture) -> EventEnvelope {
    EventEnvelope::new("evt-1", b"welcome aboard".to_vec(), fixture.clock.now())
}

async fn deliver_three_times(fixture: &Fixture) -> Vec<Processed> {
    let event = envelope(fixture);
    let mut outcomes = Vec::new();
    for _ in 0..3 {
        fixture.clock.advance(Duration::seconds(1));
        let attempt = event.redelivered_at(fixture.clock.now());
        outcomes.push(fixture.processor.process(&attempt).await.unwrap());
    }
    outcomes
}

#[tokio::test]
async fn unguarded_duplicates_everything() {
    let fixture = fixture(ProcessingPolicy::Unguarded);
    deliver_three_times(&fixture).await;

    assert_eq!(fixture.invoker.executions("email"), 3);
    assert_eq!(fixture.store.keys_with_prefix("documents/").len(), 3);
}

#[tokio::test]
async fn keyed_write_dedups_documents_but_not_calls() {
    let fixture = fixture(ProcessingPolicy::KeyedWrite);
    deliver_three_times(&fixture).await;

    assert_eq!(fixture.invoker.executions("email"), 3);
    assert_eq!(
        fixture.store.keys_with_prefix("documents/"),
        vec!["documents/evt-1".to_string()]
    );
}

#[tokio::test]
async fn ledger_gated_runs_once_and_replays() {
    let fixture = fixture(ProcessingPolicy::LedgerGated);
    let outcomes = deliver_three_times(&fixture).await;

    assert_eq!(
        outcomes,
        vec![
            Processed::Ran {
                result: b"email-1".to_vec()
            },
            Processed::Replayed {
                result: Some(b"email-1".to_vec())
            },
            Processed::Replayed {
                result: Some(b"email-1".to_vec())
            },
        ]
    );
    assert_eq!(fixture.invoker.executions("email"), 1);
    assert_eq!(fixture.store.keys_with_prefix("documents/").len(), 1);
}

#[tokio::test]
async fn ledger_gated_concurrent_redeliveries_run_once() {
    let fixture = fixture_with(
        ProcessingPolicy::LedgerGated,
        RecordingInvoker::new().with_latency(std::time::Duration::from_millis(20)),
    );
    let event = envelope(&fixture);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let processor = Arc::clone(&fixture.processor);
            let event = event.clone();
            tokio::spawn(async move { processor.process(&event).await })
        })
        .collect();

    let mut ran = 0;
    for handle in handles {
        match handle.await.expect("task panicked") {
            Ok(Processed::Ran { .. }) => ran += 1,
            Ok(Processed::Replayed { .. }) | Err(ProcessingError::LeaseConflict { .. }) => {},
            Err(other) => panic!("unexpected failure: {other}"),
        }
    }

    assert_eq!(ran, 1);
    assert_eq!(fixture.invoker.executions("email"), 1);
}

#[tokio::test]
async fn ledger_gated_failure_is_retried_and_lease_released() {
    let fixture = fixture(ProcessingPolicy::LedgerGated);
    fixture.invoker.fail_next("email", 1);
    let event = envelope(&fixture);

    let first = fixture.processor.process(&event).await;
    assert!(matches!(first, Err(ProcessingError::TransientService { .. })));
    assert_eq!(DeliveryOutcome::from_result(&first), DeliveryOutcome::Retry);

    // Redelivered immediately: the released lease does not stall it
    let second = fixture.processor.process(&event).await.unwrap();
    assert!(matches!(second, Processed::Ran { .. }));
    assert_eq!(fixture.invoker.attempts("email"), 2);
    assert_eq!(fixture.invoker.executions("email"), 1);
}

/// Succeeds, then takes the store down for the next transaction.
struct OutageAfterCall {
    inner: RecordingInvoker,
    store: Arc<InMemoryRecordStore>,
}

impl SideEffectInvoker for OutageAfterCall {
    fn call(
        &self,
        service: &str,
        call: ServiceCall,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, InvokeError>> + Send + '_>> {
        let service = service.to_string();
        Box::pin(async move {
            let response = self.inner.call(&service, call).await?;
            self.store.fail_next(1);
            Ok(response)
        })
    }
}

#[tokio::test]
async fn failed_commit_releases_lease_for_immediate_redelivery() {
    let store = Arc::new(InMemoryRecordStore::new());
    let invoker = Arc::new(OutageAfterCall {
        inner: RecordingInvoker::new(),
        store: Arc::clone(&store),
    });
    let clock = ManualClock::new(test_clock().now());
    let ledger = DedupLedger::new(
        Arc::clone(&store),
        LedgerConfig::with_lease_duration(Duration::seconds(30)),
    );
    let processor = IdempotentProcessor::new(
        ledger.clone(),
        invoker.clone(),
        Arc::new(clock.clone()),
        ProcessorConfig::default(),
    );
    let event = EventEnvelope::new("evt-1", b"welcome aboard".to_vec(), clock.now());

    // The call went out, but mark_done hit the outage
    let first = processor.process(&event).await;
    assert!(matches!(first, Err(ProcessingError::TransientStore(_))));
    assert_eq!(DeliveryOutcome::from_result(&first), DeliveryOutcome::Retry);

    let record = ledger.inspect(&event.id).await.unwrap().expect("record kept");
    let DedupRecord::Leased { lease, .. } = record else {
        panic!("expected a leased record, got {record:?}");
    };
    assert!(!lease.is_live_at(clock.now()));

    // No clock advance: the redelivery must not wait out the lease
    let second = processor.process(&event).await.unwrap();
    assert!(matches!(second, Processed::Ran { .. }));
    assert!(ledger.inspect(&event.id).await.unwrap().unwrap().is_done());

    // The repeated call carries the same idempotency key
    let executed = invoker.inner.executed("email");
    assert_eq!(executed.len(), 2);
    assert!(executed.iter().all(|call| call.idempotency_key == event.id));
}

#[tokio::test]
async fn lost_response_repeats_call_with_same_idempotency_key() {
    let fixture = fixture(ProcessingPolicy::LedgerGated);
    fixture.invoker.lose_next_responses("email", 1);
    let event = envelope(&fixture);

    assert!(fixture.processor.process(&event).await.is_err());
    fixture.processor.process(&event).await.unwrap();

    // The service saw the request twice and can deduplicate on the key
    let executed = fixture.invoker.executed("email");
    assert_eq!(executed.len(), 2);
    assert!(
        executed
            .iter()
            .all(|call| call.idempotency_key == EventId::new("evt-1"))
    );
}

#[tokio::test]
async fn store_outage_fails_attempt_before_side_effect() {
    let fixture = fixture(ProcessingPolicy::LedgerGated);
    fixture.store.fail_next(1);
    let event = envelope(&fixture);

    let first = fixture.processor.process(&event).await;
    assert!(matches!(first, Err(ProcessingError::TransientStore(_))));
    assert_eq!(fixture.invoker.attempts("email"), 0);

    fixture.processor.process(&event).await.unwrap();
    assert_eq!(fixture.invoker.executions("email"), 1);
}

#[tokio::test]
async fn claim_once_never_repeats_but_can_drop() {
    let fixture = fixture(ProcessingPolicy::ClaimOnce);
    fixture.invoker.fail_next("email", 1);
    let event = envelope(&fixture);

    assert!(fixture.processor.process(&event).await.is_err());
    let retried = fixture.processor.process(&event).await.unwrap();

    assert_eq!(retried, Processed::Replayed { result: None });
    assert_eq!(fixture.invoker.executions("email"), 0);
}

#[tokio::test]
async fn default_policy_is_ledger_gated() {
    let fixture = fixture(ProcessingPolicy::default());
    assert_eq!(fixture.processor.policy(), ProcessingPolicy::LedgerGated);
}

#[tokio::test]
async fn random_lost_responses_repeat_the_call_until_one_lands() {
    let store = Arc::new(InMemoryRecordStore::new());
    let email = Arc::new(RecordingInvoker::new());
    let lossy = Arc::new(FaultInjectingInvoker::new(email.clone(), 0.5, 11).at(FaultPoint::Response));
    let clock = ManualClock::new(test_clock().now());
    let processor = IdempotentProcessor::new(
        DedupLedger::new(Arc::clone(&store), LedgerConfig::with_lease_duration(Duration::seconds(30))),
        lossy.clone(),
        Arc::new(clock.clone()),
        ProcessorConfig::default(),
    );
    let event = EventEnvelope::new("evt-lossy", b"hi".to_vec(), clock.now());

    let mut delivered = None;
    for _ in 0..64 {
        let result = processor.process(&event.redelivered_at(clock.now())).await;
        if result.is_ok() {
            delivered = Some(result);
            break;
        }
        assert_eq!(DeliveryOutcome::from_result(&result), DeliveryOutcome::Retry);
    }

    assert!(matches!(delivered, Some(Ok(Processed::Ran { .. }))));
    let executed = email.executed("email");
    assert_eq!(executed.len(), lossy.injected() + 1);
    assert!(executed.iter().all(|call| call.idempotency_key == EventId::new("evt-lossy")));
    assert_eq!(store.keys_with_prefix("documents/").len(), 1);

    let again = processor.process(&event).await.unwrap();
    assert!(matches!(again, Processed::Replayed { .. }));
    assert_eq!(email.executions("email"), executed.len());
}
