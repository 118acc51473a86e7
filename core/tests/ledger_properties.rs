//! Property tests for the dedup record state machine.

#![allow(clippy::unwrap_used)] // Tests can unwrap

use chrono::{DateTime, Duration, Utc};
use exactly_once_core::{Decision, DedupRecord, EventId, Lease};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Decide,
    ClaimOnce,
    MarkDone { stale: bool },
    Checkpoint(u8),
    Release,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => Just(Op::Decide),
        1 => Just(Op::ClaimOnce),
        2 => any::<bool>().prop_map(|stale| Op::MarkDone { stale }),
        2 => any::<u8>().prop_map(Op::Checkpoint),
        2 => Just(Op::Release),
    ]
}

fn start() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

proptest! {
    #[test]
    fn record_history_is_well_behaved(
        steps in prop::collection::vec((op(), 0i64..45), 1..60),
    ) {
        let id = EventId::new("evt-prop");
        let lease_duration = Duration::seconds(30);
        let mut now = start();
        let mut record: Option<DedupRecord> = None;
        let mut granted: Vec<Lease> = Vec::new();
        let mut done: Option<DedupRecord> = None;

        for (op, advance) in steps {
            now += Duration::seconds(advance);
            let before = record.clone();
            let latest = granted.last().copied();

            let next = match op {
                Op::Decide => {
                    let (next, decision) = DedupRecord::on_decide(record.as_ref(), now, lease_duration);
                    if let Decision::ShouldRun { lease, .. } = decision {
                        // Only one holder at a time, and epochs strictly increase
                        if let Some(previous) = latest {
                            prop_assert!(!previous.is_live_at(now) || before.as_ref().is_some_and(DedupRecord::is_done));
                            prop_assert!(lease.epoch > previous.epoch);
                        }
                        granted.push(lease);
                    }
                    next
                },
                Op::ClaimOnce => {
                    let (next, decision) = DedupRecord::on_claim_once(record.as_ref(), now);
                    if let Decision::ShouldRun { lease, .. } = decision {
                        granted.push(lease);
                    }
                    next
                },
                Op::MarkDone { stale } => {
                    let Some(lease) = latest else { continue };
                    let lease = if stale && lease.epoch > 1 {
                        Lease { epoch: lease.epoch - 1, ..lease }
                    } else {
                        lease
                    };
                    DedupRecord::on_mark_done(record.as_ref(), &id, &lease, now, Some(vec![1]))
                        .map(|(next, _)| next)
                        .unwrap_or(None)
                },
                Op::Checkpoint(byte) => {
                    let Some(lease) = latest else { continue };
                    DedupRecord::on_checkpoint(record.as_ref(), &id, &lease, vec![byte])
                        .map(|(next, _)| next)
                        .unwrap_or(None)
                },
                Op::Release => {
                    let Some(lease) = latest else { continue };
                    let (next, released) = DedupRecord::on_release(record.as_ref(), &lease, now);
                    if released {
                        if let Some(last) = granted.last_mut() {
                            last.expires_at = now;
                        }
                    }
                    next
                },
            };

            if let Some(next) = next {
                if let Some(previous) = &before {
                    prop_assert!(!previous.is_done(), "a Done record was overwritten");
                    prop_assert!(next.epoch() >= previous.epoch());
                }
                record = Some(next);
            }

            if let Some(frozen) = &done {
                prop_assert_eq!(record.as_ref(), Some(frozen));
            } else if record.as_ref().is_some_and(DedupRecord::is_done) {
                done.clone_from(&record);
            }
        }
    }

    #[test]
    fn checkpoint_survives_every_re_lease(gaps in prop::collection::vec(30i64..600, 1..10)) {
        let id = EventId::new("evt-prop");
        let lease_duration = Duration::seconds(30);
        let mut now = start();

        let (record, decision) = DedupRecord::on_decide(None, now, lease_duration);
        let Decision::ShouldRun { lease, .. } = decision else {
            return Err(TestCaseError::fail("fresh identifier must be granted"));
        };
        let (record, _) = DedupRecord::on_checkpoint(record.as_ref(), &id, &lease, b"order".to_vec()).unwrap();
        let mut record = record.unwrap();

        for gap in gaps {
            now += Duration::seconds(gap);
            let (next, decision) = DedupRecord::on_decide(Some(&record), now, lease_duration);
            let Decision::ShouldRun { checkpoint, .. } = decision else {
                return Err(TestCaseError::fail("expired lease must be reclaimable"));
            };
            prop_assert_eq!(checkpoint, Some(b"order".to_vec()));
            record = next.unwrap();
        }
    }
}
