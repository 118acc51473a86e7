//! Dedup ledger: the per-identifier `Unseen → Leased → Done` state machine.
//!
//! Every operation is a single [`RecordStore::transact`] call, so the
//! read-decide-write happens atomically against the store. Two concurrent
//! attempts for the same identifier can therefore never both observe
//! `Unseen` (or the same expired lease) and both proceed.
//!
//! # States
//!
//! ```text
//!            decide                 mark_done
//!  Unseen ───────────► Leased ───────────────► Done
//!                      │    ▲
//!                      └────┘
//!            decide after expiry (epoch + 1)
//! ```
//!
//! - `Unseen` is the absence of a record.
//! - `Leased` carries a [`Lease`]: an expiry plus a fencing epoch that grows
//!   every time the identifier is (re-)leased.
//! - `Done` is terminal. No operation ever moves a record out of `Done`.
//!
//! # Lease boundary
//!
//! A lease is live while `expires_at > now`. At `now == expires_at` it is
//! expired and may be re-leased.
//!
//! # Fencing
//!
//! `mark_done`, `checkpoint` and `release` all verify the caller's epoch.
//! An attempt that overran its lease and was superseded by a later attempt
//! gets [`LedgerError::LeaseSuperseded`] instead of completing the record.

use crate::envelope::EventId;
use crate::record_store::{RecordStore, StoreError, Transition, dedup_key};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Errors from ledger operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// The underlying store failed; nothing was decided or written.
    #[error("Ledger store error: {0}")]
    Store(#[from] StoreError),

    /// A later attempt re-leased this identifier after the caller's lease expired.
    #[error("Lease epoch {epoch} on {id} was superseded by epoch {current_epoch}")]
    LeaseSuperseded {
        /// Event identifier
        id: EventId,
        /// The caller's epoch
        epoch: u64,
        /// The epoch now recorded
        current_epoch: u64,
    },

    /// No record exists for this identifier, so there is no lease to act on.
    #[error("No lease recorded for {id} (caller epoch {epoch})")]
    NotLeased {
        /// Event identifier
        id: EventId,
        /// The caller's epoch
        epoch: u64,
    },

    /// The identifier is already `Done`; its progress can no longer change.
    #[error("Event {id} already completed (caller epoch {epoch})")]
    AlreadyCompleted {
        /// Event identifier
        id: EventId,
        /// The caller's epoch
        epoch: u64,
    },

    /// The stored record could not be decoded or encoded.
    #[error("Corrupt dedup record for {id}: {reason}")]
    Codec {
        /// Event identifier
        id: EventId,
        /// Decoder/encoder message
        reason: String,
    },
}

/// A time-bounded exclusive claim on processing an identifier.
///
/// `epoch` is a fencing token: it starts at 1 and increases by one every
/// time an expired lease is reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Fencing token
    pub epoch: u64,
    /// The lease is live strictly before this instant
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Whether the lease still excludes other attempts at `now`.
    #[must_use]
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Persisted dedup state for one identifier. Absence of a record is `Unseen`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DedupRecord {
    /// An attempt holds (or held) a lease and has not completed.
    Leased {
        /// Current lease
        lease: Lease,
        /// Staged output of a multi-step attempt, carried across re-leases
        checkpoint: Option<Vec<u8>>,
    },
    /// The side effect completed.
    Done {
        /// Epoch of the attempt that completed
        epoch: u64,
        /// Completion time
        completed_at: DateTime<Utc>,
        /// Recorded result, replayed to later deliveries
        result: Option<Vec<u8>>,
    },
}

/// Outcome of [`DedupLedger::decide`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The caller owns `lease` and must run the side effect.
    ShouldRun {
        /// The granted lease
        lease: Lease,
        /// Checkpoint left by an earlier, interrupted attempt
        checkpoint: Option<Vec<u8>>,
    },
    /// Already completed; the side effect must not run again.
    AlreadyDone {
        /// Recorded result
        result: Option<Vec<u8>>,
    },
    /// Another attempt owns the identifier until `expires_at`.
    LeaseHeld {
        /// When the other attempt's lease runs out
        expires_at: DateTime<Utc>,
    },
}

impl Decision {
    /// Label for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ShouldRun { .. } => "should_run",
            Self::AlreadyDone { .. } => "already_done",
            Self::LeaseHeld { .. } => "lease_held",
        }
    }
}

/// Outcome of [`DedupLedger::mark_done`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// This call moved the record to `Done`.
    Committed,
    /// The record was already `Done`; the first recorded result is kept.
    AlreadyDone {
        /// Result recorded by the first completion
        result: Option<Vec<u8>>,
    },
}

type Step<T> = Result<(Option<DedupRecord>, T), LedgerError>;

impl DedupRecord {
    /// Decode a record from its stored bytes.
    ///
    /// # Errors
    ///
    /// Returns a bincode error if the bytes are not a valid record.
    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Encode a record for storage.
    ///
    /// # Errors
    ///
    /// Returns a bincode error if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Whether the record is terminal.
    #[must_use]
    pub const fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. })
    }

    /// Epoch of the latest lease (or of the completing attempt).
    #[must_use]
    pub const fn epoch(&self) -> u64 {
        match self {
            Self::Leased { lease, .. } => lease.epoch,
            Self::Done { epoch, .. } => *epoch,
        }
    }

    /// `decide` transition. Returns the record to write (if any) and the decision.
    #[must_use]
    pub fn on_decide(
        current: Option<&Self>,
        now: DateTime<Utc>,
        lease_duration: Duration,
    ) -> (Option<Self>, Decision) {
        match current {
            None => {
                let lease = Lease {
                    epoch: 1,
                    expires_at: now + lease_duration,
                };
                (
                    Some(Self::Leased {
                        lease,
                        checkpoint: None,
                    }),
                    Decision::ShouldRun {
                        lease,
                        checkpoint: None,
                    },
                )
            },
            Some(Self::Done { result, .. }) => (
                None,
                Decision::AlreadyDone {
                    result: result.clone(),
                },
            ),
            Some(Self::Leased { lease, .. }) if lease.is_live_at(now) => (
                None,
                Decision::LeaseHeld {
                    expires_at: lease.expires_at,
                },
            ),
            Some(Self::Leased { lease, checkpoint }) => {
                let lease = Lease {
                    epoch: lease.epoch + 1,
                    expires_at: now + lease_duration,
                };
                (
                    Some(Self::Leased {
                        lease,
                        checkpoint: checkpoint.clone(),
                    }),
                    Decision::ShouldRun {
                        lease,
                        checkpoint: checkpoint.clone(),
                    },
                )
            },
        }
    }

    /// `claim_once` transition: like `on_decide`, but a granted claim is
    /// recorded as `Done` straight away.
    #[must_use]
    pub fn on_claim_once(current: Option<&Self>, now: DateTime<Utc>) -> (Option<Self>, Decision) {
        let epoch = match current {
            None => 1,
            Some(Self::Leased { lease, .. }) if !lease.is_live_at(now) => lease.epoch + 1,
            Some(_) => return Self::on_decide(current, now, Duration::zero()),
        };
        (
            Some(Self::Done {
                epoch,
                completed_at: now,
                result: None,
            }),
            Decision::ShouldRun {
                lease: Lease {
                    epoch,
                    expires_at: now,
                },
                checkpoint: None,
            },
        )
    }

    /// `mark_done` transition.
    ///
    /// # Errors
    ///
    /// `NotLeased` when absent, `LeaseSuperseded` on an epoch mismatch.
    pub fn on_mark_done(
        current: Option<&Self>,
        id: &EventId,
        lease: &Lease,
        now: DateTime<Utc>,
        result: Option<Vec<u8>>,
    ) -> Step<Completion> {
        match current {
            None => Err(LedgerError::NotLeased {
                id: id.clone(),
                epoch: lease.epoch,
            }),
            Some(Self::Done { result, .. }) => Ok((
                None,
                Completion::AlreadyDone {
                    result: result.clone(),
                },
            )),
            Some(Self::Leased { lease: held, .. }) if held.epoch == lease.epoch => Ok((
                Some(Self::Done {
                    epoch: lease.epoch,
                    completed_at: now,
                    result,
                }),
                Completion::Committed,
            )),
            Some(Self::Leased { lease: held, .. }) => Err(LedgerError::LeaseSuperseded {
                id: id.clone(),
                epoch: lease.epoch,
                current_epoch: held.epoch,
            }),
        }
    }

    /// `checkpoint` transition. The first checkpoint written wins.
    ///
    /// # Errors
    ///
    /// `NotLeased` when absent, `AlreadyCompleted` when done,
    /// `LeaseSuperseded` on an epoch mismatch.
    pub fn on_checkpoint(
        current: Option<&Self>,
        id: &EventId,
        lease: &Lease,
        data: Vec<u8>,
    ) -> Step<Vec<u8>> {
        match current {
            None => Err(LedgerError::NotLeased {
                id: id.clone(),
                epoch: lease.epoch,
            }),
            Some(Self::Done { .. }) => Err(LedgerError::AlreadyCompleted {
                id: id.clone(),
                epoch: lease.epoch,
            }),
            Some(Self::Leased { lease: held, .. }) if held.epoch != lease.epoch => {
                Err(LedgerError::LeaseSuperseded {
                    id: id.clone(),
                    epoch: lease.epoch,
                    current_epoch: held.epoch,
                })
            },
            Some(Self::Leased {
                checkpoint: Some(existing),
                ..
            }) => Ok((None, existing.clone())),
            Some(Self::Leased {
                lease: held,
                checkpoint: None,
            }) => Ok((
                Some(Self::Leased {
                    lease: *held,
                    checkpoint: Some(data.clone()),
                }),
                data,
            )),
        }
    }

    /// `release` transition: expire the caller's own lease at `now`.
    #[must_use]
    pub fn on_release(current: Option<&Self>, lease: &Lease, now: DateTime<Utc>) -> (Option<Self>, bool) {
        match current {
            Some(Self::Leased {
                lease: held,
                checkpoint,
            }) if held.epoch == lease.epoch && held.is_live_at(now) => (
                Some(Self::Leased {
                    lease: Lease {
                        epoch: held.epoch,
                        expires_at: now,
                    },
                    checkpoint: checkpoint.clone(),
                }),
                true,
            ),
            _ => (None, false),
        }
    }
}

/// Ledger configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerConfig {
    /// How long a granted lease excludes other attempts.
    ///
    /// Must be at least the longest expected single attempt (including all
    /// downstream calls); otherwise a slow but healthy attempt gets preempted.
    pub lease_duration: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::seconds(60),
        }
    }
}

impl LedgerConfig {
    /// Configuration with the given lease duration, raised to
    /// [`min_lease_duration`] if shorter.
    #[must_use]
    pub fn with_lease_duration(lease_duration: Duration) -> Self {
        Self {
            lease_duration: lease_duration.max(min_lease_duration()),
        }
    }
}

/// Shortest lease the ledger grants. Shorter requests are raised to it.
#[must_use]
pub fn min_lease_duration() -> Duration {
    Duration::seconds(1)
}

/// The dedup ledger.
///
/// Cheap to clone; clones share the same store handle.
pub struct DedupLedger<S> {
    store: Arc<S>,
    config: LedgerConfig,
}

impl<S> Clone for DedupLedger<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: self.config,
        }
    }
}

impl<S: RecordStore> DedupLedger<S> {
    /// Create a ledger over `store`.
    #[must_use]
    pub const fn new(store: Arc<S>, config: LedgerConfig) -> Self {
        Self { store, config }
    }

    /// Configured lease duration.
    #[must_use]
    pub const fn lease_duration(&self) -> Duration {
        self.config.lease_duration
    }

    /// The underlying store.
    #[must_use]
    pub const fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Decide whether the caller should run the side effect for `id`.
    ///
    /// - no record: lease it, `ShouldRun`
    /// - `Done`: `AlreadyDone` with the recorded result
    /// - live lease (`expires_at > now`): `LeaseHeld`
    /// - expired lease (`expires_at <= now`): re-lease with the next epoch, `ShouldRun`
    ///
    /// # Errors
    ///
    /// - `Store`: transient store failure; the caller must not run the side effect
    /// - `Codec`: the stored record is corrupt
    #[tracing::instrument(skip(self), fields(event_id = %id))]
    pub async fn decide(
        &self,
        id: &EventId,
        now: DateTime<Utc>,
        lease_duration: Duration,
    ) -> Result<Decision, LedgerError> {
        let lease_duration = if lease_duration < min_lease_duration() {
            tracing::warn!(%lease_duration, "Lease duration too short, using the minimum");
            min_lease_duration()
        } else {
            lease_duration
        };

        let decision = self
            .store
            .transact(&dedup_key(id), |current| {
                apply(id, current, |record| {
                    Ok(DedupRecord::on_decide(record, now, lease_duration))
                })
            })
            .await??;

        match &decision {
            Decision::ShouldRun { lease, checkpoint } => tracing::debug!(
                epoch = lease.epoch,
                expires_at = %lease.expires_at,
                resumed = checkpoint.is_some(),
                "Lease granted"
            ),
            Decision::AlreadyDone { .. } => tracing::debug!("Already done, skipping"),
            Decision::LeaseHeld { expires_at } => {
                tracing::debug!(%expires_at, "Lease held by another attempt");
            },
        }
        metrics::counter!("ledger_decisions_total", "decision" => decision.as_str()).increment(1);

        Ok(decision)
    }

    /// Relaxed variant of [`decide`](Self::decide) that records `Done` as soon
    /// as the claim is granted.
    ///
    /// This removes the `LeaseHeld` stall for retries of a crashed attempt, at
    /// the price of a weaker guarantee: if the attempt crashes after claiming,
    /// the side effect is never performed. Use only where "at most once" is
    /// acceptable.
    ///
    /// # Errors
    ///
    /// Same as [`decide`](Self::decide).
    #[tracing::instrument(skip(self), fields(event_id = %id))]
    pub async fn claim_once(&self, id: &EventId, now: DateTime<Utc>) -> Result<Decision, LedgerError> {
        let decision = self
            .store
            .transact(&dedup_key(id), |current| {
                apply(id, current, |record| Ok(DedupRecord::on_claim_once(record, now)))
            })
            .await??;

        metrics::counter!("ledger_claims_total", "decision" => decision.as_str()).increment(1);
        Ok(decision)
    }

    /// Transition the caller's lease to `Done`, recording `result`.
    ///
    /// Calling it again after success is harmless and returns
    /// `Completion::AlreadyDone` with the first recorded result.
    ///
    /// # Errors
    ///
    /// - `LeaseSuperseded`: the caller's lease expired and a later attempt took over
    /// - `NotLeased`: there is no record for `id`
    /// - `Store` / `Codec`: as for [`decide`](Self::decide)
    #[tracing::instrument(skip(self, lease, result), fields(event_id = %id, epoch = lease.epoch))]
    pub async fn mark_done(
        &self,
        id: &EventId,
        lease: &Lease,
        now: DateTime<Utc>,
        result: Option<Vec<u8>>,
    ) -> Result<Completion, LedgerError> {
        let completion = self
            .store
            .transact(&dedup_key(id), |current| {
                apply(id, current, |record| {
                    DedupRecord::on_mark_done(record, id, lease, now, result)
                })
            })
            .await?
            .inspect_err(|error| tracing::warn!(%error, "Refusing to complete"))?;

        match completion {
            Completion::Committed => {
                tracing::info!("Marked done");
                metrics::counter!("ledger_completions_total").increment(1);
            },
            Completion::AlreadyDone { .. } => tracing::debug!("Already marked done"),
        }
        Ok(completion)
    }

    /// Record the staged output of a multi-step attempt under the caller's lease.
    ///
    /// Only the first checkpoint is kept; the recorded checkpoint is returned,
    /// which may differ from `data` if an earlier attempt got there first.
    ///
    /// # Errors
    ///
    /// `LeaseSuperseded`, `NotLeased`, `AlreadyCompleted`, `Store`, `Codec`.
    #[tracing::instrument(skip(self, lease, data), fields(event_id = %id, epoch = lease.epoch))]
    pub async fn checkpoint(
        &self,
        id: &EventId,
        lease: &Lease,
        data: Vec<u8>,
    ) -> Result<Vec<u8>, LedgerError> {
        self.store
            .transact(&dedup_key(id), |current| {
                apply(id, current, |record| DedupRecord::on_checkpoint(record, id, lease, data))
            })
            .await?
    }

    /// Give up the caller's lease after a failed attempt.
    ///
    /// The lease expiry is pulled back to `now` so that a redelivery can
    /// reclaim immediately. Returns `false` (and writes nothing) if the lease
    /// was already expired, superseded, or completed.
    ///
    /// # Errors
    ///
    /// `Store` / `Codec`.
    #[tracing::instrument(skip(self, lease), fields(event_id = %id, epoch = lease.epoch))]
    pub async fn release(
        &self,
        id: &EventId,
        lease: &Lease,
        now: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let released = self
            .store
            .transact(&dedup_key(id), |current| {
                apply(id, current, |record| Ok(DedupRecord::on_release(record, lease, now)))
            })
            .await??;

        if released {
            tracing::debug!("Lease released");
        }
        Ok(released)
    }

    /// Read the current record for `id` (`None` means `Unseen`).
    ///
    /// # Errors
    ///
    /// `Store` / `Codec`.
    pub async fn inspect(&self, id: &EventId) -> Result<Option<DedupRecord>, LedgerError> {
        self.store
            .get(&dedup_key(id))
            .await?
            .map(|bytes| DedupRecord::decode(&bytes))
            .transpose()
            .map_err(|e| codec(id, &e))
    }
}

fn codec(id: &EventId, error: &bincode::Error) -> LedgerError {
    LedgerError::Codec {
        id: id.clone(),
        reason: error.to_string(),
    }
}

/// Run a record transition inside a store transaction.
///
/// Decoding, the transition itself and encoding all happen inside the
/// transaction function; any failure leaves the key untouched and is carried
/// out through the transaction output.
fn apply<T, F>(id: &EventId, current: Option<&[u8]>, step: F) -> Transition<Result<T, LedgerError>>
where
    F: FnOnce(Option<&DedupRecord>) -> Step<T>,
{
    let record = match current.map(DedupRecord::decode).transpose() {
        Ok(record) => record,
        Err(e) => return Transition::keep(Err(codec(id, &e))),
    };

    match step(record.as_ref()) {
        Ok((Some(next), output)) => match next.encode() {
            Ok(bytes) => Transition::put(bytes, Ok(output)),
            Err(e) => Transition::keep(Err(codec(id, &e))),
        },
        Ok((None, output)) => Transition::keep(Ok(output)),
        Err(e) => Transition::keep(Err(e)),
    }
}
