//! Idempotent processor: per-event business logic behind a dedup policy.
//!
//! The business logic itself is deliberately small: persist the event payload
//! as a document and call one downstream service (store a document, send an
//! email). What varies is how much protection surrounds it.
//!
//! | Policy        | Duplicate documents | Duplicate service calls |
//! |---------------|---------------------|-------------------------|
//! | `Unguarded`   | yes                 | yes                     |
//! | `KeyedWrite`  | no                  | yes                     |
//! | `LedgerGated` | no                  | no                      |
//! | `ClaimOnce`   | no                  | no (but may drop one)   |

use crate::envelope::EventEnvelope;
use crate::environment::Clock;
use crate::error::ProcessingError;
use crate::invoker::{ServiceCall, SideEffectInvoker};
use crate::ledger::{Completion, Decision, DedupLedger, Lease};
use crate::record_store::{RecordStore, Transition, document_key};
use std::sync::Arc;
use std::time::Instant;

/// How a processor protects its side effect against redelivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessingPolicy {
    /// No dedup at all: call the service, then blind-insert the document
    /// under a fresh key. Redelivery produces duplicates of both.
    Unguarded,
    /// Write the document keyed by event identifier with create-if-absent
    /// semantics, then call the service unconditionally. Documents are never
    /// duplicated; service calls still are.
    KeyedWrite,
    /// Gate the whole side effect behind the dedup ledger. Exactly-once for
    /// both the document and the call; concurrent redeliveries of the same
    /// identifier are serialized (the loser fails with `LeaseConflict`).
    #[default]
    LedgerGated,
    /// Relaxed ledger mode: the record is marked `Done` the moment the claim
    /// is granted. No `LeaseHeld` stalls after a crash, but a crash between
    /// claim and side effect means the side effect never happens.
    ClaimOnce,
}

impl ProcessingPolicy {
    /// Label for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Unguarded => "unguarded",
            Self::KeyedWrite => "keyed_write",
            Self::LedgerGated => "ledger_gated",
            Self::ClaimOnce => "claim_once",
        }
    }
}

/// Processor configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorConfig {
    /// Dedup policy
    pub policy: ProcessingPolicy,
    /// Downstream service called for each event
    pub service: String,
    /// Store collection documents are written to
    pub collection: String,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            policy: ProcessingPolicy::default(),
            service: "email".to_string(),
            collection: "documents".to_string(),
        }
    }
}

impl ProcessorConfig {
    /// Same configuration with a different policy.
    #[must_use]
    pub fn with_policy(mut self, policy: ProcessingPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Result of a successful attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Processed {
    /// The side effect ran in this attempt.
    Ran {
        /// Service response
        result: Vec<u8>,
    },
    /// An earlier attempt already completed; nothing ran.
    Replayed {
        /// Result recorded by the earlier attempt
        result: Option<Vec<u8>>,
    },
}

/// Persists and forwards events under a [`ProcessingPolicy`].
pub struct IdempotentProcessor<S> {
    ledger: DedupLedger<S>,
    invoker: Arc<dyn SideEffectInvoker>,
    clock: Arc<dyn Clock>,
    config: ProcessorConfig,
}

impl<S: RecordStore> IdempotentProcessor<S> {
    /// Create a processor.
    #[must_use]
    pub fn new(
        ledger: DedupLedger<S>,
        invoker: Arc<dyn SideEffectInvoker>,
        clock: Arc<dyn Clock>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            ledger,
            invoker,
            clock,
            config,
        }
    }

    /// Configured policy.
    #[must_use]
    pub const fn policy(&self) -> ProcessingPolicy {
        self.config.policy
    }

    /// Handle one delivery attempt.
    ///
    /// # Errors
    ///
    /// - `TransientStore` / `TransientService`: nothing committed past the
    ///   commit point; redeliver
    /// - `LeaseConflict`: another attempt owns the identifier; redeliver later
    /// - `LeaseLost`: this attempt was superseded; redeliver
    #[tracing::instrument(
        skip(self, envelope),
        fields(event_id = %envelope.id, policy = self.config.policy.as_str())
    )]
    pub async fn process(&self, envelope: &EventEnvelope) -> Result<Processed, ProcessingError> {
        let started = Instant::now();
        let result = match self.config.policy {
            ProcessingPolicy::Unguarded => self.unguarded(envelope).await,
            ProcessingPolicy::KeyedWrite => self.keyed_write(envelope).await,
            ProcessingPolicy::LedgerGated => self.ledger_gated(envelope).await,
            ProcessingPolicy::ClaimOnce => self.claim_once(envelope).await,
        };

        let outcome = match &result {
            Ok(Processed::Ran { .. }) => "ran",
            Ok(Processed::Replayed { .. }) => "replayed",
            Err(e) => e.kind(),
        };
        metrics::counter!(
            "processor_attempts_total",
            "policy" => self.config.policy.as_str(),
            "outcome" => outcome
        )
        .increment(1);
        metrics::histogram!("processor_attempt_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        match &result {
            Ok(_) => tracing::info!(outcome, "Attempt succeeded"),
            Err(error) => tracing::warn!(%error, outcome, "Attempt failed"),
        }
        result
    }

    async fn unguarded(&self, envelope: &EventEnvelope) -> Result<Processed, ProcessingError> {
        let result = self.call_service(envelope).await?;

        let key = document_key(&self.config.collection, uuid::Uuid::new_v4());
        let document = envelope.payload.clone();
        self.ledger
            .store()
            .transact(&key, move |_| Transition::put(document, ()))
            .await?;

        Ok(Processed::Ran { result })
    }

    async fn keyed_write(&self, envelope: &EventEnvelope) -> Result<Processed, ProcessingError> {
        let result = self.run_side_effect(envelope).await?;
        Ok(Processed::Ran { result })
    }

    async fn ledger_gated(&self, envelope: &EventEnvelope) -> Result<Processed, ProcessingError> {
        let decision = self
            .ledger
            .decide(&envelope.id, self.clock.now(), self.ledger.lease_duration())
            .await?;

        let lease = match decision {
            Decision::ShouldRun { lease, .. } => lease,
            Decision::AlreadyDone { result } => return Ok(Processed::Replayed { result }),
            Decision::LeaseHeld { expires_at } => {
                return Err(ProcessingError::LeaseConflict {
                    id: envelope.id.clone(),
                    expires_at,
                });
            },
        };

        let result = match self.run_side_effect(envelope).await {
            Ok(result) => result,
            Err(error) => {
                self.release(envelope, &lease).await;
                return Err(error);
            },
        };

        let completion = match self
            .ledger
            .mark_done(&envelope.id, &lease, self.clock.now(), Some(result.clone()))
            .await
        {
            Ok(completion) => completion,
            Err(error) => {
                self.release(envelope, &lease).await;
                return Err(error.into());
            },
        };

        match completion {
            Completion::Committed => Ok(Processed::Ran { result }),
            Completion::AlreadyDone { result } => {
                tracing::warn!("Completed by another attempt while this one was running");
                Ok(Processed::Replayed { result })
            },
        }
    }

    async fn claim_once(&self, envelope: &EventEnvelope) -> Result<Processed, ProcessingError> {
        match self.ledger.claim_once(&envelope.id, self.clock.now()).await? {
            Decision::ShouldRun { .. } => {
                let result = self
                    .run_side_effect(envelope)
                    .await
                    .inspect_err(|error| {
                        tracing::error!(%error, "Side effect failed after claim; it will not be retried");
                    })?;
                Ok(Processed::Ran { result })
            },
            Decision::AlreadyDone { result } => Ok(Processed::Replayed { result }),
            Decision::LeaseHeld { expires_at } => Err(ProcessingError::LeaseConflict {
                id: envelope.id.clone(),
                expires_at,
            }),
        }
    }

    /// Keyed create-if-absent write, then the service call.
    async fn run_side_effect(&self, envelope: &EventEnvelope) -> Result<Vec<u8>, ProcessingError> {
        let key = document_key(&self.config.collection, &envelope.id);
        let created = self
            .ledger
            .store()
            .insert_if_absent(&key, envelope.payload.clone())
            .await?;
        if !created {
            tracing::debug!(%key, "Document already present, write skipped");
        }

        self.call_service(envelope).await
    }

    async fn call_service(&self, envelope: &EventEnvelope) -> Result<Vec<u8>, ProcessingError> {
        let service = self.config.service.as_str();
        self.invoker
            .call(service, ServiceCall::new(envelope.id.clone(), envelope.payload.clone()))
            .await
            .map_err(|e| ProcessingError::service(service, e))
    }

    async fn release(&self, envelope: &EventEnvelope, lease: &Lease) {
        if let Err(error) = self.ledger.release(&envelope.id, lease, self.clock.now()).await {
            tracing::warn!(%error, "Could not release lease; it will expire on its own");
        }
    }
}
