//! Attempt-level error taxonomy and its mapping onto delivery outcomes.
//!
//! The core never swallows a failure that happened before the commit point
//! (`mark_done`): any such failure surfaces as an attempt failure so that the
//! delivery infrastructure redelivers the event.

use crate::envelope::EventId;
use crate::invoker::InvokeError;
use crate::ledger::LedgerError;
use crate::record_store::StoreError;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Why a delivery attempt failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessingError {
    /// Store unavailable or transaction conflict. Always safe to retry the
    /// whole event from scratch.
    #[error("Transient store error: {0}")]
    TransientStore(#[from] StoreError),

    /// A downstream call failed before the commit point.
    #[error("Transient failure calling {service}: {source}")]
    TransientService {
        /// Service that failed
        service: String,
        /// Invoker error
        #[source]
        source: InvokeError,
    },

    /// Another attempt holds a live lease. Not a fault: the attempt defers and
    /// the delivery infrastructure retries after the lease runs out.
    #[error("Event {id} is leased by another attempt until {expires_at}")]
    LeaseConflict {
        /// Event identifier
        id: EventId,
        /// Expiry of the other attempt's lease
        expires_at: DateTime<Utc>,
    },

    /// This attempt lost ownership of the identifier (its lease expired and
    /// was reclaimed, or the record changed underneath it). A retry resolves
    /// to `AlreadyDone` or a fresh lease.
    #[error("Attempt on {id} lost its lease: {reason}")]
    LeaseLost {
        /// Event identifier
        id: EventId,
        /// Ledger explanation
        reason: String,
    },

    /// Malformed event. Must not be retried; goes to the dead-letter path.
    #[error("Permanent failure: {0}")]
    Permanent(String),
}

impl ProcessingError {
    /// Whether redelivering the same event may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::Permanent(_))
    }

    /// Wrap an invoker error for `service`.
    #[must_use]
    pub fn service(service: &str, source: InvokeError) -> Self {
        Self::TransientService {
            service: service.to_string(),
            source,
        }
    }

    /// Label for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::TransientStore(_) => "transient_store",
            Self::TransientService { .. } => "transient_service",
            Self::LeaseConflict { .. } => "lease_conflict",
            Self::LeaseLost { .. } => "lease_lost",
            Self::Permanent(_) => "permanent",
        }
    }
}

impl From<LedgerError> for ProcessingError {
    fn from(error: LedgerError) -> Self {
        match error {
            LedgerError::Store(e) => Self::TransientStore(e),
            LedgerError::Codec { .. } => Self::Permanent(error.to_string()),
            LedgerError::LeaseSuperseded { ref id, .. }
            | LedgerError::NotLeased { ref id, .. }
            | LedgerError::AlreadyCompleted { ref id, .. } => Self::LeaseLost {
                id: id.clone(),
                reason: error.to_string(),
            },
        }
    }
}

/// What the delivery infrastructure should do with an attempt's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Acknowledge; no further redelivery.
    Ack,
    /// Negative-acknowledge; redeliver under the infrastructure's backoff policy.
    Retry,
    /// Hand over to the dead-letter path; never redeliver.
    DeadLetter,
}

impl DeliveryOutcome {
    /// Map an attempt result onto a delivery outcome.
    #[must_use]
    pub const fn from_result<T>(result: &Result<T, ProcessingError>) -> Self {
        match result {
            Ok(_) => Self::Ack,
            Err(e) if e.is_retryable() => Self::Retry,
            Err(_) => Self::DeadLetter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_permanent_errors_dead_letter() {
        let transient: Result<(), _> = Err(ProcessingError::TransientStore(StoreError::Unavailable(
            "down".to_string(),
        )));
        let permanent: Result<(), _> = Err(ProcessingError::Permanent("bad json".to_string()));

        assert_eq!(DeliveryOutcome::from_result(&Ok::<_, ProcessingError>(())), DeliveryOutcome::Ack);
        assert_eq!(DeliveryOutcome::from_result(&transient), DeliveryOutcome::Retry);
        assert_eq!(DeliveryOutcome::from_result(&permanent), DeliveryOutcome::DeadLetter);
    }

    #[test]
    fn superseded_lease_maps_to_lease_lost() {
        let error = ProcessingError::from(LedgerError::LeaseSuperseded {
            id: EventId::new("evt-1"),
            epoch: 1,
            current_epoch: 2,
        });
        assert_eq!(error.kind(), "lease_lost");
        assert!(error.is_retryable());
    }
}
