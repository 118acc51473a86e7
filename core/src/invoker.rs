//! Side-effect invoker: calls into external, unreliable services.
//!
//! The invoker has no state of its own. It reports success (with the service's
//! response body) or failure; the core treats every failure as transient and
//! retryable. There is no notion of partial success.

use crate::envelope::EventId;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors from a downstream service call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvokeError {
    /// The service did not answer (timeout, connection refused, 5xx).
    #[error("Service {service} unavailable: {reason}")]
    Unavailable {
        /// Service name
        service: String,
        /// Failure description
        reason: String,
    },

    /// The service answered but refused the request.
    #[error("Service {service} rejected the call: {reason}")]
    Rejected {
        /// Service name
        service: String,
        /// Failure description
        reason: String,
    },
}

/// A request to a downstream service.
///
/// `idempotency_key` is always the event identifier (or derived from it), so
/// that the service can deduplicate on its side too. The core's guarantee
/// composes with downstream idempotency, it does not replace it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceCall {
    /// Key the service should deduplicate on
    pub idempotency_key: EventId,
    /// Request body
    pub payload: Vec<u8>,
}

impl ServiceCall {
    /// Create a new call keyed by `idempotency_key`.
    #[must_use]
    pub fn new(idempotency_key: EventId, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            idempotency_key,
            payload: payload.into(),
        }
    }
}

/// Calls an external service by name.
///
/// # Dyn Compatibility
///
/// Uses an explicit `Pin<Box<dyn Future>>` return so that one invoker can be
/// shared as `Arc<dyn SideEffectInvoker>` between processors and pipelines.
pub trait SideEffectInvoker: Send + Sync {
    /// Invoke `service` with `call` and return its response body.
    ///
    /// # Errors
    ///
    /// Any error is transient from the caller's perspective.
    fn call(
        &self,
        service: &str,
        call: ServiceCall,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, InvokeError>> + Send + '_>>;
}
