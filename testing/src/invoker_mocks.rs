//! Fake downstream services.
//!
//! - [`RecordingInvoker`]: answers every service, records every call, and
//!   fails on a script
//! - [`FaultInjectingInvoker`]: wraps any invoker and fails at random with a
//!   seeded generator

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Only panics on a poisoned lock

use exactly_once_core::invoker::{InvokeError, ServiceCall, SideEffectInvoker};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type InvokeFuture<'a> = Pin<Box<dyn Future<Output = Result<Vec<u8>, InvokeError>> + Send + 'a>>;

/// Where an injected failure happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaultPoint {
    /// The request never reaches the service; nothing happens downstream.
    #[default]
    Request,
    /// The service handles the request but the response is lost. The caller
    /// sees a failure even though the side effect took place.
    Response,
}

/// One call seen by a [`RecordingInvoker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    /// Service name
    pub service: String,
    /// The request
    pub call: ServiceCall,
    /// Whether the service actually handled the request
    pub executed: bool,
}

#[derive(Debug, Default)]
struct Calls {
    log: Vec<RecordedCall>,
    responses: HashMap<String, VecDeque<Vec<u8>>>,
    faults: HashMap<String, VecDeque<FaultPoint>>,
}

/// Fake for every downstream service.
///
/// Unless scripted otherwise with [`RecordingInvoker::respond_with`], the
/// `n`-th handled call to a service answers `"{service}-{n}"`, so a service
/// asked twice gives two different answers (a cook assigner that is not
/// idempotent, for instance).
///
/// # Example
///
/// ```
/// use exactly_once_testing::RecordingInvoker;
/// use exactly_once_core::{EventId, ServiceCall, SideEffectInvoker};
///
/// # async fn example() {
/// let invoker = RecordingInvoker::new();
/// invoker.fail_next("email", 1);
///
/// let call = ServiceCall::new(EventId::new("evt-1"), b"hello".to_vec());
/// assert!(invoker.call("email", call.clone()).await.is_err());
/// assert_eq!(invoker.call("email", call).await.unwrap(), b"email-1".to_vec());
/// assert_eq!(invoker.attempts("email"), 2);
/// assert_eq!(invoker.executions("email"), 1);
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct RecordingInvoker {
    calls: Arc<Mutex<Calls>>,
    latency: Option<Duration>,
}

impl RecordingInvoker {
    /// Create an invoker that answers immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency` (real time, via tokio).
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Queue responses for `service`, used in order before the default.
    pub fn respond_with<I, R>(&self, service: &str, responses: I)
    where
        I: IntoIterator<Item = R>,
        R: Into<Vec<u8>>,
    {
        self.calls
            .lock()
            .unwrap()
            .responses
            .entry(service.to_string())
            .or_default()
            .extend(responses.into_iter().map(Into::into));
    }

    /// Fail the next `n` calls to `service` before they reach it.
    pub fn fail_next(&self, service: &str, n: usize) {
        self.script_faults(service, n, FaultPoint::Request);
    }

    /// Let the next `n` calls to `service` execute, then lose their response.
    pub fn lose_next_responses(&self, service: &str, n: usize) {
        self.script_faults(service, n, FaultPoint::Response);
    }

    fn script_faults(&self, service: &str, n: usize, point: FaultPoint) {
        self.calls
            .lock()
            .unwrap()
            .faults
            .entry(service.to_string())
            .or_default()
            .extend(std::iter::repeat_n(point, n));
    }

    /// Every call seen so far, in arrival order.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().log.clone()
    }

    /// Requests `service` actually handled.
    #[must_use]
    pub fn executed(&self, service: &str) -> Vec<ServiceCall> {
        self.calls
            .lock()
            .unwrap()
            .log
            .iter()
            .filter(|recorded| recorded.service == service && recorded.executed)
            .map(|recorded| recorded.call.clone())
            .collect()
    }

    /// Calls made to `service`, including those that never reached it.
    #[must_use]
    pub fn attempts(&self, service: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .log
            .iter()
            .filter(|recorded| recorded.service == service)
            .count()
    }

    /// Calls `service` actually handled.
    #[must_use]
    pub fn executions(&self, service: &str) -> usize {
        self.executed(service).len()
    }

    fn handle(&self, service: &str, call: ServiceCall) -> Result<Vec<u8>, InvokeError> {
        let mut calls = self.calls.lock().unwrap();
        let fault = calls.faults.get_mut(service).and_then(VecDeque::pop_front);

        if fault == Some(FaultPoint::Request) {
            calls.log.push(RecordedCall {
                service: service.to_string(),
                call,
                executed: false,
            });
            return Err(InvokeError::Unavailable {
                service: service.to_string(),
                reason: "injected failure before the request was handled".to_string(),
            });
        }

        let handled = calls
            .log
            .iter()
            .filter(|recorded| recorded.service == service && recorded.executed)
            .count();
        let response = calls
            .responses
            .get_mut(service)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| format!("{service}-{}", handled + 1).into_bytes());
        calls.log.push(RecordedCall {
            service: service.to_string(),
            call,
            executed: true,
        });

        if fault == Some(FaultPoint::Response) {
            return Err(InvokeError::Unavailable {
                service: service.to_string(),
                reason: "injected failure after the request was handled".to_string(),
            });
        }
        Ok(response)
    }
}

impl SideEffectInvoker for RecordingInvoker {
    fn call(&self, service: &str, call: ServiceCall) -> InvokeFuture<'_> {
        let service = service.to_string();
        Box::pin(async move {
            if let Some(latency) = self.latency {
                tokio::time::sleep(latency).await;
            } else {
                tokio::task::yield_now().await;
            }
            self.handle(&service, call)
        })
    }
}

/// Wraps an invoker and fails a fraction of calls at random.
///
/// The generator is seeded, so a given seed always fails the same calls in
/// the same order.
pub struct FaultInjectingInvoker {
    inner: Arc<dyn SideEffectInvoker>,
    failure_rate: f64,
    point: FaultPoint,
    rng: Mutex<StdRng>,
    injected: AtomicUsize,
}

impl FaultInjectingInvoker {
    /// Fail roughly `failure_rate` (clamped to `0.0..=1.0`) of the calls to
    /// `inner`, before they reach it.
    #[must_use]
    pub fn new(inner: Arc<dyn SideEffectInvoker>, failure_rate: f64, seed: u64) -> Self {
        Self {
            inner,
            failure_rate: failure_rate.clamp(0.0, 1.0),
            point: FaultPoint::Request,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            injected: AtomicUsize::new(0),
        }
    }

    /// Inject failures at `point` instead.
    #[must_use]
    pub const fn at(mut self, point: FaultPoint) -> Self {
        self.point = point;
        self
    }

    /// Number of failures injected so far.
    #[must_use]
    pub fn injected(&self) -> usize {
        self.injected.load(Ordering::SeqCst)
    }

    fn roll(&self) -> bool {
        let fail = self.rng.lock().unwrap().gen_bool(self.failure_rate);
        if fail {
            self.injected.fetch_add(1, Ordering::SeqCst);
        }
        fail
    }
}

impl fmt::Debug for FaultInjectingInvoker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultInjectingInvoker")
            .field("failure_rate", &self.failure_rate)
            .field("point", &self.point)
            .field("injected", &self.injected())
            .finish_non_exhaustive()
    }
}

impl SideEffectInvoker for FaultInjectingInvoker {
    fn call(&self, service: &str, call: ServiceCall) -> InvokeFuture<'_> {
        let service = service.to_string();
        Box::pin(async move {
            let fail = self.roll();
            let injected = || InvokeError::Unavailable {
                service: service.clone(),
                reason: format!("injected fault ({:?})", self.point),
            };

            if fail && self.point == FaultPoint::Request {
                return Err(injected());
            }
            let response = self.inner.call(&service, call).await?;
            if fail {
                return Err(injected());
            }
            Ok(response)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use exactly_once_core::EventId;

    fn call(id: &str) -> ServiceCall {
        ServiceCall::new(EventId::new(id), b"payload".to_vec())
    }

    #[tokio::test]
    async fn default_responses_differ_per_call() {
        let invoker = RecordingInvoker::new();
        let first = invoker.call("assign-cook", call("evt-1")).await.unwrap();
        let second = invoker.call("assign-cook", call("evt-1")).await.unwrap();
        assert_eq!(first, b"assign-cook-1".to_vec());
        assert_eq!(second, b"assign-cook-2".to_vec());
    }

    #[tokio::test]
    async fn scripted_responses_come_first() {
        let invoker = RecordingInvoker::new();
        invoker.respond_with("assign-cook", ["marco"]);
        assert_eq!(invoker.call("assign-cook", call("evt-1")).await.unwrap(), b"marco".to_vec());
        assert_eq!(
            invoker.call("assign-cook", call("evt-2")).await.unwrap(),
            b"assign-cook-2".to_vec()
        );
    }

    #[tokio::test]
    async fn lost_response_still_executes() {
        let invoker = RecordingInvoker::new();
        invoker.lose_next_responses("notify-cook", 1);

        assert!(invoker.call("notify-cook", call("evt-1")).await.is_err());
        assert_eq!(invoker.executions("notify-cook"), 1);
        assert_eq!(invoker.executed("notify-cook")[0].idempotency_key, EventId::new("evt-1"));
    }

    #[tokio::test]
    async fn failure_rate_bounds() {
        let inner = Arc::new(RecordingInvoker::new());
        let never = FaultInjectingInvoker::new(inner.clone(), 0.0, 7);
        let always = FaultInjectingInvoker::new(inner.clone(), 1.0, 7);

        for n in 0..10 {
            assert!(never.call("email", call(&format!("evt-{n}"))).await.is_ok());
            assert!(always.call("email", call(&format!("evt-{n}"))).await.is_err());
        }
        assert_eq!(never.injected(), 0);
        assert_eq!(always.injected(), 10);
        assert_eq!(inner.executions("email"), 10);
    }

    #[tokio::test]
    async fn response_faults_happen_after_the_service_ran() {
        let inner = Arc::new(RecordingInvoker::new());
        let lossy = FaultInjectingInvoker::new(inner.clone(), 1.0, 7).at(FaultPoint::Response);

        let result = lossy.call("notify-cook", call("evt-1")).await;

        assert!(matches!(result, Err(InvokeError::Unavailable { .. })));
        assert_eq!(lossy.injected(), 1);
        assert_eq!(inner.attempts("notify-cook"), 1);
        assert_eq!(inner.executions("notify-cook"), 1);
    }

    #[tokio::test]
    async fn same_seed_same_faults() {
        let pattern = |seed| async move {
            let invoker = FaultInjectingInvoker::new(Arc::new(RecordingInvoker::new()), 0.5, seed);
            let mut outcomes = Vec::new();
            for n in 0..20 {
                outcomes.push(invoker.call("email", call(&format!("evt-{n}"))).await.is_ok());
            }
            outcomes
        };
        assert_eq!(pattern(42).await, pattern(42).await);
    }
}
