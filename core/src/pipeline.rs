//! Order pipeline: choose a cook, persist the order, notify the cook.
//!
//! A three-stage saga gated by the dedup ledger:
//!
//! ```text
//! Received ──assign-cook──► CookChosen ──checkpoint──► Stored ──notify-cook──► Notified
//! ```
//!
//! - Cook assignment is not idempotent (asking twice may yield a different
//!   cook), so it only runs while holding the lease and only if no order has
//!   been recorded yet.
//! - The order is recorded as the ledger checkpoint: one transaction that
//!   checks the caller's lease and writes only if nothing was recorded
//!   before. A retry after this point reuses the recorded order and never
//!   asks for a cook again.
//! - The notification carries only the order identifier, so the recipient
//!   can deduplicate it.
//! - `mark_done` stores the order as the replay result.
//!
//! Any failure releases the lease and surfaces as a transient error; the
//! redelivered event resumes from the last recorded stage.

use crate::envelope::{EventEnvelope, EventId};
use crate::environment::Clock;
use crate::error::ProcessingError;
use crate::invoker::{InvokeError, ServiceCall, SideEffectInvoker};
use crate::ledger::{Completion, Decision, DedupLedger, Lease};
use crate::record_store::{RecordStore, document_key};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Service that assigns a cook to a meal.
pub const ASSIGN_COOK: &str = "assign-cook";

/// Service that tells a cook about a new order.
pub const NOTIFY_COOK: &str = "notify-cook";

/// Collection of persisted orders.
pub const ORDERS: &str = "orders";

/// Payload of an order event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// What was ordered
    pub meal: String,
}

impl OrderRequest {
    /// Parse an event payload.
    ///
    /// # Errors
    ///
    /// `Permanent` if the payload is not a JSON order or the meal is blank.
    pub fn parse(payload: &[u8]) -> Result<Self, ProcessingError> {
        let request: Self = serde_json::from_slice(payload)
            .map_err(|e| ProcessingError::Permanent(format!("Malformed order payload: {e}")))?;
        if request.meal.trim().is_empty() {
            return Err(ProcessingError::Permanent(
                "Order payload has an empty meal".to_string(),
            ));
        }
        Ok(request)
    }

    /// Encode as an event payload.
    ///
    /// # Errors
    ///
    /// `Permanent` if serialization fails.
    pub fn to_payload(&self) -> Result<Vec<u8>, ProcessingError> {
        serde_json::to_vec(self)
            .map_err(|e| ProcessingError::Permanent(format!("Unencodable order request: {e}")))
    }
}

/// A persisted order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Same as the event identifier
    pub id: EventId,
    /// Arrival time of the attempt that chose the cook
    pub placed_at: DateTime<Utc>,
    /// What was ordered
    pub meal: String,
    /// Assigned cook
    pub cook: Option<String>,
}

impl Order {
    /// Decode an order record.
    ///
    /// # Errors
    ///
    /// `Permanent` if the bytes are not an order.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProcessingError> {
        serde_json::from_slice(bytes)
            .map_err(|e| ProcessingError::Permanent(format!("Corrupt order record: {e}")))
    }

    /// Encode an order record.
    ///
    /// # Errors
    ///
    /// `Permanent` if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, ProcessingError> {
        serde_json::to_vec(self)
            .map_err(|e| ProcessingError::Permanent(format!("Unencodable order: {e}")))
    }
}

/// Saga stages, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OrderStage {
    /// Event accepted, nothing done yet
    Received,
    /// A cook was assigned
    CookChosen,
    /// The order with its cook is recorded
    Stored,
    /// The cook was notified (terminal)
    Notified,
}

impl OrderStage {
    /// Label for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::CookChosen => "cook_chosen",
            Self::Stored => "stored",
            Self::Notified => "notified",
        }
    }

    /// Stage an attempt starts at: `CookChosen` when resuming from a
    /// recorded order, `Received` otherwise.
    #[must_use]
    pub const fn on_entry(resumed: bool) -> Self {
        if resumed { Self::CookChosen } else { Self::Received }
    }
}

impl fmt::Display for OrderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a successful pipeline attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOutcome {
    /// The order as recorded
    pub order: Order,
    /// Always `Notified` on success
    pub stage_reached: OrderStage,
    /// `true` if an earlier attempt had already completed the pipeline
    pub replayed: bool,
}

/// The order saga.
pub struct OrderPipeline<S> {
    ledger: DedupLedger<S>,
    invoker: Arc<dyn SideEffectInvoker>,
    clock: Arc<dyn Clock>,
}

impl<S: RecordStore> OrderPipeline<S> {
    /// Create a pipeline.
    #[must_use]
    pub fn new(ledger: DedupLedger<S>, invoker: Arc<dyn SideEffectInvoker>, clock: Arc<dyn Clock>) -> Self {
        Self {
            ledger,
            invoker,
            clock,
        }
    }

    /// Handle one delivery attempt of an order event.
    ///
    /// # Errors
    ///
    /// - `Permanent`: malformed payload (checked before anything else)
    /// - `LeaseConflict`: another attempt is running this order
    /// - `TransientStore` / `TransientService` / `LeaseLost`: redeliver; the
    ///   next attempt resumes from the last recorded stage
    #[tracing::instrument(skip(self, envelope), fields(event_id = %envelope.id))]
    pub async fn process(&self, envelope: &EventEnvelope) -> Result<PipelineOutcome, ProcessingError> {
        let request = OrderRequest::parse(&envelope.payload)?;

        let decision = self
            .ledger
            .decide(&envelope.id, self.clock.now(), self.ledger.lease_duration())
            .await?;

        match decision {
            Decision::AlreadyDone { result } => Self::replay(&envelope.id, result.as_deref()),
            Decision::LeaseHeld { expires_at } => Err(ProcessingError::LeaseConflict {
                id: envelope.id.clone(),
                expires_at,
            }),
            Decision::ShouldRun { lease, checkpoint } => {
                let mut stage = OrderStage::on_entry(checkpoint.is_some());
                let result = self
                    .advance(envelope, &request, &lease, checkpoint, &mut stage)
                    .await;

                if let Err(error) = &result {
                    tracing::warn!(%error, %stage, "Order pipeline stopped");
                    metrics::counter!("pipeline_failures_total", "stage" => stage.as_str()).increment(1);
                    if let Err(error) = self
                        .ledger
                        .release(&envelope.id, &lease, self.clock.now())
                        .await
                    {
                        tracing::warn!(%error, "Could not release lease; it will expire on its own");
                    }
                }
                result
            },
        }
    }

    fn replay(id: &EventId, result: Option<&[u8]>) -> Result<PipelineOutcome, ProcessingError> {
        let bytes = result.ok_or_else(|| {
            ProcessingError::Permanent(format!("Completed order {id} has no recorded result"))
        })?;
        tracing::debug!("Order already completed, replaying");
        Ok(PipelineOutcome {
            order: Order::decode(bytes)?,
            stage_reached: OrderStage::Notified,
            replayed: true,
        })
    }

    async fn advance(
        &self,
        envelope: &EventEnvelope,
        request: &OrderRequest,
        lease: &Lease,
        checkpoint: Option<Vec<u8>>,
        stage: &mut OrderStage,
    ) -> Result<PipelineOutcome, ProcessingError> {
        let id = &envelope.id;

        let order = if let Some(recorded) = checkpoint {
            let order = Order::decode(&recorded)?;
            tracing::info!(cook = ?order.cook, %stage, "Resuming, skipping cook assignment");
            order
        } else {
            let cook = self.assign_cook(id, request).await?;
            Self::enter(stage, OrderStage::CookChosen);

            let chosen = Order {
                id: id.clone(),
                placed_at: envelope.received_at,
                meal: request.meal.clone(),
                cook: Some(cook),
            };
            let recorded = self.ledger.checkpoint(id, lease, chosen.encode()?).await?;
            Order::decode(&recorded)?
        };

        let created = self
            .ledger
            .store()
            .insert_if_absent(&document_key(ORDERS, id), order.encode()?)
            .await?;
        if created {
            tracing::info!(cook = ?order.cook, "Order stored");
        }
        Self::enter(stage, OrderStage::Stored);

        self.invoker
            .call(NOTIFY_COOK, ServiceCall::new(id.clone(), id.as_str()))
            .await
            .map_err(|e| ProcessingError::service(NOTIFY_COOK, e))?;
        Self::enter(stage, OrderStage::Notified);

        let completion = self
            .ledger
            .mark_done(id, lease, self.clock.now(), Some(order.encode()?))
            .await?;
        if let Completion::AlreadyDone { result } = completion {
            return Self::replay(id, result.as_deref());
        }

        Ok(PipelineOutcome {
            order,
            stage_reached: *stage,
            replayed: false,
        })
    }

    async fn assign_cook(&self, id: &EventId, request: &OrderRequest) -> Result<String, ProcessingError> {
        let response = self
            .invoker
            .call(ASSIGN_COOK, ServiceCall::new(id.clone(), request.meal.as_bytes()))
            .await
            .map_err(|e| ProcessingError::service(ASSIGN_COOK, e))?;
        String::from_utf8(response).map_err(|e| {
            ProcessingError::service(
                ASSIGN_COOK,
                InvokeError::Rejected {
                    service: ASSIGN_COOK.to_string(),
                    reason: format!("cook name is not UTF-8: {e}"),
                },
            )
        })
    }

    fn enter(stage: &mut OrderStage, next: OrderStage) {
        tracing::debug!(from = %stage, to = %next, "Stage reached");
        metrics::counter!("pipeline_stages_total", "stage" => next.as_str()).increment(1);
        *stage = next;
    }
}
