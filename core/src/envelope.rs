//! Event identification and the envelope handed over by delivery infrastructure.
//!
//! The identifier is the one thing the delivery layer guarantees to keep stable
//! across redeliveries, so it is the dedup key for everything downstream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for `EventId` parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid event ID: {0}")]
pub struct ParseEventIdError(String);

/// Identifier of a logical event.
///
/// Every redelivery of the same logical event carries the same `EventId`.
/// It is opaque to the core: it is only compared, used as a store key, and
/// forwarded to downstream services as their idempotency key.
///
/// # Validation
///
/// - `FromStr::from_str()`: rejects empty strings (use for external input)
/// - `From::from()` and `new()`: no validation (for trusted input)
///
/// # Examples
///
/// ```
/// use exactly_once_core::envelope::EventId;
///
/// let id = EventId::new("evt-12345");
/// assert_eq!(id.as_str(), "evt-12345");
///
/// let parsed: EventId = "evt-abc".parse().unwrap();
/// assert_eq!(parsed, EventId::new("evt-abc"));
/// assert!("".parse::<EventId>().is_err());
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(String);

impl EventId {
    /// Create a new `EventId` from a string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identifier (used when minting new events).
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("evt-{}", uuid::Uuid::new_v4()))
    }

    /// Get the event ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert the `EventId` into its inner `String`.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EventId {
    type Err = ParseEventIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseEventIdError("Event ID cannot be empty".to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<String> for EventId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for EventId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for EventId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A single delivery attempt of a logical event.
///
/// Redeliveries share `id` and `payload`; `received_at` is per attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Stable identifier of the logical event
    pub id: EventId,
    /// Opaque event body
    pub payload: Vec<u8>,
    /// When this attempt arrived
    pub received_at: DateTime<Utc>,
}

impl EventEnvelope {
    /// Create a new envelope.
    #[must_use]
    pub fn new(id: impl Into<EventId>, payload: impl Into<Vec<u8>>, received_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
            received_at,
        }
    }

    /// Copy of this envelope as a redelivery arriving at `received_at`.
    #[must_use]
    pub fn redelivered_at(&self, received_at: DateTime<Utc>) -> Self {
        Self {
            id: self.id.clone(),
            payload: self.payload.clone(),
            received_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_distinct() {
        let a = EventId::generate();
        let b = EventId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("evt-"));
    }

    #[test]
    fn redelivery_keeps_identity_and_payload() {
        let first = EventEnvelope::new("evt-1", b"body".to_vec(), Utc::now());
        let later = first.received_at + chrono::Duration::seconds(30);
        let again = first.redelivered_at(later);

        assert_eq!(again.id, first.id);
        assert_eq!(again.payload, first.payload);
        assert_eq!(again.received_at, later);
    }
}
