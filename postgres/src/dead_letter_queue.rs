//! Dead-letter queue for events the delivery path gave up on.
//!
//! Holds the envelope of every event that failed permanently or exhausted
//! its redeliveries, with the failure that sank it, so that an operator can
//! inspect it, fix the cause and hand it back for redelivery.

use chrono::{DateTime, Utc};
use exactly_once_core::{EventEnvelope, EventId, ProcessingError, StoreError};
use sqlx::{PgPool, Row};

/// Lifecycle of a dead letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterStatus {
    /// Waiting for investigation
    Pending,
    /// Handed back for redelivery
    Requeued,
    /// Reprocessed successfully or otherwise dealt with
    Resolved,
    /// Will never be processed
    Discarded,
}

impl DeadLetterStatus {
    /// Database representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Requeued => "requeued",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }

    /// Parse the database representation.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` for an unknown status.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "requeued" => Ok(Self::Requeued),
            "resolved" => Ok(Self::Resolved),
            "discarded" => Ok(Self::Discarded),
            _ => Err(StoreError::Unavailable(format!("Invalid dead letter status: {s}"))),
        }
    }
}

/// An entry in the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    /// Queue entry identifier
    pub id: i64,
    /// The event as last delivered
    pub envelope: EventEnvelope,
    /// `ProcessingError::kind` of the final failure
    pub error_kind: String,
    /// Display of the final failure
    pub error_message: String,
    /// Delivery attempts made before giving up
    pub attempts: i32,
    /// When the event was dead-lettered
    pub dead_lettered_at: DateTime<Utc>,
    /// Current status
    pub status: DeadLetterStatus,
    /// When it was resolved or discarded
    pub resolved_at: Option<DateTime<Utc>>,
    /// Who resolved it
    pub resolved_by: Option<String>,
    /// What was done about it
    pub resolution_notes: Option<String>,
}

/// `PostgreSQL`-backed dead-letter queue.
///
/// Shares the database (and `migrate`) with `PostgresRecordStore`.
///
/// # Example
///
/// ```no_run
/// use exactly_once_postgres::DeadLetterQueue;
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let dlq = DeadLetterQueue::new(pool);
///
/// for letter in dlq.list_pending(100).await? {
///     println!("{} failed: {}", letter.envelope.id, letter.error_message);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct DeadLetterQueue {
    pool: PgPool,
}

impl DeadLetterQueue {
    /// Create a queue over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Add a dead-lettered event and return its queue entry identifier.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` if the insert fails.
    pub async fn add(
        &self,
        envelope: &EventEnvelope,
        error: &ProcessingError,
        attempts: usize,
    ) -> Result<i64, StoreError> {
        let (id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO dead_letters (
                event_id, payload, received_at, error_kind, error_message, attempts
            ) VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            ",
        )
        .bind(envelope.id.as_str())
        .bind(&envelope.payload)
        .bind(envelope.received_at)
        .bind(error.kind())
        .bind(error.to_string())
        .bind(i32::try_from(attempts).unwrap_or(i32::MAX))
        .fetch_one(&self.pool)
        .await
        .map_err(unavailable)?;

        tracing::warn!(
            dlq_id = id,
            event_id = %envelope.id,
            error_kind = error.kind(),
            %error,
            attempts,
            "Event added to dead-letter queue"
        );
        metrics::counter!("dead_letters_added_total", "kind" => error.kind()).increment(1);

        Ok(id)
    }

    /// Pending entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` if the query fails.
    pub async fn list_pending(&self, limit: usize) -> Result<Vec<DeadLetter>, StoreError> {
        self.list_by_status(DeadLetterStatus::Pending, limit).await
    }

    /// Entries with `status`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` if the query fails.
    pub async fn list_by_status(
        &self,
        status: DeadLetterStatus,
        limit: usize,
    ) -> Result<Vec<DeadLetter>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT
                id, event_id, payload, received_at, error_kind, error_message,
                attempts, dead_lettered_at, status,
                resolved_at, resolved_by, resolution_notes
            FROM dead_letters
            WHERE status = $1
            ORDER BY dead_lettered_at ASC, id ASC
            LIMIT $2
            ",
        )
        .bind(status.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        rows.iter().map(Self::row_to_dead_letter).collect()
    }

    /// Entries for one event, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` if the query fails.
    pub async fn for_event(&self, event_id: &EventId) -> Result<Vec<DeadLetter>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT
                id, event_id, payload, received_at, error_kind, error_message,
                attempts, dead_lettered_at, status,
                resolved_at, resolved_by, resolution_notes
            FROM dead_letters
            WHERE event_id = $1
            ORDER BY id ASC
            ",
        )
        .bind(event_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        rows.iter().map(Self::row_to_dead_letter).collect()
    }

    /// Mark a pending entry as requeued and return its envelope for
    /// redelivery. Returns `None` if the entry is not pending.
    ///
    /// Redelivering a requeued event is safe: the ledger replays it if it
    /// did complete after all.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` if the update fails.
    pub async fn requeue(&self, id: i64) -> Result<Option<EventEnvelope>, StoreError> {
        let row = sqlx::query(
            r"
            UPDATE dead_letters
            SET status = 'requeued'
            WHERE id = $1 AND status = 'pending'
            RETURNING event_id, payload, received_at
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(row.map(|row| {
            tracing::info!(dlq_id = id, "Dead letter requeued");
            EventEnvelope::new(
                row.get::<String, _>("event_id"),
                row.get::<Vec<u8>, _>("payload"),
                row.get::<DateTime<Utc>, _>("received_at"),
            )
        }))
    }

    /// Mark an entry as resolved.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` if the update fails.
    pub async fn mark_resolved(
        &self,
        id: i64,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r"
            UPDATE dead_letters
            SET status = 'resolved',
                resolved_at = NOW(),
                resolved_by = $1,
                resolution_notes = $2
            WHERE id = $3
            ",
        )
        .bind(resolved_by)
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        tracing::info!(dlq_id = id, resolved_by, "Dead letter resolved");
        metrics::counter!("dead_letters_resolved_total").increment(1);
        Ok(())
    }

    /// Mark an entry as discarded for good.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` if the update fails.
    pub async fn mark_discarded(&self, id: i64, reason: &str) -> Result<(), StoreError> {
        sqlx::query(
            r"
            UPDATE dead_letters
            SET status = 'discarded',
                resolved_at = NOW(),
                resolution_notes = $1
            WHERE id = $2
            ",
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        tracing::warn!(dlq_id = id, reason, "Dead letter discarded");
        metrics::counter!("dead_letters_discarded_total").increment(1);
        Ok(())
    }

    /// Number of pending entries.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` if the query fails.
    pub async fn count_pending(&self) -> Result<i64, StoreError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM dead_letters WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .map_err(unavailable)?;
        Ok(count)
    }

    fn row_to_dead_letter(row: &sqlx::postgres::PgRow) -> Result<DeadLetter, StoreError> {
        let status: String = row.get("status");
        Ok(DeadLetter {
            id: row.get("id"),
            envelope: EventEnvelope::new(
                row.get::<String, _>("event_id"),
                row.get::<Vec<u8>, _>("payload"),
                row.get::<DateTime<Utc>, _>("received_at"),
            ),
            error_kind: row.get("error_kind"),
            error_message: row.get("error_message"),
            attempts: row.get("attempts"),
            dead_lettered_at: row.get("dead_lettered_at"),
            status: DeadLetterStatus::parse(&status)?,
            resolved_at: row.get("resolved_at"),
            resolved_by: row.get("resolved_by"),
            resolution_notes: row.get("resolution_notes"),
        })
    }
}

#[allow(clippy::needless_pass_by_value)] // Used as a map_err adapter
fn unavailable(error: sqlx::Error) -> StoreError {
    StoreError::Unavailable(error.to_string())
}
