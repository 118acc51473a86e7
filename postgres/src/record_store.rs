//! `PostgreSQL` record store.
//!
//! One `records` table, keyed by the record key. `transact` runs in a
//! database transaction:
//!
//! 1. `SELECT … FOR UPDATE` locks the row if it exists.
//! 2. The transaction function decides on the locked value.
//! 3. An existing row is updated in place. A missing row is created with
//!    `INSERT … ON CONFLICT DO NOTHING`; if another transaction created it
//!    first, nothing is inserted and the call fails with
//!    `StoreError::Conflict` (the caller decided on a stale "absent").
//!
//! Serialization failures and deadlocks also surface as `Conflict`.

use exactly_once_core::record_store::{RecordStore, StoreError, Transition, Write};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Instant;

/// [`RecordStore`] backed by `PostgreSQL`.
///
/// # Example
///
/// ```ignore
/// use exactly_once_postgres::PostgresRecordStore;
///
/// let store = PostgresRecordStore::new("postgres://localhost/orders").await?;
/// store.migrate().await?;
/// ```
#[derive(Clone, Debug)]
pub struct PostgresRecordStore {
    pool: PgPool,
}

impl PostgresRecordStore {
    /// Connect to `database_url` with a pool of up to 10 connections.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` if the connection fails.
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to connect: {e}")))?;
        Ok(Self::from_pool(pool))
    }

    /// Use an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the `records` and `dead_letters` tables if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` if a migration fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(format!("Migration failed: {e}")))
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Keys starting with `prefix`, sorted.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` if the query fails.
    pub async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let escaped = prefix
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT key FROM records WHERE key LIKE $1 ORDER BY key")
                .bind(format!("{escaped}%"))
                .fetch_all(&self.pool)
                .await
                .map_err(|e| store_error(prefix, e))?;
        Ok(rows.into_iter().map(|(key,)| key).collect())
    }

    async fn run_transaction<F, T>(&self, key: &str, apply: F) -> Result<T, StoreError>
    where
        F: FnOnce(Option<&[u8]>) -> Transition<T> + Send,
        T: Send,
    {
        let fail = |e: sqlx::Error| store_error(key, e);
        let mut tx = self.pool.begin().await.map_err(fail)?;

        let current: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT value FROM records WHERE key = $1 FOR UPDATE")
                .bind(key)
                .fetch_optional(&mut *tx)
                .await
                .map_err(fail)?;
        let existed = current.is_some();

        let Transition { write, output } = apply(current.as_ref().map(|(value,)| value.as_slice()));

        let value = match write {
            Write::Keep => {
                tx.rollback().await.map_err(fail)?;
                return Ok(output);
            },
            Write::Put(value) => value,
        };

        if existed {
            sqlx::query("UPDATE records SET value = $2, updated_at = now() WHERE key = $1")
                .bind(key)
                .bind(value)
                .execute(&mut *tx)
                .await
                .map_err(fail)?;
        } else {
            let inserted = sqlx::query(
                "INSERT INTO records (key, value) VALUES ($1, $2) ON CONFLICT (key) DO NOTHING",
            )
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await
            .map_err(fail)?
            .rows_affected();

            if inserted == 0 {
                tx.rollback().await.map_err(fail)?;
                return Err(StoreError::Conflict {
                    key: key.to_string(),
                });
            }
        }

        tx.commit().await.map_err(fail)?;
        Ok(output)
    }
}

impl RecordStore for PostgresRecordStore {
    async fn transact<F, T>(&self, key: &str, apply: F) -> Result<T, StoreError>
    where
        F: FnOnce(Option<&[u8]>) -> Transition<T> + Send,
        T: Send,
    {
        let started = Instant::now();
        let result = self.run_transaction(key, apply).await;

        metrics::histogram!("record_store_transaction_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        match &result {
            Err(StoreError::Conflict { .. }) => {
                tracing::debug!(key, "Transaction lost a race");
                metrics::counter!("record_store_conflicts_total").increment(1);
            },
            Err(StoreError::Unavailable(reason)) => {
                tracing::warn!(key, %reason, "Transaction failed");
            },
            Ok(_) => {},
        }
        result
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as("SELECT value FROM records WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| store_error(key, e))?;
        Ok(row.map(|(value,)| value))
    }
}

/// Serialization failures and deadlocks are races; anything else means the
/// database could not do its job.
fn store_error(key: &str, error: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &error {
        if matches!(db.code().as_deref(), Some("40001" | "40P01")) {
            return StoreError::Conflict {
                key: key.to_string(),
            };
        }
    }
    StoreError::Unavailable(error.to_string())
}
