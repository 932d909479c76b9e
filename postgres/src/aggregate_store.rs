//! Versioned aggregate storage in `PostgreSQL`.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE aggregates (
//!     kind TEXT NOT NULL,
//!     id TEXT NOT NULL,
//!     version BIGINT NOT NULL,
//!     state JSONB NOT NULL,
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     PRIMARY KEY (kind, id)
//! );
//! ```
//!
//! The `version` column is authoritative. The compare-and-swap is a single
//! `UPDATE ... WHERE version = $expected`, so the database row lock taken by
//! that statement is the only serialization point.

use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::PgPool;
use std::marker::PhantomData;
use ticketbus_core::aggregate::{AggregateStore, StoreError, StoreFuture, Versioned};

/// `PostgreSQL` implementation of [`AggregateStore`].
///
/// Aggregates of different kinds share the table; [`Versioned::KIND`] keeps
/// their ids apart.
pub struct PostgresAggregateStore<A> {
    pool: PgPool,
    _kind: PhantomData<fn() -> A>,
}

impl<A> Clone for PostgresAggregateStore<A> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            _kind: PhantomData,
        }
    }
}

impl<A> PostgresAggregateStore<A> {
    /// Create a store on an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self {
            pool,
            _kind: PhantomData,
        }
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn to_column(version: u64) -> Result<i64, StoreError> {
    i64::try_from(version)
        .map_err(|_| StoreError::SerializationError(format!("version {version} exceeds BIGINT")))
}

fn from_column(version: i64) -> Result<u64, StoreError> {
    u64::try_from(version)
        .map_err(|_| StoreError::SerializationError(format!("negative stored version {version}")))
}

fn db_error(e: &sqlx::Error) -> StoreError {
    StoreError::DatabaseError(e.to_string())
}

impl<A> PostgresAggregateStore<A>
where
    A: Versioned + Serialize + DeserializeOwned,
{
    fn encode(aggregate: &A) -> Result<serde_json::Value, StoreError> {
        serde_json::to_value(aggregate).map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    async fn stored_version(&self, id: &str) -> Result<Option<u64>, StoreError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT version FROM aggregates WHERE kind = $1 AND id = $2")
                .bind(A::KIND)
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| db_error(&e))?;
        row.map(|(version,)| from_column(version)).transpose()
    }
}

impl<A> AggregateStore<A> for PostgresAggregateStore<A>
where
    A: Versioned + Serialize + DeserializeOwned,
{
    fn load(&self, id: &str) -> StoreFuture<'_, Option<A>> {
        let id = id.to_string();
        Box::pin(async move {
            let row: Option<(serde_json::Value, i64)> =
                sqlx::query_as("SELECT state, version FROM aggregates WHERE kind = $1 AND id = $2")
                    .bind(A::KIND)
                    .bind(&id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| db_error(&e))?;

            let Some((state, version)) = row else {
                return Ok(None);
            };
            let mut aggregate: A = serde_json::from_value(state)
                .map_err(|e| StoreError::SerializationError(format!("{}/{id}: {e}", A::KIND)))?;
            aggregate.set_version(from_column(version)?);
            Ok(Some(aggregate))
        })
    }

    fn insert(&self, aggregate: A) -> StoreFuture<'_, A> {
        Box::pin(async move {
            let state = Self::encode(&aggregate)?;
            let result = sqlx::query(
                r"
                INSERT INTO aggregates (kind, id, version, state)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (kind, id) DO NOTHING
                ",
            )
            .bind(A::KIND)
            .bind(aggregate.id())
            .bind(to_column(aggregate.version())?)
            .bind(state)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error(&e))?;

            if result.rows_affected() == 0 {
                return Err(StoreError::AlreadyExists(aggregate.id().to_string()));
            }

            tracing::debug!(
                kind = A::KIND,
                aggregate_id = aggregate.id(),
                version = aggregate.version(),
                "Aggregate inserted"
            );
            Ok(aggregate)
        })
    }

    fn compare_and_swap(&self, aggregate: A, expected_version: u64) -> StoreFuture<'_, A> {
        Box::pin(async move {
            let mut next = aggregate;
            next.set_version(expected_version + 1);
            let state = Self::encode(&next)?;

            let result = sqlx::query(
                r"
                UPDATE aggregates
                SET state = $3, version = $4, updated_at = now()
                WHERE kind = $1 AND id = $2 AND version = $5
                ",
            )
            .bind(A::KIND)
            .bind(next.id())
            .bind(state)
            .bind(to_column(next.version())?)
            .bind(to_column(expected_version)?)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error(&e))?;

            if result.rows_affected() == 1 {
                tracing::debug!(
                    kind = A::KIND,
                    aggregate_id = next.id(),
                    version = next.version(),
                    "Aggregate swapped"
                );
                return Ok(next);
            }

            // Nothing matched: either the row is gone or its version moved.
            match self.stored_version(next.id()).await? {
                None => Err(StoreError::NotFound(next.id().to_string())),
                Some(actual) => {
                    tracing::debug!(
                        kind = A::KIND,
                        aggregate_id = next.id(),
                        expected = expected_version,
                        actual,
                        "Compare-and-swap lost"
                    );
                    Err(StoreError::ConcurrencyConflict {
                        id: next.id().to_string(),
                        expected: expected_version,
                        actual,
                    })
                }
            }
        })
    }
}
