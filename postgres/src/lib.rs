//! `PostgreSQL` storage for ticketbus.
//!
//! This crate provides the production implementations of the storage traits
//! from `ticketbus-core`:
//!
//! - [`PostgresAggregateStore`]: versioned aggregates with compare-and-swap
//!   writes, one JSONB row per `(kind, id)`
//! - [`DeadLetterQueue`]: durable parking place for poison messages, with
//!   operator workflows (list, resolve, discard)
//!
//! # Example
//!
//! ```no_run
//! use ticketbus_postgres::{PostgresAggregateStore, connect, migrate};
//! # #[derive(Clone, serde::Serialize, serde::Deserialize)]
//! # struct Ticket { id: String, version: u64 }
//! # impl ticketbus_core::Versioned for Ticket {
//! #     const KIND: &'static str = "ticket";
//! #     fn id(&self) -> &str { &self.id }
//! #     fn version(&self) -> u64 { self.version }
//! #     fn set_version(&mut self, version: u64) { self.version = version; }
//! # }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = connect("postgres://localhost/tickets", 10).await?;
//! migrate(&pool).await?;
//! let tickets = PostgresAggregateStore::<Ticket>::new(pool);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod aggregate_store;
mod dead_letter_queue;

pub use aggregate_store::PostgresAggregateStore;
pub use dead_letter_queue::{DLQStatus, DeadLetterQueue, FailedMessage};

use sqlx::postgres::{PgPool, PgPoolOptions};
use ticketbus_core::aggregate::StoreError;

/// Open a connection pool.
///
/// # Errors
///
/// Returns [`StoreError::DatabaseError`] if the database cannot be reached.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .map_err(|e| StoreError::DatabaseError(format!("Failed to connect: {e}")))
}

/// Create the `aggregates` and `failed_messages` tables if they do not exist.
///
/// # Errors
///
/// Returns [`StoreError::DatabaseError`] if a migration fails.
pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| StoreError::DatabaseError(format!("Migration failed: {e}")))?;
    tracing::info!("Database migrations applied");
    Ok(())
}
