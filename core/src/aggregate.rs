//! Versioned aggregates and their compare-and-swap store.
//!
//! Every persisted aggregate carries a version counter starting at 0. The only
//! way to change a stored aggregate is [`AggregateStore::compare_and_swap`],
//! which succeeds only if the stored version still equals the caller's
//! expected version and then stores `expected + 1`. There is no other lock.
//!
//! # Implementations
//!
//! - `PostgresAggregateStore` (in `ticketbus-postgres`): production
//! - `InMemoryAggregateStore` (in `ticketbus-testing`): fast, deterministic tests

use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during aggregate store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Optimistic concurrency conflict: the stored version moved.
    #[error("Concurrency conflict on '{id}': expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        /// Aggregate id
        id: String,
        /// Version the caller expected
        expected: u64,
        /// Version actually stored
        actual: u64,
    },

    /// No aggregate with this id.
    #[error("Aggregate not found: {0}")]
    NotFound(String),

    /// An aggregate with this id already exists.
    #[error("Aggregate already exists: {0}")]
    AlreadyExists(String),

    /// Database connection or query error.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Aggregate state could not be (de)serialized.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// A persisted entity whose writes are version-checked.
pub trait Versioned: Clone + Send + Sync + 'static {
    /// Aggregate kind, used to namespace ids in shared storage.
    const KIND: &'static str;

    /// Opaque identifier.
    fn id(&self) -> &str;

    /// Current version.
    fn version(&self) -> u64;

    /// Overwrite the version (stores call this when committing).
    fn set_version(&mut self, version: u64);
}

/// Boxed future returned by [`AggregateStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Storage with atomic compare-and-swap on the version counter.
///
/// # Dyn Compatibility
///
/// Explicit boxed futures keep the trait usable as `Arc<dyn AggregateStore<A>>`.
pub trait AggregateStore<A: Versioned>: Send + Sync {
    /// Load an aggregate by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DatabaseError`] or [`StoreError::SerializationError`].
    fn load(&self, id: &str) -> StoreFuture<'_, Option<A>>;

    /// Insert a new aggregate at its current version.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyExists`] if the id is taken.
    fn insert(&self, aggregate: A) -> StoreFuture<'_, A>;

    /// Persist `aggregate` with version `expected_version + 1`, only if the
    /// stored version is still `expected_version` at commit time.
    ///
    /// Returns the aggregate as persisted.
    ///
    /// # Errors
    ///
    /// - [`StoreError::ConcurrencyConflict`] if the stored version moved
    /// - [`StoreError::NotFound`] if there is nothing to swap
    fn compare_and_swap(&self, aggregate: A, expected_version: u64) -> StoreFuture<'_, A>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrency_conflict_error_display() {
        let error = StoreError::ConcurrencyConflict {
            id: "t-1".to_string(),
            expected: 1,
            actual: 2,
        };

        let display = format!("{error}");
        assert!(display.contains("expected version 1"));
        assert!(display.contains("found 2"));
    }

    #[test]
    fn not_found_error_display() {
        let display = format!("{}", StoreError::NotFound("t-404".to_string()));
        assert!(display.contains("t-404"));
    }
}
