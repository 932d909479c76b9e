//! In-memory aggregate store with the same compare-and-swap rules as the
//! Postgres store.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap on poisoned locks
#![allow(clippy::missing_panics_doc)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use ticketbus_core::aggregate::{AggregateStore, StoreError, StoreFuture, Versioned};

/// `HashMap`-backed [`AggregateStore`].
///
/// # Example
///
/// ```ignore
/// let store = InMemoryAggregateStore::<Ticket>::new();
/// store.insert(ticket).await?;
/// let updated = store.compare_and_swap(changed, 0).await?;
/// assert_eq!(updated.version(), 1);
/// ```
#[derive(Debug)]
pub struct InMemoryAggregateStore<A: Versioned> {
    data: Arc<Mutex<HashMap<String, A>>>,
    unavailable: Arc<Mutex<bool>>,
}

impl<A: Versioned> Clone for InMemoryAggregateStore<A> {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
            unavailable: Arc::clone(&self.unavailable),
        }
    }
}

impl<A: Versioned> Default for InMemoryAggregateStore<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Versioned> InMemoryAggregateStore<A> {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: Arc::new(Mutex::new(HashMap::new())),
            unavailable: Arc::new(Mutex::new(false)),
        }
    }

    /// Make every operation fail with [`StoreError::DatabaseError`] until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock().unwrap() = unavailable;
    }

    /// Snapshot of one aggregate.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<A> {
        self.data.lock().unwrap().get(id).cloned()
    }

    /// Number of stored aggregates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.lock().unwrap().len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.lock().unwrap().is_empty()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if *self.unavailable.lock().unwrap() {
            return Err(StoreError::DatabaseError("store unavailable".to_string()));
        }
        Ok(())
    }
}

impl<A: Versioned> AggregateStore<A> for InMemoryAggregateStore<A> {
    fn load(&self, id: &str) -> StoreFuture<'_, Option<A>> {
        let id = id.to_string();
        Box::pin(async move {
            self.check_available()?;
            Ok(self.data.lock().unwrap().get(&id).cloned())
        })
    }

    fn insert(&self, aggregate: A) -> StoreFuture<'_, A> {
        Box::pin(async move {
            self.check_available()?;
            let mut data = self.data.lock().unwrap();
            if data.contains_key(aggregate.id()) {
                return Err(StoreError::AlreadyExists(aggregate.id().to_string()));
            }
            data.insert(aggregate.id().to_string(), aggregate.clone());
            Ok(aggregate)
        })
    }

    fn compare_and_swap(&self, mut aggregate: A, expected_version: u64) -> StoreFuture<'_, A> {
        Box::pin(async move {
            self.check_available()?;
            let mut data = self.data.lock().unwrap();
            let stored = data
                .get(aggregate.id())
                .ok_or_else(|| StoreError::NotFound(aggregate.id().to_string()))?;

            if stored.version() != expected_version {
                return Err(StoreError::ConcurrencyConflict {
                    id: aggregate.id().to_string(),
                    expected: expected_version,
                    actual: stored.version(),
                });
            }

            aggregate.set_version(expected_version + 1);
            data.insert(aggregate.id().to_string(), aggregate.clone());
            Ok(aggregate)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq, Eq)]
    struct Counter {
        id: String,
        version: u64,
        value: i64,
    }

    impl Versioned for Counter {
        const KIND: &'static str = "counter";

        fn id(&self) -> &str {
            &self.id
        }

        fn version(&self) -> u64 {
            self.version
        }

        fn set_version(&mut self, version: u64) {
            self.version = version;
        }
    }

    fn counter() -> Counter {
        Counter {
            id: "c-1".to_string(),
            version: 0,
            value: 0,
        }
    }

    #[tokio::test]
    async fn swap_bumps_version_by_one() {
        let store = InMemoryAggregateStore::new();
        store.insert(counter()).await.unwrap();

        let mut next = counter();
        next.value = 5;
        let saved = store.compare_and_swap(next, 0).await.unwrap();

        assert_eq!(saved.version, 1);
        assert_eq!(store.get("c-1").unwrap().value, 5);
    }

    #[tokio::test]
    async fn stale_swap_conflicts_and_keeps_state() {
        let store = InMemoryAggregateStore::new();
        store.insert(counter()).await.unwrap();
        store.compare_and_swap(counter(), 0).await.unwrap();

        let result = store.compare_and_swap(counter(), 0).await;

        assert_eq!(
            result,
            Err(StoreError::ConcurrencyConflict {
                id: "c-1".to_string(),
                expected: 0,
                actual: 1,
            })
        );
        assert_eq!(store.get("c-1").unwrap().version, 1);
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let store = InMemoryAggregateStore::new();
        store.insert(counter()).await.unwrap();
        assert_eq!(
            store.insert(counter()).await,
            Err(StoreError::AlreadyExists("c-1".to_string()))
        );
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = InMemoryAggregateStore::<Counter>::new();
        store.set_unavailable(true);
        assert!(matches!(store.load("c-1").await, Err(StoreError::DatabaseError(_))));
    }
}
