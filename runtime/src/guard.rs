//! Version-gated writes for replicated and local aggregates.
//!
//! Two write paths share one [`AggregateStore`]:
//!
//! - [`VersionedWriter`]: the owning service changes its own aggregate; the
//!   caller states the version it read and the write fails if it moved.
//! - [`ConcurrencyGuard`]: a listener applies a replicated event carrying the
//!   publisher's version; only the event for the next version (`stored + 1`)
//!   is applied, everything else is skipped without running the mutation.
//!
//! Both finish with the store's compare-and-swap, so a listener racing a
//! local writer loses with [`GuardError::Conflict`] and the message is
//! redelivered against the newer state.

use crate::listener::HandlerError;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use ticketbus_core::aggregate::{AggregateStore, StoreError, Versioned};

/// What to do with an event whose version is ahead of `stored + 1`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutOfOrderPolicy {
    /// Acknowledge and forget it. Keeps the listener live at the cost of
    /// possibly never applying that version.
    #[default]
    DropAndAck,
    /// Leave it unacknowledged so the broker redelivers it until the missing
    /// versions have been applied.
    Redeliver,
}

impl std::str::FromStr for OutOfOrderPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop" | "drop-and-ack" => Ok(Self::DropAndAck),
            "redeliver" => Ok(Self::Redeliver),
            other => Err(format!("unknown out-of-order policy '{other}'")),
        }
    }
}

/// Why an event was not applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// Version already applied (redelivery or duplicate publish).
    Duplicate {
        /// Stored version
        stored: u64,
        /// Version carried by the event
        incoming: u64,
    },
    /// At least one earlier version has not been applied yet.
    OutOfOrder {
        /// Stored version
        stored: u64,
        /// Version carried by the event
        incoming: u64,
    },
}

/// Result of a guarded apply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuardOutcome {
    /// The mutation ran and was persisted at `version`.
    Applied {
        /// New stored version
        version: u64,
    },
    /// The mutation did not run.
    Skipped(SkipReason),
}

impl GuardOutcome {
    /// Whether the mutation was applied.
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }

    /// Translate into the listener's verdict under `policy`.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::Transient`] for an out-of-order skip under
    /// [`OutOfOrderPolicy::Redeliver`].
    pub fn into_handler_result(self, policy: OutOfOrderPolicy) -> Result<(), HandlerError> {
        match (self, policy) {
            (Self::Applied { .. } | Self::Skipped(SkipReason::Duplicate { .. }), _)
            | (Self::Skipped(SkipReason::OutOfOrder { .. }), OutOfOrderPolicy::DropAndAck) => {
                Ok(())
            }
            (
                Self::Skipped(SkipReason::OutOfOrder { stored, incoming }),
                OutOfOrderPolicy::Redeliver,
            ) => Err(HandlerError::Transient(format!(
                "version {incoming} arrived before {}",
                stored + 1
            ))),
        }
    }
}

/// Errors from guarded and versioned writes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GuardError {
    /// The stored version moved between read and commit.
    #[error("Concurrent write on '{id}': expected version {expected}, found {actual}")]
    Conflict {
        /// Aggregate id
        id: String,
        /// Version the write was based on
        expected: u64,
        /// Version found at commit
        actual: u64,
    },

    /// No stored aggregate (its creation event may not have arrived yet).
    #[error("{kind} '{id}' not found")]
    NotFound {
        /// Aggregate kind
        kind: &'static str,
        /// Aggregate id
        id: String,
    },

    /// Any other store failure.
    #[error(transparent)]
    Store(StoreError),
}

impl GuardError {
    fn from_store<A: Versioned>(error: StoreError) -> Self {
        match error {
            StoreError::ConcurrencyConflict {
                id,
                expected,
                actual,
            } => Self::Conflict {
                id,
                expected,
                actual,
            },
            StoreError::NotFound(id) => Self::NotFound { kind: A::KIND, id },
            other => Self::Store(other),
        }
    }
}

impl From<GuardError> for HandlerError {
    fn from(error: GuardError) -> Self {
        match error {
            GuardError::Conflict { .. } => Self::Conflict(error.to_string()),
            GuardError::NotFound { .. } | GuardError::Store(_) => {
                Self::Transient(error.to_string())
            }
        }
    }
}

/// Applies replicated events in version order.
pub struct ConcurrencyGuard<A: Versioned> {
    store: Arc<dyn AggregateStore<A>>,
}

impl<A: Versioned> Clone for ConcurrencyGuard<A> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<A: Versioned> fmt::Debug for ConcurrencyGuard<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrencyGuard")
            .field("kind", &A::KIND)
            .finish_non_exhaustive()
    }
}

impl<A: Versioned> ConcurrencyGuard<A> {
    /// Guard writes to `store`.
    #[must_use]
    pub fn new(store: Arc<dyn AggregateStore<A>>) -> Self {
        Self { store }
    }

    /// Store a replicated copy from its creation event.
    ///
    /// A copy that already exists is reported as a duplicate.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::Store`] if the store fails.
    pub async fn apply_create(&self, aggregate: A) -> Result<GuardOutcome, GuardError> {
        let id = aggregate.id().to_string();
        let incoming = aggregate.version();

        match self.store.insert(aggregate).await {
            Ok(stored) => {
                tracing::debug!(kind = A::KIND, aggregate_id = %id, version = stored.version(), "Replica created");
                Ok(GuardOutcome::Applied {
                    version: stored.version(),
                })
            }
            Err(StoreError::AlreadyExists(_)) => {
                let stored = self
                    .store
                    .load(&id)
                    .await
                    .map_err(GuardError::from_store::<A>)?
                    .map_or(incoming, |existing| existing.version());
                tracing::debug!(kind = A::KIND, aggregate_id = %id, stored, "Replica already exists");
                Ok(GuardOutcome::Skipped(SkipReason::Duplicate { stored, incoming }))
            }
            Err(e) => Err(GuardError::from_store::<A>(e)),
        }
    }

    /// Apply `mutation` only if `incoming_version` is exactly the stored
    /// version plus one, persisting the result at that version.
    ///
    /// # Errors
    ///
    /// - [`GuardError::NotFound`] if nothing is stored under `id`
    /// - [`GuardError::Conflict`] if another writer committed first
    /// - [`GuardError::Store`] for other store failures
    pub async fn apply_if_next_version<F>(
        &self,
        id: &str,
        incoming_version: u64,
        mutation: F,
    ) -> Result<GuardOutcome, GuardError>
    where
        F: FnOnce(&mut A) + Send,
    {
        let mut aggregate = self
            .store
            .load(id)
            .await
            .map_err(GuardError::from_store::<A>)?
            .ok_or_else(|| GuardError::NotFound {
                kind: A::KIND,
                id: id.to_string(),
            })?;

        let stored = aggregate.version();
        if incoming_version != stored + 1 {
            let reason = if incoming_version <= stored {
                SkipReason::Duplicate {
                    stored,
                    incoming: incoming_version,
                }
            } else {
                SkipReason::OutOfOrder {
                    stored,
                    incoming: incoming_version,
                }
            };
            tracing::debug!(
                kind = A::KIND,
                aggregate_id = %id,
                stored,
                incoming = incoming_version,
                ?reason,
                "Event skipped"
            );
            return Ok(GuardOutcome::Skipped(reason));
        }

        mutation(&mut aggregate);
        let persisted = self
            .store
            .compare_and_swap(aggregate, stored)
            .await
            .map_err(GuardError::from_store::<A>)?;

        tracing::debug!(
            kind = A::KIND,
            aggregate_id = %id,
            version = persisted.version(),
            "Event applied"
        );
        Ok(GuardOutcome::Applied {
            version: persisted.version(),
        })
    }
}

/// Failure of a [`VersionedWriter`] update.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpdateError<E> {
    /// The mutation refused the change.
    #[error("{0}")]
    Rejected(E),

    /// Version check or store failure.
    #[error(transparent)]
    Guard(#[from] GuardError),
}

/// Local, command-side writes to aggregates this service owns.
pub struct VersionedWriter<A: Versioned> {
    store: Arc<dyn AggregateStore<A>>,
}

impl<A: Versioned> Clone for VersionedWriter<A> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<A: Versioned> fmt::Debug for VersionedWriter<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionedWriter")
            .field("kind", &A::KIND)
            .finish_non_exhaustive()
    }
}

impl<A: Versioned> VersionedWriter<A> {
    /// Write through `store`.
    #[must_use]
    pub fn new(store: Arc<dyn AggregateStore<A>>) -> Self {
        Self { store }
    }

    /// Load an aggregate.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::Store`] if the store fails.
    pub async fn load(&self, id: &str) -> Result<Option<A>, GuardError> {
        self.store.load(id).await.map_err(GuardError::from_store::<A>)
    }

    /// Persist a brand-new aggregate.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::Store`] if the id is taken or the store fails.
    pub async fn create(&self, aggregate: A) -> Result<A, GuardError> {
        self.store
            .insert(aggregate)
            .await
            .map_err(GuardError::from_store::<A>)
    }

    /// Mutate the aggregate the caller read at `expected_version`.
    ///
    /// The returned aggregate carries `expected_version + 1`.
    ///
    /// # Errors
    ///
    /// - [`UpdateError::Rejected`] if `mutation` refuses the change
    /// - [`GuardError::Conflict`] if the stored version is not `expected_version`
    /// - [`GuardError::NotFound`] if nothing is stored under `id`
    pub async fn update<F, E>(
        &self,
        id: &str,
        expected_version: u64,
        mutation: F,
    ) -> Result<A, UpdateError<E>>
    where
        F: FnOnce(&mut A) -> Result<(), E> + Send,
    {
        let mut aggregate = self.load(id).await?.ok_or_else(|| GuardError::NotFound {
            kind: A::KIND,
            id: id.to_string(),
        })?;

        if aggregate.version() != expected_version {
            return Err(GuardError::Conflict {
                id: id.to_string(),
                expected: expected_version,
                actual: aggregate.version(),
            }
            .into());
        }

        mutation(&mut aggregate).map_err(UpdateError::Rejected)?;
        let persisted = self
            .store
            .compare_and_swap(aggregate, expected_version)
            .await
            .map_err(GuardError::from_store::<A>)?;

        tracing::debug!(
            kind = A::KIND,
            aggregate_id = %id,
            version = persisted.version(),
            "Aggregate updated"
        );
        Ok(persisted)
    }

    /// Read the current aggregate and mutate it at that version.
    ///
    /// The mutation returns `Ok(false)` to leave the aggregate untouched; the
    /// result is then `None` and nothing is written.
    ///
    /// # Errors
    ///
    /// As [`VersionedWriter::update`].
    pub async fn modify<F, E>(&self, id: &str, mutation: F) -> Result<Option<A>, UpdateError<E>>
    where
        F: FnOnce(&mut A) -> Result<bool, E> + Send,
    {
        let mut aggregate = self.load(id).await?.ok_or_else(|| GuardError::NotFound {
            kind: A::KIND,
            id: id.to_string(),
        })?;

        let expected_version = aggregate.version();
        if !mutation(&mut aggregate).map_err(UpdateError::Rejected)? {
            return Ok(None);
        }

        let persisted = self
            .store
            .compare_and_swap(aggregate, expected_version)
            .await
            .map_err(GuardError::from_store::<A>)?;
        Ok(Some(persisted))
    }
}

impl<E: fmt::Display> From<UpdateError<E>> for HandlerError {
    fn from(error: UpdateError<E>) -> Self {
        match error {
            UpdateError::Rejected(e) => Self::Permanent(e.to_string()),
            UpdateError::Guard(e) => e.into(),
        }
    }
}
