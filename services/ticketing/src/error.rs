//! Errors surfaced by the command side of the services.

use crate::payment_gateway::GatewayError;
use thiserror::Error;
use ticketbus_runtime::{GuardError, HandlerError, PublishError, UpdateError};

/// A command broke a business rule.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// No such aggregate.
    #[error("{kind} '{id}' not found")]
    NotFound {
        /// Aggregate kind
        kind: &'static str,
        /// Aggregate id
        id: String,
    },

    /// The ticket is held by an order.
    #[error("Ticket '{0}' is reserved")]
    Reserved(String),

    /// The order was cancelled.
    #[error("Order '{0}' is cancelled")]
    Cancelled(String),

    /// The caller does not own the aggregate.
    #[error("Not authorized")]
    NotOwner,

    /// Input failed validation.
    #[error("Invalid request: {0}")]
    Invalid(String),
}

/// Failure of a command: the rule check, the write or the publish.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Business rule violation
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Store failure or version conflict
    #[error(transparent)]
    Store(GuardError),

    /// The change was saved but its event was not acknowledged by the bus
    #[error("Event not published: {0}")]
    Publish(#[from] PublishError),

    /// Payment provider refused or failed the charge
    #[error("Payment failed: {0}")]
    Gateway(#[from] GatewayError),
}

impl From<GuardError> for ServiceError {
    fn from(error: GuardError) -> Self {
        match error {
            GuardError::NotFound { kind, id } => Self::Domain(DomainError::NotFound { kind, id }),
            other => Self::Store(other),
        }
    }
}

impl From<UpdateError<DomainError>> for ServiceError {
    fn from(error: UpdateError<DomainError>) -> Self {
        match error {
            UpdateError::Rejected(e) => Self::Domain(e),
            UpdateError::Guard(e) => e.into(),
        }
    }
}

/// Listener verdict for a failed publish. The bus may recover, so the
/// message is left for redelivery.
pub(crate) fn publish_failed(error: &PublishError) -> HandlerError {
    HandlerError::Transient(format!("publish failed: {error}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_updates_stay_domain_errors() {
        let error = ServiceError::from(UpdateError::Rejected(DomainError::NotOwner));
        assert!(matches!(error, ServiceError::Domain(DomainError::NotOwner)));
    }

    #[test]
    fn conflicts_stay_store_errors() {
        let error = ServiceError::from(UpdateError::<DomainError>::Guard(GuardError::Conflict {
            id: "t-1".to_string(),
            expected: 0,
            actual: 1,
        }));
        assert!(matches!(error, ServiceError::Store(GuardError::Conflict { .. })));
    }

    #[test]
    fn missing_aggregates_are_domain_errors() {
        let error = ServiceError::from(GuardError::NotFound {
            kind: "order",
            id: "o-1".to_string(),
        });
        assert!(matches!(
            error,
            ServiceError::Domain(DomainError::NotFound { kind: "order", .. })
        ));
    }

    #[test]
    fn publish_failures_are_retried() {
        assert!(matches!(
            publish_failed(&PublishError::Closed),
            HandlerError::Transient(_)
        ));
    }
}
