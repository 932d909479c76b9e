//! Typed publishing with broker acknowledgment.
//!
//! [`Publisher::publish`] returns only once the broker has persisted the
//! message. A [`PublishError::Timeout`] means the outcome is unknown: the
//! message may or may not have been persisted. Callers that retry therefore
//! rely on consumer-side idempotence (see [`ConcurrencyGuard`](crate::ConcurrencyGuard)).

use crate::connection::BusConnection;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use ticketbus_core::clock::{Clock, SystemClock};
use ticketbus_core::contract::schema_for_name;
use ticketbus_core::envelope::{CorrelationId, Envelope, EnvelopeError};
use ticketbus_core::event_bus::BusError;
use ticketbus_core::events::{DomainEvent, EventPayload};
use ticketbus_core::subject::Subject;

/// Default time to wait for the broker's publish acknowledgment.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors returned by [`Publisher`].
#[derive(Error, Debug)]
pub enum PublishError {
    /// No broker acknowledgment within the timeout; the message may or may
    /// not have been persisted.
    #[error("Publish to '{subject}' not acknowledged within {timeout:?}")]
    Timeout {
        /// Subject of the publish
        subject: Subject,
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// The connection is closing or closed.
    #[error("Connection closed")]
    Closed,

    /// The broker rejected the publish or the transport failed.
    #[error("Transport error: {0}")]
    Transport(BusError),

    /// The payload could not be encoded or violates its subject's schema.
    #[error("Serialization error: {0}")]
    Serialization(#[from] EnvelopeError),

    /// Raw publish named a subject outside the closed set.
    #[error("Unknown subject: {0}")]
    UnknownSubject(String),
}

impl PublishError {
    /// Whether publishing the same event again may succeed.
    ///
    /// Timeouts and transport failures are worth another try; a closed
    /// connection or a malformed payload are not.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Transport(_))
    }
}

impl From<BusError> for PublishError {
    fn from(error: BusError) -> Self {
        match error {
            BusError::Closed => Self::Closed,
            other => Self::Transport(other),
        }
    }
}

/// Publishes typed events over the shared connection.
///
/// Cheap to clone; every clone shares the same connection.
#[derive(Clone)]
pub struct Publisher {
    connection: BusConnection,
    ack_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("connection", &self.connection)
            .field("ack_timeout", &self.ack_timeout)
            .finish_non_exhaustive()
    }
}

impl Publisher {
    /// Create a publisher waiting at most `ack_timeout` per publish.
    #[must_use]
    pub fn new(connection: BusConnection, ack_timeout: Duration) -> Self {
        Self {
            connection,
            ack_timeout,
            clock: Arc::new(SystemClock),
        }
    }

    /// Stamp envelopes with `clock` instead of the system clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Acknowledgment timeout in use.
    #[must_use]
    pub const fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }

    /// Publish `event` under its subject and wait for the broker to persist it.
    ///
    /// # Errors
    ///
    /// - [`PublishError::Serialization`] if the payload violates its schema;
    ///   nothing is sent
    /// - [`PublishError::Closed`] if the connection is closing
    /// - [`PublishError::Timeout`] if the broker did not answer in time
    /// - [`PublishError::Transport`] if the broker rejected the message
    pub async fn publish<E: EventPayload>(&self, event: &E) -> Result<CorrelationId, PublishError> {
        let envelope = Envelope::from_payload(event, self.clock.now())?;
        self.send(envelope).await
    }

    /// Publish an already-built [`DomainEvent`].
    ///
    /// # Errors
    ///
    /// Same as [`Publisher::publish`].
    pub async fn publish_event(&self, event: &DomainEvent) -> Result<CorrelationId, PublishError> {
        match event {
            DomainEvent::TicketCreated(e) => self.publish(e).await,
            DomainEvent::TicketUpdated(e) => self.publish(e).await,
            DomainEvent::OrderCreated(e) => self.publish(e).await,
            DomainEvent::OrderCancelled(e) => self.publish(e).await,
            DomainEvent::ExpirationComplete(e) => self.publish(e).await,
            DomainEvent::PaymentCreated(e) => self.publish(e).await,
        }
    }

    /// Publish untyped JSON under a subject given by name.
    ///
    /// The payload is still checked against the subject's schema.
    ///
    /// # Errors
    ///
    /// - [`PublishError::UnknownSubject`] if `subject` is not a known subject
    /// - otherwise as [`Publisher::publish`]
    pub async fn publish_raw(
        &self,
        subject: &str,
        payload: &Value,
    ) -> Result<CorrelationId, PublishError> {
        let schema =
            schema_for_name(subject).map_err(|_| PublishError::UnknownSubject(subject.to_string()))?;
        let bytes = serde_json::to_vec(payload).map_err(|e| {
            EnvelopeError::Encode(format!("payload for {}: {e}", schema.subject))
        })?;
        let event = DomainEvent::decode(schema.subject, &bytes).map_err(EnvelopeError::from)?;
        self.publish_event(&event).await
    }

    async fn send(&self, envelope: Envelope) -> Result<CorrelationId, PublishError> {
        let _permit = self.connection.begin_publish()?;
        let subject = envelope.subject;

        tracing::debug!(
            subject = %subject,
            correlation_id = %envelope.correlation_id,
            aggregate_id = %envelope.aggregate_id,
            "Publishing event"
        );

        let ack = tokio::time::timeout(self.ack_timeout, self.connection.bus().publish(&envelope))
            .await
            .map_err(|_| {
                metrics::counter!("ticketbus.publisher.timeouts", "subject" => subject.as_str())
                    .increment(1);
                tracing::warn!(
                    subject = %subject,
                    correlation_id = %envelope.correlation_id,
                    timeout_ms = self.ack_timeout.as_millis(),
                    "Publish not acknowledged in time"
                );
                PublishError::Timeout {
                    subject,
                    timeout: self.ack_timeout,
                }
            })??;

        metrics::counter!("ticketbus.publisher.published", "subject" => subject.as_str())
            .increment(1);
        tracing::info!(
            subject = %subject,
            sequence = ack.sequence,
            correlation_id = %envelope.correlation_id,
            "Event published"
        );

        Ok(envelope.correlation_id)
    }
}
