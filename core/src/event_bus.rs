//! Event bus abstraction: durable, queue-grouped publish/subscribe.
//!
//! This module provides the [`EventBus`] trait implemented by the production
//! adapter and by the in-memory fake broker used in tests, together with the
//! types that cross it: [`SubscriptionOptions`], [`Delivery`] and the explicit
//! [`AckHandle`] capability.
//!
//! # Delivery Semantics
//!
//! ```text
//!   publisher ──publish──▶ broker (persists, assigns sequence) ──▶ PublishAck
//!                            │
//!                            │ one member per queue group
//!                            ▼
//!                         Delivery { message, ack }
//!                            │
//!               ack() ◀──────┴──────▶ nack() / dropped / no verdict
//!               settled                 redelivered (attempt + 1) once ackWait elapses
//! ```
//!
//! - **At-least-once**: a message is redelivered until a member of the queue
//!   group acknowledges it. Redelivery happens when the ack wait of the
//!   previous attempt elapses, never earlier, so a failing message cannot
//!   spin.
//! - **No ordering across redelivery**: a redelivered message may arrive after
//!   later messages of the same subject.
//! - **Durable**: a consumer that resubscribes under the same durable name
//!   resumes with the unacknowledged messages instead of starting over.
//! - **Broker sequence is bookkeeping only**: it must never be used for causal
//!   ordering; aggregates carry their own version.

use crate::envelope::Envelope;
use crate::subject::Subject;
use futures::Stream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

/// Default time the broker waits for an acknowledgment before redelivering.
pub const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(5);

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Failed to connect to the event bus
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish an event
    #[error("Publish failed for subject '{subject}': {reason}")]
    PublishFailed {
        /// The subject that failed
        subject: Subject,
        /// The reason for failure
        reason: String,
    },

    /// Failed to open a subscription
    #[error("Subscription failed for subject '{subject}': {reason}")]
    SubscriptionFailed {
        /// The subject that failed
        subject: Subject,
        /// The reason for failure
        reason: String,
    },

    /// The connection has been closed
    #[error("Event bus connection is closed")]
    Closed,

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// Broker acknowledgment of a persisted publish.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublishAck {
    /// Broker-assigned sequence number
    pub sequence: u64,
}

/// Where a brand-new durable subscription starts reading.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StartPosition {
    /// Replay every message still held for the subject.
    #[default]
    AllAvailable,
    /// Only messages published after the subscription was created.
    NewOnly,
}

/// Parameters of a durable, queue-grouped subscription.
///
/// # Example
///
/// ```
/// use ticketbus_core::event_bus::SubscriptionOptions;
/// use ticketbus_core::subject::Subject;
/// use std::time::Duration;
///
/// let options = SubscriptionOptions::new(Subject::OrderCreated, "tickets-service")
///     .with_ack_wait(Duration::from_secs(10));
///
/// assert_eq!(options.durable_name, "tickets-service");
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionOptions {
    /// Subject to consume
    pub subject: Subject,
    /// Members of the same group share the messages (one member per message)
    pub queue_group: String,
    /// Name under which the broker remembers the consumer position
    pub durable_name: String,
    /// How long the broker waits for an ack before redelivering
    pub ack_wait: Duration,
    /// Starting point of a new durable subscription
    pub start: StartPosition,
}

impl SubscriptionOptions {
    /// Options for `subject` in `queue_group`; the durable name defaults to the
    /// queue group and the ack wait to [`DEFAULT_ACK_WAIT`].
    #[must_use]
    pub fn new(subject: Subject, queue_group: impl Into<String>) -> Self {
        let queue_group = queue_group.into();
        Self {
            subject,
            durable_name: queue_group.clone(),
            queue_group,
            ack_wait: DEFAULT_ACK_WAIT,
            start: StartPosition::default(),
        }
    }

    /// Override the durable name.
    #[must_use]
    pub fn with_durable_name(mut self, durable_name: impl Into<String>) -> Self {
        self.durable_name = durable_name.into();
        self
    }

    /// Override the ack wait.
    #[must_use]
    pub const fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    /// Override the start position.
    #[must_use]
    pub const fn with_start(mut self, start: StartPosition) -> Self {
        self.start = start;
        self
    }
}

/// Consumer verdict on one delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckDecision {
    /// Processed; never deliver again.
    Ack,
    /// Not processed; redeliver once the ack wait elapses.
    Nack,
}

/// Capability to settle exactly one delivery.
///
/// Both methods consume the handle, so a delivery cannot be settled twice.
/// Dropping the handle without calling either leaves the message
/// unacknowledged: the broker redelivers it once the ack wait elapses.
#[derive(Debug)]
pub struct AckHandle {
    tx: oneshot::Sender<AckDecision>,
}

impl AckHandle {
    /// Create a handle and the receiver the broker waits on.
    #[must_use]
    pub fn pair() -> (Self, oneshot::Receiver<AckDecision>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Acknowledge the delivery.
    ///
    /// Returns `false` if the broker already gave up waiting (ack wait elapsed
    /// or subscription closed); the message will then be redelivered anyway.
    pub fn ack(self) -> bool {
        self.tx.send(AckDecision::Ack).is_ok()
    }

    /// Release the delivery unprocessed; the broker redelivers it when the
    /// ack wait elapses.
    ///
    /// Returns `false` if the broker already gave up waiting.
    pub fn nack(self) -> bool {
        self.tx.send(AckDecision::Nack).is_ok()
    }
}

/// Message as delivered by the broker, before any decoding.
#[derive(Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Subject (topic) the message arrived on
    pub subject: String,
    /// Broker sequence (delivery bookkeeping only)
    pub sequence: u64,
    /// Delivery attempt, starting at 1
    pub attempt: u32,
    /// Encoded [`Envelope`] bytes
    pub data: Vec<u8>,
}

impl RawMessage {
    /// Whether this is a redelivery.
    #[must_use]
    pub const fn redelivered(&self) -> bool {
        self.attempt > 1
    }
}

impl fmt::Debug for RawMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawMessage")
            .field("subject", &self.subject)
            .field("sequence", &self.sequence)
            .field("attempt", &self.attempt)
            .field("size", &self.data.len())
            .finish()
    }
}

/// One delivery of a message to a subscriber, with its ack capability.
#[derive(Debug)]
pub struct Delivery {
    /// The delivered message
    pub message: RawMessage,
    /// Capability to settle this delivery
    pub ack: AckHandle,
}

/// Stream of deliveries from a subscription.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, BusError>> + Send>>;

/// Boxed future returned by [`EventBus`] methods.
pub type BusFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BusError>> + Send + 'a>>;

/// Trait for event bus implementations.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// so connections can hold it as `Arc<dyn EventBus>`.
pub trait EventBus: Send + Sync {
    /// Publish an envelope and wait for the broker to persist it.
    ///
    /// Resolves once the broker has acknowledged persistence, not once
    /// subscribers have consumed the message.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::PublishFailed`] if the broker rejects the message, or
    /// [`BusError::Closed`] after [`EventBus::close`].
    fn publish(&self, envelope: &Envelope) -> BusFuture<'_, PublishAck>;

    /// Open a durable, queue-grouped subscription.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::SubscriptionFailed`] if the broker refuses it.
    fn subscribe(&self, options: &SubscriptionOptions) -> BusFuture<'_, DeliveryStream>;

    /// Close the connection and release broker resources.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::TransportError`] if buffered messages could not be flushed.
    fn close(&self) -> BusFuture<'_, ()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ack_reaches_the_broker() {
        let (handle, rx) = AckHandle::pair();
        assert!(handle.ack());
        assert_eq!(rx.await, Ok(AckDecision::Ack));
    }

    #[tokio::test]
    async fn dropped_handle_is_observed_as_closed() {
        let (handle, rx) = AckHandle::pair();
        drop(handle);
        assert!(rx.await.is_err());
    }

    #[test]
    fn nack_after_broker_gave_up_reports_false() {
        let (handle, rx) = AckHandle::pair();
        drop(rx);
        assert!(!handle.nack());
    }

    #[test]
    fn subscription_defaults() {
        let options = SubscriptionOptions::new(Subject::TicketCreated, "orders-service");
        assert_eq!(options.queue_group, "orders-service");
        assert_eq!(options.durable_name, "orders-service");
        assert_eq!(options.ack_wait, DEFAULT_ACK_WAIT);
        assert_eq!(options.start, StartPosition::AllAvailable);
    }

    #[test]
    fn event_bus_is_dyn_compatible() {
        fn assert_object(_: Option<&dyn EventBus>) {}
        assert_object(None);
    }
}
