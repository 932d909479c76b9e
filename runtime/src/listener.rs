//! Durable queue-group listener with explicit acknowledgment.
//!
//! A [`Listener`] owns one subscription and one [`EventHandler`]. Every
//! delivery is decoded against its subject's contract and handed to the
//! handler; the delivery is acknowledged only after the handler succeeds.
//!
//! # Verdicts
//!
//! | Situation                          | Broker sees | Outcome                          |
//! |------------------------------------|-------------|----------------------------------|
//! | handler `Ok`                       | ack         | [`MessageOutcome::Acked`]        |
//! | undecodable message                | nack        | [`MessageOutcome::Retrying`]     |
//! | `Transient` / `Conflict`           | nack        | [`MessageOutcome::Retrying`]     |
//! | `Permanent`                        | nack        | [`MessageOutcome::Escalated`]    |
//! | poison at `max_deliveries` with DLQ| ack         | [`MessageOutcome::DeadLettered`] |
//!
//! No ordering is assumed between deliveries; handlers that replicate
//! aggregates go through [`ConcurrencyGuard`](crate::ConcurrencyGuard).

use crate::connection::BusConnection;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use ticketbus_core::dead_letter::{DeadLetter, DeadLetterSink};
use ticketbus_core::envelope::{CorrelationId, Envelope, EnvelopeError};
use ticketbus_core::event_bus::{
    AckHandle, BusError, Delivery, DeliveryStream, RawMessage, SubscriptionOptions,
};
use ticketbus_core::events::EventPayload;
use ticketbus_core::subject::Subject;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// Error returned by an [`EventHandler`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Temporary failure (store unavailable, prerequisite not yet replicated).
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Lost an optimistic-concurrency race; the event is re-evaluated on redelivery.
    #[error("Version conflict: {0}")]
    Conflict(String),

    /// Will fail the same way on every delivery; needs an operator.
    #[error("Permanent failure: {0}")]
    Permanent(String),
}

/// Message could not be turned into the handler's event type.
#[derive(Error, Debug)]
pub enum DeserializationError {
    /// Envelope or payload decode failed.
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    /// Message arrived on a subject this listener does not consume.
    #[error("Expected subject '{expected}', message carries '{actual}'")]
    SubjectMismatch {
        /// Subject of the subscription
        expected: Subject,
        /// Subject found on the message
        actual: String,
    },
}

/// Delivery metadata passed to the handler alongside the event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageContext {
    /// Subject of the message
    pub subject: Subject,
    /// Broker sequence (bookkeeping only, never for ordering)
    pub sequence: u64,
    /// Delivery attempt, starting at 1
    pub attempt: u32,
    /// Correlation id of the originating publish
    pub correlation_id: CorrelationId,
    /// When the publisher sent it
    pub published_at: DateTime<Utc>,
}

/// Boxed future returned by [`EventHandler::handle`].
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;

/// Subject-specific processing of one event.
///
/// Handlers must be idempotent: the same event can arrive more than once.
pub trait EventHandler: Send + Sync + 'static {
    /// Payload type; its subject is the subject consumed.
    type Event: EventPayload;

    /// Process one event.
    ///
    /// # Errors
    ///
    /// Any [`HandlerError`] leaves the message unacknowledged.
    fn handle<'a>(&'a self, event: Self::Event, context: &'a MessageContext) -> HandlerFuture<'a>;
}

/// What happened to one delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Processed and acknowledged.
    Acked,
    /// Left for redelivery.
    Retrying,
    /// Permanent failure reported to the operator; left for redelivery.
    Escalated,
    /// Parked in the dead-letter sink and acknowledged.
    DeadLettered,
}

/// Subscription state of a listener.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ListenerState {
    /// No open subscription.
    #[default]
    Unsubscribed,
    /// Subscription open, deliveries flowing.
    Subscribed,
}

/// A failure that needs a human.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorAlert {
    /// Subject of the failing message
    pub subject: Subject,
    /// Queue group of the listener
    pub queue_group: String,
    /// Broker sequence
    pub sequence: u64,
    /// Delivery attempt
    pub attempt: u32,
    /// Correlation id of the originating publish
    pub correlation_id: CorrelationId,
    /// Handler error
    pub error: String,
    /// When the alert was raised
    pub raised_at: DateTime<Utc>,
}

/// Operator-visible error channel.
pub trait EscalationSink: Send + Sync {
    /// Report an alert. Must not block.
    fn escalate(&self, alert: OperatorAlert);
}

/// Reports alerts as `error`-level tracing events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEscalation;

impl EscalationSink for TracingEscalation {
    fn escalate(&self, alert: OperatorAlert) {
        error!(
            subject = %alert.subject,
            queue_group = %alert.queue_group,
            sequence = alert.sequence,
            attempt = alert.attempt,
            correlation_id = %alert.correlation_id,
            error = %alert.error,
            "Operator attention required"
        );
    }
}

/// Forwards alerts into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelEscalation {
    tx: mpsc::UnboundedSender<OperatorAlert>,
}

impl ChannelEscalation {
    /// Create the sink and the receiving end of its channel.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OperatorAlert>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EscalationSink for ChannelEscalation {
    fn escalate(&self, alert: OperatorAlert) {
        TracingEscalation.escalate(alert.clone());
        if self.tx.send(alert).is_err() {
            warn!("Escalation channel closed, alert only logged");
        }
    }
}

#[derive(Clone)]
struct DeadLetterPolicy {
    sink: Arc<dyn DeadLetterSink>,
    max_deliveries: u32,
}

/// Consumes one subject for one queue group.
pub struct Listener<H: EventHandler> {
    connection: BusConnection,
    handler: Arc<H>,
    options: SubscriptionOptions,
    dead_letter: Option<DeadLetterPolicy>,
    escalation: Arc<dyn EscalationSink>,
    retry_delay: Duration,
    state: ListenerState,
}

impl<H: EventHandler> fmt::Debug for Listener<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("options", &self.options)
            .field("dead_letter", &self.dead_letter.as_ref().map(|p| p.max_deliveries))
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<H: EventHandler> Listener<H> {
    /// Create an unsubscribed listener.
    #[must_use]
    pub fn new(connection: BusConnection, handler: Arc<H>, options: SubscriptionOptions) -> Self {
        Self {
            connection,
            handler,
            options,
            dead_letter: None,
            escalation: Arc::new(TracingEscalation),
            retry_delay: Duration::from_secs(5),
            state: ListenerState::Unsubscribed,
        }
    }

    /// Park poison messages in `sink` once they reach `max_deliveries` attempts.
    #[must_use]
    pub fn with_dead_letter(mut self, sink: Arc<dyn DeadLetterSink>, max_deliveries: u32) -> Self {
        self.dead_letter = Some(DeadLetterPolicy {
            sink,
            max_deliveries: max_deliveries.max(1),
        });
        self
    }

    /// Report permanent failures to `sink` instead of only logging them.
    #[must_use]
    pub fn with_escalation(mut self, sink: Arc<dyn EscalationSink>) -> Self {
        self.escalation = sink;
        self
    }

    /// Delay before resubscribing after the stream ends (default 5s).
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Subscription parameters.
    #[must_use]
    pub const fn options(&self) -> &SubscriptionOptions {
        &self.options
    }

    /// Current subscription state.
    #[must_use]
    pub const fn state(&self) -> ListenerState {
        self.state
    }

    /// Open the durable queue-group subscription.
    ///
    /// # Errors
    ///
    /// - [`BusError::SubscriptionFailed`] if the options name a subject other
    ///   than the handler's, or the broker refuses
    /// - [`BusError::Closed`] if the connection is closing
    pub async fn subscribe(&mut self) -> Result<DeliveryStream, BusError> {
        if self.options.subject != H::Event::SUBJECT {
            return Err(BusError::SubscriptionFailed {
                subject: self.options.subject,
                reason: format!("handler consumes {}", H::Event::SUBJECT),
            });
        }
        if self.connection.is_closing() {
            return Err(BusError::Closed);
        }

        let stream = self.connection.bus().subscribe(&self.options).await?;
        self.state = ListenerState::Subscribed;
        info!(
            subject = %self.options.subject,
            queue_group = %self.options.queue_group,
            durable_name = %self.options.durable_name,
            "Listener subscribed"
        );
        Ok(stream)
    }

    /// Decode, handle and settle one delivery.
    pub async fn on_message(&self, delivery: Delivery) -> MessageOutcome {
        let Delivery { message, ack } = delivery;

        let (event, context) = match self.decode(&message) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(
                    subject = %message.subject,
                    queue_group = %self.options.queue_group,
                    sequence = message.sequence,
                    attempt = message.attempt,
                    error = %e,
                    "Failed to deserialize message, leaving it unacknowledged"
                );
                return self.poison(&message, ack, &e.to_string(), MessageOutcome::Retrying).await;
            }
        };

        debug!(
            subject = %context.subject,
            queue_group = %self.options.queue_group,
            sequence = context.sequence,
            attempt = context.attempt,
            aggregate_id = %event.aggregate_id(),
            version = ?event.version(),
            "Handling event"
        );

        match self.handler.handle(event, &context).await {
            Ok(()) => {
                ack.ack();
                self.count("ticketbus.listener.acked");
                MessageOutcome::Acked
            }
            Err(e @ (HandlerError::Transient(_) | HandlerError::Conflict(_))) => {
                warn!(
                    subject = %context.subject,
                    queue_group = %self.options.queue_group,
                    sequence = context.sequence,
                    attempt = context.attempt,
                    error = %e,
                    "Handler failed, message will be redelivered"
                );
                ack.nack();
                self.count("ticketbus.listener.retried");
                MessageOutcome::Retrying
            }
            Err(e @ HandlerError::Permanent(_)) => {
                self.escalation.escalate(OperatorAlert {
                    subject: context.subject,
                    queue_group: self.options.queue_group.clone(),
                    sequence: context.sequence,
                    attempt: context.attempt,
                    correlation_id: context.correlation_id.clone(),
                    error: e.to_string(),
                    raised_at: Utc::now(),
                });
                self.count("ticketbus.listener.escalated");
                self.poison(&message, ack, &e.to_string(), MessageOutcome::Escalated).await
            }
        }
    }

    /// Run the subscribe-process-resubscribe loop until `shutdown` fires.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(subject = %self.options.subject, queue_group = %self.options.queue_group, "Listener started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(subject = %self.options.subject, "Listener received shutdown signal");
                    break;
                }
                subscribed = self.subscribe() => {
                    match subscribed {
                        Ok(mut stream) => {
                            if self.process_stream(&mut stream, &mut shutdown).await {
                                break;
                            }
                            self.state = ListenerState::Unsubscribed;
                            warn!(
                                subject = %self.options.subject,
                                "Delivery stream ended, resubscribing in {:?}",
                                self.retry_delay
                            );
                        }
                        Err(BusError::Closed) => {
                            info!(subject = %self.options.subject, "Connection closed, listener stopping");
                            break;
                        }
                        Err(e) => {
                            error!(
                                subject = %self.options.subject,
                                error = %e,
                                "Failed to subscribe, retrying in {:?}",
                                self.retry_delay
                            );
                        }
                    }
                }
            }

            tokio::select! {
                _ = shutdown.recv() => break,
                () = tokio::time::sleep(self.retry_delay) => {}
            }
        }

        self.state = ListenerState::Unsubscribed;
        info!(subject = %self.options.subject, queue_group = %self.options.queue_group, "Listener stopped");
    }

    /// Spawn [`Listener::run`] as a background task.
    #[must_use]
    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Returns `true` if shutdown was requested.
    async fn process_stream(
        &self,
        stream: &mut DeliveryStream,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> bool {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(subject = %self.options.subject, "Listener received shutdown signal during processing");
                    return true;
                }
                next = stream.next() => match next {
                    Some(Ok(delivery)) => {
                        self.on_message(delivery).await;
                    }
                    Some(Err(e)) => {
                        error!(subject = %self.options.subject, error = %e, "Error receiving delivery");
                    }
                    None => return false,
                },
            }
        }
    }

    fn decode(
        &self,
        message: &RawMessage,
    ) -> Result<(H::Event, MessageContext), DeserializationError> {
        if message.subject != self.options.subject.as_str() {
            return Err(DeserializationError::SubjectMismatch {
                expected: self.options.subject,
                actual: message.subject.clone(),
            });
        }

        let envelope = Envelope::decode(&message.data)?;
        let event = envelope.payload::<H::Event>()?;
        let context = MessageContext {
            subject: envelope.subject,
            sequence: message.sequence,
            attempt: message.attempt,
            correlation_id: envelope.correlation_id,
            published_at: envelope.published_at,
        };
        Ok((event, context))
    }

    /// Dead-letter the message if it qualifies, otherwise nack it.
    async fn poison(
        &self,
        message: &RawMessage,
        ack: AckHandle,
        reason: &str,
        fallback: MessageOutcome,
    ) -> MessageOutcome {
        let Some(policy) = self
            .dead_letter
            .as_ref()
            .filter(|p| message.attempt >= p.max_deliveries)
        else {
            ack.nack();
            self.count("ticketbus.listener.retried");
            return fallback;
        };

        let letter = DeadLetter {
            subject: message.subject.clone(),
            queue_group: self.options.queue_group.clone(),
            sequence: message.sequence,
            attempts: message.attempt,
            data: message.data.clone(),
            error: reason.to_string(),
            failed_at: Utc::now(),
        };

        match policy.sink.record(letter).await {
            Ok(()) => {
                ack.ack();
                self.count("ticketbus.listener.dead_lettered");
                error!(
                    subject = %message.subject,
                    queue_group = %self.options.queue_group,
                    sequence = message.sequence,
                    attempts = message.attempt,
                    error = %reason,
                    "Message dead-lettered"
                );
                MessageOutcome::DeadLettered
            }
            Err(e) => {
                error!(
                    subject = %message.subject,
                    sequence = message.sequence,
                    error = %e,
                    "Dead-letter write failed, message stays unacknowledged"
                );
                ack.nack();
                self.count("ticketbus.listener.retried");
                fallback
            }
        }
    }

    fn count(&self, name: &'static str) {
        metrics::counter!(
            name,
            "subject" => self.options.subject.as_str(),
            "queue_group" => self.options.queue_group.clone()
        )
        .increment(1);
    }
}
