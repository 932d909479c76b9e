//! Redpanda event bus adapter for ticketbus.
//!
//! This crate implements the [`EventBus`] trait from `ticketbus-core` on top of
//! rdkafka, so it works with Redpanda or any other Kafka-protocol broker.
//!
//! # Mapping
//!
//! | Bus concept        | Kafka concept                                     |
//! |--------------------|---------------------------------------------------|
//! | subject            | topic (`ticket:created` → `ticket.created`)       |
//! | durable name       | consumer group id                                 |
//! | queue group member | consumer in that group                            |
//! | publish ack        | producer delivery report (`acks` configurable)    |
//! | message sequence   | partition offset                                  |
//! | ack                | offset commit                                     |
//!
//! # Delivery Semantics
//!
//! Kafka has no per-message negative acknowledgment, so redelivery is driven
//! by the consumer task:
//!
//! ```text
//! record ──▶ Delivery(attempt n) ──▶ ack()            ──▶ commit offset, next record
//!                                 └─▶ nack / drop / silence ──▶ wait out ack_wait,
//!                                                              redeliver (attempt n + 1)
//! ```
//!
//! A record is only committed once acknowledged. If the process dies first the
//! group resumes from the last committed offset, so the record comes back.
//! Each consumer holds one record at a time, which keeps a partition in order
//! until its head is settled.
//!
//! Records are keyed by aggregate id, so all versions of one aggregate land on
//! the same partition.
//!
//! # Example
//!
//! ```no_run
//! use ticketbus_redpanda::RedpandaConnector;
//! use ticketbus_runtime::{BusConnection, ConnectionOptions};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let options = ConnectionOptions::new("ticketing", "orders-7f9c", "localhost:9092");
//! let connection = BusConnection::connect(&RedpandaConnector::new(), &options).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use ticketbus_core::envelope::Envelope;
use ticketbus_core::event_bus::{
    AckDecision, AckHandle, BusError, BusFuture, Delivery, DeliveryStream, EventBus, PublishAck,
    RawMessage, StartPosition, SubscriptionOptions,
};
use ticketbus_core::subject::Subject;
use ticketbus_runtime::{ConnectionOptions, Connector};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

/// Default producer send timeout.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of deliveries buffered between the consumer task and the listener.
pub const DEFAULT_BUFFER_SIZE: usize = 16;

/// Kafka topic carrying `subject`.
///
/// Subject names contain `:`, which Kafka does not allow in topic names.
///
/// ```
/// use ticketbus_core::subject::Subject;
/// use ticketbus_redpanda::topic_for;
///
/// assert_eq!(topic_for(Subject::OrderCancelled), "order.cancelled");
/// ```
#[must_use]
pub fn topic_for(subject: Subject) -> String {
    subject.as_str().replace(':', ".")
}

/// `auto.offset.reset` value for a brand-new consumer group.
const fn offset_reset(start: StartPosition) -> &'static str {
    match start {
        StartPosition::AllAvailable => "earliest",
        StartPosition::NewOnly => "latest",
    }
}

/// Redpanda event bus.
///
/// Holds one shared producer. Every [`EventBus::subscribe`] call creates its
/// own consumer, owned by a background task that stops when the stream is
/// dropped or the bus is closed.
pub struct RedpandaEventBus {
    /// Kafka producer for publishing envelopes
    producer: FutureProducer,
    /// Broker addresses (for creating consumers)
    brokers: String,
    /// Client id reported to the brokers
    client_id: Option<String>,
    /// Producer send timeout
    timeout: Duration,
    /// Delivery buffer per subscription
    buffer_size: usize,
    /// Consumer session timeout
    session_timeout: Duration,
    closed: AtomicBool,
    /// Flipped once on close; consumer tasks watch it
    shutdown: watch::Sender<bool>,
}

impl RedpandaEventBus {
    /// Create an event bus with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ConnectionFailed`] if the producer cannot be created.
    pub fn new(brokers: &str) -> Result<Self, BusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the event bus.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use ticketbus_redpanda::RedpandaEventBus;
    ///
    /// # fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let event_bus = RedpandaEventBus::builder()
    ///     .brokers("localhost:9092")
    ///     .producer_acks("all")
    ///     .compression("lz4")
    ///     .timeout(std::time::Duration::from_secs(5))
    ///     .build()?;
    /// # Ok(())
    /// # }
    /// ```
    #[must_use]
    pub fn builder() -> RedpandaEventBusBuilder {
        RedpandaEventBusBuilder::default()
    }

    /// Get a reference to the brokers string.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Ask the brokers for cluster metadata.
    ///
    /// Creating a producer never touches the network, so this is what tells a
    /// reachable cluster from a typo in the broker list.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ConnectionFailed`] if no broker answered in time.
    pub async fn probe(&self) -> Result<usize, BusError> {
        let producer = self.producer.clone();
        let timeout = self.timeout;
        let brokers = tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(None, Timeout::After(timeout))
                .map(|metadata| metadata.brokers().len())
        })
        .await
        .map_err(|e| BusError::ConnectionFailed(format!("Metadata probe aborted: {e}")))?
        .map_err(|e| BusError::ConnectionFailed(format!("No broker reachable: {e}")))?;

        tracing::debug!(brokers = %self.brokers, count = brokers, "Redpanda cluster reachable");
        Ok(brokers)
    }

    fn consumer_config(&self, options: &SubscriptionOptions) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &options.durable_name)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", offset_reset(options.start))
            .set("session.timeout.ms", self.session_timeout.as_millis().to_string())
            .set("enable.partition.eof", "false");
        if let Some(client_id) = &self.client_id {
            config.set("client.id", client_id);
        }
        config
    }
}

/// Builder for configuring a [`RedpandaEventBus`].
#[derive(Debug, Clone, Default)]
pub struct RedpandaEventBusBuilder {
    brokers: Option<String>,
    client_id: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    buffer_size: Option<usize>,
    session_timeout: Option<Duration>,
}

impl RedpandaEventBusBuilder {
    /// Set the broker addresses (comma-separated, e.g. `"localhost:9092"`).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the client id reported to the brokers.
    #[must_use]
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Set the producer acknowledgment mode: `"0"`, `"1"` or `"all"`.
    ///
    /// Default: `"all"`. A publish only resolves once the record is persisted
    /// on every in-sync replica.
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the compression codec: `"none"`, `"gzip"`, `"snappy"`, `"lz4"`, `"zstd"`.
    ///
    /// Default: `"none"`
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the producer send timeout.
    ///
    /// Default: [`DEFAULT_SEND_TIMEOUT`]
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set how many deliveries a subscription buffers ahead of the listener.
    ///
    /// Values below 1 are raised to 1.
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size.max(1));
        self
    }

    /// Set the consumer group session timeout.
    ///
    /// Default: 6 seconds
    #[must_use]
    pub const fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    /// Build the [`RedpandaEventBus`].
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ConnectionFailed`] if:
    /// - Brokers not set
    /// - Cannot create producer
    /// - Invalid configuration
    pub fn build(self) -> Result<RedpandaEventBus, BusError> {
        let brokers = self
            .brokers
            .filter(|b| !b.trim().is_empty())
            .ok_or_else(|| BusError::ConnectionFailed("Brokers not configured".to_string()))?;
        let timeout = self.timeout.unwrap_or(DEFAULT_SEND_TIMEOUT);
        let acks = self.producer_acks.as_deref().unwrap_or("all");
        let compression = self.compression.as_deref().unwrap_or("none");

        let mut producer_config = ClientConfig::new();
        producer_config
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("enable.idempotence", if acks == "all" { "true" } else { "false" })
            .set("compression.type", compression);
        if let Some(client_id) = &self.client_id {
            producer_config.set("client.id", client_id);
        }

        let producer: FutureProducer = producer_config.create().map_err(|e| {
            BusError::ConnectionFailed(format!("Failed to create producer: {e}"))
        })?;

        tracing::info!(
            brokers = %brokers,
            acks,
            compression,
            timeout_ms = timeout.as_millis(),
            "RedpandaEventBus created"
        );

        let (shutdown, _) = watch::channel(false);
        Ok(RedpandaEventBus {
            producer,
            brokers,
            client_id: self.client_id,
            timeout,
            buffer_size: self.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE),
            session_timeout: self.session_timeout.unwrap_or(Duration::from_secs(6)),
            closed: AtomicBool::new(false),
            shutdown,
        })
    }
}

impl EventBus for RedpandaEventBus {
    fn publish(&self, envelope: &Envelope) -> BusFuture<'_, PublishAck> {
        let subject = envelope.subject;
        let key = envelope.aggregate_id.clone();
        let encoded = envelope.encode();

        Box::pin(async move {
            if self.closed.load(Ordering::Acquire) {
                return Err(BusError::Closed);
            }
            let payload = encoded.map_err(|e| BusError::PublishFailed {
                subject,
                reason: e.to_string(),
            })?;
            let topic = topic_for(subject);
            let record = FutureRecord::to(&topic).payload(&payload).key(&key);

            match self.producer.send(record, Timeout::After(self.timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        subject = %subject,
                        partition,
                        offset,
                        key = %key,
                        "Envelope persisted"
                    );
                    Ok(PublishAck {
                        sequence: u64::try_from(offset).unwrap_or_default(),
                    })
                },
                Err((kafka_error, _)) => {
                    tracing::error!(
                        subject = %subject,
                        error = %kafka_error,
                        "Failed to publish envelope"
                    );
                    Err(BusError::PublishFailed {
                        subject,
                        reason: kafka_error.to_string(),
                    })
                },
            }
        })
    }

    fn subscribe(&self, options: &SubscriptionOptions) -> BusFuture<'_, DeliveryStream> {
        let options = options.clone();

        Box::pin(async move {
            if self.closed.load(Ordering::Acquire) {
                return Err(BusError::Closed);
            }
            let subject = options.subject;
            let topic = topic_for(subject);

            let consumer: StreamConsumer = self.consumer_config(&options).create().map_err(|e| {
                BusError::SubscriptionFailed {
                    subject,
                    reason: format!("Failed to create consumer: {e}"),
                }
            })?;
            consumer
                .subscribe(&[topic.as_str()])
                .map_err(|e| BusError::SubscriptionFailed {
                    subject,
                    reason: format!("Failed to subscribe to topic: {e}"),
                })?;

            tracing::info!(
                subject = %subject,
                topic = %topic,
                group = %options.durable_name,
                ack_wait_ms = options.ack_wait.as_millis(),
                auto_offset_reset = offset_reset(options.start),
                "Subscribed"
            );

            let (tx, rx) = mpsc::channel(self.buffer_size);
            let shutdown = self.shutdown.subscribe();
            tokio::spawn(consume(consumer, subject, options.ack_wait, tx, shutdown));

            let stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };
            Ok(Box::pin(stream) as DeliveryStream)
        })
    }

    fn close(&self) -> BusFuture<'_, ()> {
        Box::pin(async move {
            if self.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            self.shutdown.send_replace(true);

            let producer = self.producer.clone();
            let timeout = self.timeout;
            tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
                .await
                .map_err(|e| BusError::TransportError(format!("Flush aborted: {e}")))?
                .map_err(|e| BusError::TransportError(format!("Flush failed: {e}")))?;

            tracing::info!(brokers = %self.brokers, "RedpandaEventBus closed");
            Ok(())
        })
    }
}

/// Owns one consumer: hands records out one at a time and commits each once acked.
async fn consume(
    consumer: StreamConsumer,
    subject: Subject,
    ack_wait: Duration,
    tx: mpsc::Sender<Result<Delivery, BusError>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut stream = consumer.stream();

    loop {
        let next = tokio::select! {
            next = stream.next() => next,
            _ = shutdown.changed() => break,
        };
        let Some(result) = next else { break };

        match result {
            Ok(message) => {
                let sequence = u64::try_from(message.offset()).unwrap_or_default();
                // An empty payload still goes out: the listener decides what is poison.
                let data = message.payload().map(<[u8]>::to_vec).unwrap_or_default();

                match deliver_until_settled(&tx, subject, sequence, &data, ack_wait, &mut shutdown)
                    .await
                {
                    Settled::Acked => {
                        if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                            tracing::warn!(
                                subject = %subject,
                                partition = message.partition(),
                                offset = message.offset(),
                                error = %e,
                                "Failed to commit offset (message may be redelivered)"
                            );
                        }
                    },
                    Settled::SubscriberGone | Settled::Shutdown => break,
                }
            },
            Err(e) => {
                let err = BusError::TransportError(format!("Failed to receive message: {e}"));
                if tx.send(Err(err)).await.is_err() {
                    break;
                }
            },
        }
    }

    tracing::debug!(subject = %subject, "Consumer task exiting");
}

/// How the head record of a consumer was left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    Acked,
    SubscriberGone,
    Shutdown,
}

/// Deliver one record until it is acked, redelivering once per elapsed ack wait.
async fn deliver_until_settled(
    tx: &mpsc::Sender<Result<Delivery, BusError>>,
    subject: Subject,
    sequence: u64,
    data: &[u8],
    ack_wait: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> Settled {
    let mut attempt: u32 = 1;

    loop {
        let (ack, verdict) = AckHandle::pair();
        let deadline = Instant::now() + ack_wait;
        let delivery = Delivery {
            message: RawMessage {
                subject: subject.as_str().to_string(),
                sequence,
                attempt,
                data: data.to_vec(),
            },
            ack,
        };
        if tx.send(Ok(delivery)).await.is_err() {
            return Settled::SubscriberGone;
        }

        let decision = tokio::select! {
            decision = tokio::time::timeout_at(deadline, verdict) => decision,
            () = tx.closed() => return Settled::SubscriberGone,
            _ = shutdown.changed() => return Settled::Shutdown,
        };

        match decision {
            Ok(Ok(AckDecision::Ack)) => return Settled::Acked,
            // Nacked or handle dropped: the rest of the ack wait still applies.
            Ok(Ok(AckDecision::Nack) | Err(_)) => {
                tokio::select! {
                    () = tokio::time::sleep_until(deadline) => {},
                    () = tx.closed() => return Settled::SubscriberGone,
                    _ = shutdown.changed() => return Settled::Shutdown,
                }
            },
            Err(_elapsed) => {},
        }

        attempt = attempt.saturating_add(1);
        tracing::debug!(subject = %subject, sequence, attempt, "Redelivering after ack wait");
    }
}

/// [`Connector`] that opens a [`RedpandaEventBus`] and checks the cluster answers.
///
/// The connection URL is used as the broker list and the client id is passed
/// through to the brokers.
#[derive(Debug, Clone, Default)]
pub struct RedpandaConnector {
    template: RedpandaEventBusBuilder,
}

impl RedpandaConnector {
    /// Connector with default producer settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector that starts every bus from `template`.
    ///
    /// Brokers and client id are always taken from the connection options.
    #[must_use]
    pub const fn with_template(template: RedpandaEventBusBuilder) -> Self {
        Self { template }
    }
}

impl Connector for RedpandaConnector {
    fn connect<'a>(
        &'a self,
        options: &'a ConnectionOptions,
    ) -> BusFuture<'a, Arc<dyn EventBus>> {
        Box::pin(async move {
            let bus = self
                .template
                .clone()
                .brokers(&options.url)
                .client_id(&options.client_id)
                .build()?;
            bus.probe().await?;

            tracing::info!(
                cluster_id = %options.cluster_id,
                client_id = %options.client_id,
                brokers = %options.url,
                "Connected to Redpanda"
            );
            Ok(Arc::new(bus) as Arc<dyn EventBus>)
        })
    }
}
