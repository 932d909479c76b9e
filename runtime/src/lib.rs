//! # Ticketbus Runtime
//!
//! Runtime pieces that sit on top of [`ticketbus_core`]'s traits.
//!
//! ## Core Components
//!
//! - [`connection`]: the process-wide [`BusConnection`], connect with backoff,
//!   close with drain, shutdown signal
//! - [`publisher`]: typed publish with broker acknowledgment and timeout
//! - [`listener`]: durable queue-group consumption with explicit ack,
//!   escalation and optional dead-lettering
//! - [`guard`]: version-gated writes ([`ConcurrencyGuard`], [`VersionedWriter`])
//! - [`retry`]: exponential backoff
//!
//! ## Example
//!
//! ```ignore
//! use ticketbus_runtime::{BusConnection, ConnectionOptions, Publisher};
//!
//! let connection = BusConnection::connect(&connector, &options).await?;
//! let publisher = Publisher::new(connection.clone(), Duration::from_secs(5));
//! publisher.publish(&ticket_created).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod connection;
pub mod guard;
pub mod listener;
pub mod publisher;
pub mod retry;

pub use connection::{
    BusConnection, CloseReport, ConnectionError, ConnectionOptions, Connector, InFlightPublish,
    shutdown_signal,
};
pub use guard::{
    ConcurrencyGuard, GuardError, GuardOutcome, OutOfOrderPolicy, SkipReason, UpdateError,
    VersionedWriter,
};
pub use listener::{
    ChannelEscalation, DeserializationError, EscalationSink, EventHandler, HandlerError,
    HandlerFuture, Listener, ListenerState, MessageContext, MessageOutcome, OperatorAlert,
    TracingEscalation,
};
pub use publisher::{DEFAULT_PUBLISH_TIMEOUT, PublishError, Publisher};
pub use retry::{RetryPolicy, retry_with_backoff, retry_with_predicate};
