//! # Ticketbus Core
//!
//! Core traits and types for the ticketing event bus.
//!
//! This crate defines everything the services agree on, with no I/O of its own:
//!
//! - [`subject`]: the closed set of event subjects
//! - [`contract`]: subject → payload schema, checked on publish and on receipt
//! - [`events`]: typed payloads and the [`events::DomainEvent`] union
//! - [`envelope`]: the wire envelope and correlation ids
//! - [`event_bus`]: the [`event_bus::EventBus`] trait, subscriptions, deliveries
//!   and the explicit ack capability
//! - [`aggregate`]: versioned aggregates and the compare-and-swap store trait
//! - [`dead_letter`]: parking place for poison messages
//! - [`clock`]: injectable time
//!
//! ## Architecture Principles
//!
//! - At-least-once delivery everywhere; consumers are idempotent
//! - Per-aggregate versions, never broker sequence numbers, decide ordering
//! - The version compare-and-swap is the only concurrency control
//! - Dependency injection via traits (bus, store, clock)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aggregate;
pub mod clock;
pub mod contract;
pub mod dead_letter;
pub mod envelope;
pub mod event_bus;
pub mod events;
pub mod subject;

// Re-export commonly used types
pub use aggregate::{AggregateStore, StoreError, Versioned};
pub use contract::{ContractError, Schema, schema_for, schema_for_name};
pub use dead_letter::{DeadLetter, DeadLetterError, DeadLetterSink};
pub use envelope::{CorrelationId, Envelope, EnvelopeError};
pub use event_bus::{
    AckDecision, AckHandle, BusError, Delivery, DeliveryStream, EventBus, PublishAck,
    RawMessage, StartPosition, SubscriptionOptions,
};
pub use events::{DomainEvent, EventPayload, OrderStatus};
pub use subject::Subject;
