//! Ticketing services on the ticketbus event bus.
//!
//! Four services cooperate only through events:
//!
//! ```text
//!  ┌─────────┐  ticket:created/updated   ┌────────┐  order:created        ┌────────────┐
//!  │ tickets │ ────────────────────────► │ orders │ ────────────────────► │ expiration │
//!  │         │ ◄──────────────────────── │        │ ◄──────────────────── │            │
//!  └─────────┘  order:created/cancelled  └────────┘  expiration:complete  └────────────┘
//!                                          │    ▲
//!                  order:created/cancelled │    │ payment:created
//!                                          ▼    │
//!                                        ┌──────────┐
//!                                        │ payments │
//!                                        └──────────┘
//! ```
//!
//! Each service owns its aggregates and keeps version-gated replicas of the
//! ones it needs from others, so redelivered or reordered events never
//! corrupt local state.
//!
//! # Modules
//!
//! - [`aggregates`]: owned aggregates and replicas
//! - [`tickets`], [`orders`], [`expiration`], [`payments`]: command services
//!   and event handlers
//! - [`config`]: environment configuration
//! - [`bootstrap`]: listener wiring and graceful shutdown

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aggregates;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod expiration;
pub mod orders;
pub mod payment_gateway;
pub mod payments;
pub mod tickets;

pub use bootstrap::{ServiceRuntime, init_tracing};
pub use config::{Config, ConfigError, ServiceKind};
pub use error::{DomainError, ServiceError};
