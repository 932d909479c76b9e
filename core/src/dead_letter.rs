//! Dead-letter escape hatch for messages that can never be processed.
//!
//! Listeners never drop a message silently. When a dead-letter sink is
//! configured and a poison message keeps failing, the listener records it here
//! first and only then acknowledges it.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Error returned by a [`DeadLetterSink`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Dead letter write failed: {0}")]
pub struct DeadLetterError(pub String);

/// A message parked for operator attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    /// Subject the message arrived on
    pub subject: String,
    /// Queue group that gave up on it
    pub queue_group: String,
    /// Broker sequence
    pub sequence: u64,
    /// Delivery attempts made
    pub attempts: u32,
    /// Raw message bytes, exactly as delivered
    pub data: Vec<u8>,
    /// Last failure
    pub error: String,
    /// When the listener gave up
    pub failed_at: DateTime<Utc>,
}

/// Persistent destination for dead letters.
pub trait DeadLetterSink: Send + Sync {
    /// Record a dead letter durably.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError`] if the letter could not be stored; the
    /// listener then leaves the message unacknowledged.
    fn record(
        &self,
        letter: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>>;
}
