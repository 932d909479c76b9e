//! Wire envelope carried by every bus message.
//!
//! The envelope wraps the JSON payload with the subject and a correlation id.
//! The envelope itself is bincode-encoded; the payload inside stays JSON so it
//! can be checked against the subject's schema on the way in and out.

use crate::contract::ContractError;
use crate::events::EventPayload;
use crate::subject::Subject;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while encoding or decoding an envelope.
#[derive(Error, Debug)]
pub enum EnvelopeError {
    /// Envelope bytes could not be produced.
    #[error("Failed to encode envelope: {0}")]
    Encode(String),

    /// Envelope bytes could not be parsed.
    #[error("Failed to decode envelope: {0}")]
    Decode(String),

    /// Payload violates the subject contract.
    #[error(transparent)]
    Contract(#[from] ContractError),
}

/// Identifier attached to a single publish call.
///
/// Returned to the publisher and carried to every consumer so a publish
/// can be traced across services. Retried publishes get a fresh id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a new random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the id as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Serialized event ready for the bus.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Subject the event is published under
    pub subject: Subject,
    /// Correlation id of the publish call
    pub correlation_id: CorrelationId,
    /// Publisher wall-clock time
    pub published_at: DateTime<Utc>,
    /// Identifier of the aggregate the event describes (partition key)
    pub aggregate_id: String,
    /// JSON payload bytes
    pub data: Vec<u8>,
}

impl Envelope {
    /// Wrap a typed payload.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Contract`] if the payload does not satisfy its schema.
    pub fn from_payload<E: EventPayload>(
        payload: &E,
        published_at: DateTime<Utc>,
    ) -> Result<Self, EnvelopeError> {
        Ok(Self {
            subject: E::SUBJECT,
            correlation_id: CorrelationId::new(),
            published_at,
            aggregate_id: payload.aggregate_id().to_string(),
            data: payload.to_json_bytes()?,
        })
    }

    /// Encode for the wire.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Encode`] if bincode fails.
    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        bincode::serialize(self).map_err(|e| EnvelopeError::Encode(e.to_string()))
    }

    /// Decode from wire bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Decode`] if the bytes are not an envelope.
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        bincode::deserialize(bytes).map_err(|e| EnvelopeError::Decode(e.to_string()))
    }

    /// Decode the payload as `E`.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Contract`] if the envelope was published under
    /// another subject or the payload violates the schema.
    pub fn payload<E: EventPayload>(&self) -> Result<E, EnvelopeError> {
        if self.subject != E::SUBJECT {
            return Err(ContractError::Malformed {
                subject: E::SUBJECT,
                reason: format!("envelope carries subject {}", self.subject),
            }
            .into());
        }
        Ok(E::from_json_bytes(&self.data)?)
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Envelope {{ subject: {}, correlation_id: {}, size: {} bytes }}",
            self.subject,
            self.correlation_id,
            self.data.len()
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::events::{ExpirationComplete, PaymentCreated};

    fn expiration() -> ExpirationComplete {
        ExpirationComplete {
            order_id: "o-1".to_string(),
        }
    }

    #[test]
    fn envelope_survives_the_wire() {
        let envelope = Envelope::from_payload(&expiration(), Utc::now()).unwrap();
        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();

        assert_eq!(decoded, envelope);
        assert_eq!(decoded.payload::<ExpirationComplete>().unwrap(), expiration());
    }

    #[test]
    fn each_envelope_gets_a_fresh_correlation_id() {
        let a = Envelope::from_payload(&expiration(), Utc::now()).unwrap();
        let b = Envelope::from_payload(&expiration(), Utc::now()).unwrap();
        assert_ne!(a.correlation_id, b.correlation_id);
    }

    #[test]
    fn payload_of_another_subject_is_rejected() {
        let envelope = Envelope::from_payload(&expiration(), Utc::now()).unwrap();
        assert!(matches!(
            envelope.payload::<PaymentCreated>(),
            Err(EnvelopeError::Contract(_))
        ));
    }

    #[test]
    fn truncated_bytes_fail_to_decode() {
        let bytes = Envelope::from_payload(&expiration(), Utc::now())
            .unwrap()
            .encode()
            .unwrap();
        assert!(matches!(
            Envelope::decode(&bytes[..bytes.len() / 2]),
            Err(EnvelopeError::Decode(_))
        ));
    }
}
