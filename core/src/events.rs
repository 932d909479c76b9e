//! Typed event payloads.
//!
//! Each subject has exactly one payload type implementing [`EventPayload`], and
//! [`DomainEvent`] is the closed union over all of them. Payloads are JSON on
//! the wire (camelCase field names) and are always checked against their
//! [`Schema`](crate::contract::Schema) in both directions.
//!
//! # Example
//!
//! ```
//! use ticketbus_core::events::{EventPayload, TicketCreated};
//! use ticketbus_core::subject::Subject;
//!
//! let event = TicketCreated {
//!     id: "t-1".to_string(),
//!     version: 0,
//!     title: "concert".to_string(),
//!     price: 2000,
//!     user_id: "u-1".to_string(),
//! };
//!
//! assert_eq!(TicketCreated::SUBJECT, Subject::TicketCreated);
//! let bytes = event.to_json_bytes().unwrap();
//! assert_eq!(TicketCreated::from_json_bytes(&bytes).unwrap(), event);
//! ```

use crate::contract::{ContractError, schema_for};
use crate::subject::Subject;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A payload that belongs to exactly one subject.
pub trait EventPayload:
    Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static
{
    /// Subject this payload is published under.
    const SUBJECT: Subject;

    /// Identifier of the aggregate the event describes (used as partition key).
    fn aggregate_id(&self) -> &str;

    /// Aggregate version carried by the event, if the event is a versioned mutation.
    fn version(&self) -> Option<u64> {
        None
    }

    /// Serialize to a JSON value checked against the subject's schema.
    ///
    /// # Errors
    ///
    /// Returns [`ContractError`] if serialization fails or the produced JSON
    /// does not satisfy the schema.
    fn to_json(&self) -> Result<Value, ContractError> {
        let value = serde_json::to_value(self).map_err(|e| ContractError::Malformed {
            subject: Self::SUBJECT,
            reason: e.to_string(),
        })?;
        schema_for(Self::SUBJECT).validate(&value)?;
        Ok(value)
    }

    /// Serialize to schema-checked JSON bytes.
    ///
    /// # Errors
    ///
    /// See [`EventPayload::to_json`].
    fn to_json_bytes(&self) -> Result<Vec<u8>, ContractError> {
        let value = self.to_json()?;
        serde_json::to_vec(&value).map_err(|e| ContractError::Malformed {
            subject: Self::SUBJECT,
            reason: e.to_string(),
        })
    }

    /// Decode from JSON bytes, checking the schema before the typed decode.
    ///
    /// # Errors
    ///
    /// Returns [`ContractError`] if the bytes are not JSON, violate the schema,
    /// or cannot be decoded into `Self`.
    fn from_json_bytes(bytes: &[u8]) -> Result<Self, ContractError> {
        let malformed = |e: serde_json::Error| ContractError::Malformed {
            subject: Self::SUBJECT,
            reason: e.to_string(),
        };
        let value: Value = serde_json::from_slice(bytes).map_err(malformed)?;
        schema_for(Self::SUBJECT).validate(&value)?;
        serde_json::from_value(value).map_err(malformed)
    }
}

/// Lifecycle of an order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Order placed, ticket reserved, awaiting payment.
    #[serde(rename = "created")]
    Created,
    /// Order cancelled by the user or by expiration; the ticket is released.
    #[serde(rename = "cancelled")]
    Cancelled,
    /// Payment initiated but not settled.
    #[serde(rename = "awaiting:payment")]
    AwaitingPayment,
    /// Paid.
    #[serde(rename = "complete")]
    Complete,
}

/// `ticket:created`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketCreated {
    /// Ticket id
    pub id: String,
    /// Ticket version at creation (always 0)
    pub version: u64,
    /// Title
    pub title: String,
    /// Price in minor currency units
    pub price: u64,
    /// Owner
    pub user_id: String,
}

/// `ticket:updated`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketUpdated {
    /// Ticket id
    pub id: String,
    /// Ticket version after the update
    pub version: u64,
    /// Title
    pub title: String,
    /// Price in minor currency units
    pub price: u64,
    /// Owner
    pub user_id: String,
    /// Order currently reserving the ticket
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
}

/// Ticket summary embedded in `order:created`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderTicket {
    /// Ticket id
    pub id: String,
    /// Price at reservation time
    pub price: u64,
}

/// `order:created`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreated {
    /// Order id
    pub id: String,
    /// Order version (always 0 at creation)
    pub version: u64,
    /// Status at creation
    pub status: OrderStatus,
    /// Buyer
    pub user_id: String,
    /// End of the reservation window
    pub expires_at: DateTime<Utc>,
    /// Reserved ticket
    pub ticket: OrderTicket,
}

/// Ticket reference embedded in `order:cancelled`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketRef {
    /// Ticket id
    pub id: String,
}

/// `order:cancelled`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCancelled {
    /// Order id
    pub id: String,
    /// Order version after cancellation
    pub version: u64,
    /// Released ticket
    pub ticket: TicketRef,
}

/// `expiration:complete`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpirationComplete {
    /// Order whose reservation window elapsed
    pub order_id: String,
}

/// `payment:created`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentCreated {
    /// Payment id
    pub id: String,
    /// Paid order
    pub order_id: String,
    /// Charge id at the payment provider
    pub stripe_id: String,
}

impl EventPayload for TicketCreated {
    const SUBJECT: Subject = Subject::TicketCreated;

    fn aggregate_id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> Option<u64> {
        Some(self.version)
    }
}

impl EventPayload for TicketUpdated {
    const SUBJECT: Subject = Subject::TicketUpdated;

    fn aggregate_id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> Option<u64> {
        Some(self.version)
    }
}

impl EventPayload for OrderCreated {
    const SUBJECT: Subject = Subject::OrderCreated;

    fn aggregate_id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> Option<u64> {
        Some(self.version)
    }
}

impl EventPayload for OrderCancelled {
    const SUBJECT: Subject = Subject::OrderCancelled;

    fn aggregate_id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> Option<u64> {
        Some(self.version)
    }
}

impl EventPayload for ExpirationComplete {
    const SUBJECT: Subject = Subject::ExpirationComplete;

    fn aggregate_id(&self) -> &str {
        &self.order_id
    }
}

impl EventPayload for PaymentCreated {
    const SUBJECT: Subject = Subject::PaymentCreated;

    fn aggregate_id(&self) -> &str {
        &self.order_id
    }
}

/// Closed union of every event kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DomainEvent {
    /// `ticket:created`
    TicketCreated(TicketCreated),
    /// `ticket:updated`
    TicketUpdated(TicketUpdated),
    /// `order:created`
    OrderCreated(OrderCreated),
    /// `order:cancelled`
    OrderCancelled(OrderCancelled),
    /// `expiration:complete`
    ExpirationComplete(ExpirationComplete),
    /// `payment:created`
    PaymentCreated(PaymentCreated),
}

impl DomainEvent {
    /// Subject of the wrapped payload.
    #[must_use]
    pub const fn subject(&self) -> Subject {
        match self {
            Self::TicketCreated(_) => Subject::TicketCreated,
            Self::TicketUpdated(_) => Subject::TicketUpdated,
            Self::OrderCreated(_) => Subject::OrderCreated,
            Self::OrderCancelled(_) => Subject::OrderCancelled,
            Self::ExpirationComplete(_) => Subject::ExpirationComplete,
            Self::PaymentCreated(_) => Subject::PaymentCreated,
        }
    }

    /// Aggregate version carried by the payload, if any.
    #[must_use]
    pub fn version(&self) -> Option<u64> {
        match self {
            Self::TicketCreated(e) => e.version(),
            Self::TicketUpdated(e) => e.version(),
            Self::OrderCreated(e) => e.version(),
            Self::OrderCancelled(e) => e.version(),
            Self::ExpirationComplete(e) => e.version(),
            Self::PaymentCreated(e) => e.version(),
        }
    }

    /// Aggregate the payload describes.
    #[must_use]
    pub fn aggregate_id(&self) -> &str {
        match self {
            Self::TicketCreated(e) => e.aggregate_id(),
            Self::TicketUpdated(e) => e.aggregate_id(),
            Self::OrderCreated(e) => e.aggregate_id(),
            Self::OrderCancelled(e) => e.aggregate_id(),
            Self::ExpirationComplete(e) => e.aggregate_id(),
            Self::PaymentCreated(e) => e.aggregate_id(),
        }
    }

    /// Decode a payload published under `subject`.
    ///
    /// # Errors
    ///
    /// Returns [`ContractError`] if the bytes violate the subject's schema.
    pub fn decode(subject: Subject, bytes: &[u8]) -> Result<Self, ContractError> {
        Ok(match subject {
            Subject::TicketCreated => Self::TicketCreated(TicketCreated::from_json_bytes(bytes)?),
            Subject::TicketUpdated => Self::TicketUpdated(TicketUpdated::from_json_bytes(bytes)?),
            Subject::OrderCreated => Self::OrderCreated(OrderCreated::from_json_bytes(bytes)?),
            Subject::OrderCancelled => {
                Self::OrderCancelled(OrderCancelled::from_json_bytes(bytes)?)
            }
            Subject::ExpirationComplete => {
                Self::ExpirationComplete(ExpirationComplete::from_json_bytes(bytes)?)
            }
            Subject::PaymentCreated => {
                Self::PaymentCreated(PaymentCreated::from_json_bytes(bytes)?)
            }
        })
    }
}

macro_rules! impl_from_payload {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for DomainEvent {
                fn from(event: $variant) -> Self {
                    Self::$variant(event)
                }
            }
        )*
    };
}

impl_from_payload!(
    TicketCreated,
    TicketUpdated,
    OrderCreated,
    OrderCancelled,
    ExpirationComplete,
    PaymentCreated,
);
