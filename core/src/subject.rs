//! Closed enumeration of event bus subjects.
//!
//! Every event that crosses a service boundary is published under exactly one
//! [`Subject`]. The set is closed: adding a subject means adding a variant here,
//! and the compiler then points at every exhaustive match (schema lookup,
//! payload decoding) that must learn about it.

use crate::contract::ContractError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A named channel on the event bus identifying an event kind.
///
/// # Examples
///
/// ```
/// use ticketbus_core::subject::Subject;
///
/// let subject: Subject = "ticket:created".parse().unwrap();
/// assert_eq!(subject, Subject::TicketCreated);
/// assert_eq!(subject.as_str(), "ticket:created");
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Subject {
    /// A ticket was listed for sale.
    #[serde(rename = "ticket:created")]
    TicketCreated,
    /// A ticket's title, price or reservation changed.
    #[serde(rename = "ticket:updated")]
    TicketUpdated,
    /// An order reserved a ticket.
    #[serde(rename = "order:created")]
    OrderCreated,
    /// An order was cancelled and its ticket released.
    #[serde(rename = "order:cancelled")]
    OrderCancelled,
    /// An order's reservation window elapsed.
    #[serde(rename = "expiration:complete")]
    ExpirationComplete,
    /// A charge for an order succeeded.
    #[serde(rename = "payment:created")]
    PaymentCreated,
}

impl Subject {
    /// Every subject, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::TicketCreated,
        Self::TicketUpdated,
        Self::OrderCreated,
        Self::OrderCancelled,
        Self::ExpirationComplete,
        Self::PaymentCreated,
    ];

    /// Wire name of the subject (also used as the topic name).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TicketCreated => "ticket:created",
            Self::TicketUpdated => "ticket:updated",
            Self::OrderCreated => "order:created",
            Self::OrderCancelled => "order:cancelled",
            Self::ExpirationComplete => "expiration:complete",
            Self::PaymentCreated => "payment:created",
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Subject {
    type Err = ContractError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|subject| subject.as_str() == s)
            .ok_or_else(|| ContractError::UnknownSubject(s.to_string()))
    }
}
