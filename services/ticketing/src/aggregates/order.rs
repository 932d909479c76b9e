//! Order aggregate, the ticket reservation claim and the payments copy.

use super::versioned;
use crate::error::DomainError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ticketbus_core::events::{OrderCancelled, OrderCreated, OrderTicket, TicketRef};
use ticketbus_core::OrderStatus;

/// An order for one ticket, owned by the orders service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Order id
    pub id: String,
    /// Version, bumped on every write
    pub version: u64,
    /// Lifecycle status
    pub status: OrderStatus,
    /// Buyer
    pub user_id: String,
    /// When an unpaid order is cancelled
    pub expires_at: DateTime<Utc>,
    /// Ticket and the price it was ordered at
    pub ticket: OrderTicket,
}

versioned!(Order, "order");

impl Order {
    /// A new order at version 0.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        user_id: impl Into<String>,
        ticket: OrderTicket,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            version: 0,
            status: OrderStatus::Created,
            user_id: user_id.into(),
            expires_at,
            ticket,
        }
    }

    /// Cancel the order. Returns `false` if it already was.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::Invalid`] for a paid order.
    pub fn cancel(&mut self) -> Result<bool, DomainError> {
        match self.status {
            OrderStatus::Cancelled => Ok(false),
            OrderStatus::Complete => Err(DomainError::Invalid(format!(
                "order '{}' is already paid",
                self.id
            ))),
            OrderStatus::Created | OrderStatus::AwaitingPayment => {
                self.status = OrderStatus::Cancelled;
                Ok(true)
            }
        }
    }

    /// Mark the order paid. Returns `false` if it already was.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::Cancelled`] for a cancelled order.
    pub fn complete(&mut self) -> Result<bool, DomainError> {
        match self.status {
            OrderStatus::Complete => Ok(false),
            OrderStatus::Cancelled => Err(DomainError::Cancelled(self.id.clone())),
            OrderStatus::Created | OrderStatus::AwaitingPayment => {
                self.status = OrderStatus::Complete;
                Ok(true)
            }
        }
    }

    /// `order:created` payload.
    #[must_use]
    pub fn created_event(&self) -> OrderCreated {
        OrderCreated {
            id: self.id.clone(),
            version: self.version,
            status: self.status,
            user_id: self.user_id.clone(),
            expires_at: self.expires_at,
            ticket: self.ticket.clone(),
        }
    }

    /// `order:cancelled` payload.
    #[must_use]
    pub fn cancelled_event(&self) -> OrderCancelled {
        OrderCancelled {
            id: self.id.clone(),
            version: self.version,
            ticket: TicketRef {
                id: self.ticket.id.clone(),
            },
        }
    }
}

/// Which order, if any, holds a ticket on the orders side.
///
/// Keyed by ticket id. Claiming goes through compare-and-swap, so two orders
/// racing for one ticket cannot both succeed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Ticket id
    pub id: String,
    /// Version, bumped on every claim and release
    pub version: u64,
    /// Holding order
    pub order_id: Option<String>,
}

versioned!(Reservation, "ticket-reservation");

impl Reservation {
    /// A claim for `order_id` on `ticket_id` at version 0.
    #[must_use]
    pub fn claimed(ticket_id: impl Into<String>, order_id: impl Into<String>) -> Self {
        Self {
            id: ticket_id.into(),
            version: 0,
            order_id: Some(order_id.into()),
        }
    }

    /// Claim for `order_id`.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::Reserved`] if another order holds the ticket.
    pub fn claim(&mut self, order_id: &str) -> Result<(), DomainError> {
        match self.order_id.as_deref() {
            Some(current) if current != order_id => Err(DomainError::Reserved(self.id.clone())),
            _ => {
                self.order_id = Some(order_id.to_string());
                Ok(())
            }
        }
    }

    /// Drop the claim of `order_id`. Returns `false` if it held nothing.
    pub fn release(&mut self, order_id: &str) -> bool {
        if self.order_id.as_deref() == Some(order_id) {
            self.order_id = None;
            true
        } else {
            false
        }
    }
}

/// The payments service's copy of an order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderReplica {
    /// Order id
    pub id: String,
    /// Mirrors the owner's version
    pub version: u64,
    /// Lifecycle status
    pub status: OrderStatus,
    /// Buyer
    pub user_id: String,
    /// Amount to charge in minor currency units
    pub price: u64,
}

versioned!(OrderReplica, "order-replica");

impl From<&OrderCreated> for OrderReplica {
    fn from(event: &OrderCreated) -> Self {
        Self {
            id: event.id.clone(),
            version: event.version,
            status: event.status,
            user_id: event.user_id.clone(),
            price: event.ticket.price,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Tests can unwrap
mod tests {
    use super::*;

    fn order() -> Order {
        Order::new(
            "o-1",
            "buyer",
            OrderTicket {
                id: "t-1".to_string(),
                price: 20,
            },
            Utc::now(),
        )
    }

    #[test]
    fn cancel_is_idempotent() {
        let mut order = order();
        assert_eq!(order.cancel(), Ok(true));
        assert_eq!(order.cancel(), Ok(false));
        assert_eq!(order.status, OrderStatus::Cancelled);
    }

    #[test]
    fn paid_order_cannot_be_cancelled() {
        let mut order = order();
        order.complete().unwrap();
        assert!(matches!(order.cancel(), Err(DomainError::Invalid(_))));
        assert_eq!(order.status, OrderStatus::Complete);
    }

    #[test]
    fn cancelled_order_cannot_be_paid() {
        let mut order = order();
        order.cancel().unwrap();
        assert_eq!(order.complete(), Err(DomainError::Cancelled("o-1".to_string())));
    }

    #[test]
    fn cancelled_event_names_the_ticket() {
        let mut order = order();
        order.version = 1;
        let event = order.cancelled_event();
        assert_eq!((event.version, event.ticket.id.as_str()), (1, "t-1"));
    }

    #[test]
    fn claim_conflicts_only_with_other_orders() {
        let mut reservation = Reservation::claimed("t-1", "o-1");
        assert_eq!(reservation.claim("o-1"), Ok(()));
        assert_eq!(reservation.claim("o-2"), Err(DomainError::Reserved("t-1".to_string())));
        assert!(reservation.release("o-1"));
        assert_eq!(reservation.claim("o-2"), Ok(()));
        assert!(!reservation.release("o-1"));
    }

    #[test]
    fn replica_takes_the_ticket_price() {
        let mut created = order().created_event();
        created.ticket.price = 45;
        let replica = OrderReplica::from(&created);
        assert_eq!((replica.price, replica.version), (45, 0));
    }
}
