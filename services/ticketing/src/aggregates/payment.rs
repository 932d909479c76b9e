use super::versioned;
use serde::{Deserialize, Serialize};
use ticketbus_core::events::PaymentCreated;

/// A settled charge for an order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    /// Payment id
    pub id: String,
    /// Version
    pub version: u64,
    /// Paid order
    pub order_id: String,
    /// Charge id returned by the payment provider
    pub stripe_id: String,
}

versioned!(Payment, "payment");

impl Payment {
    /// `payment:created` payload.
    #[must_use]
    pub fn created_event(&self) -> PaymentCreated {
        PaymentCreated {
            id: self.id.clone(),
            order_id: self.order_id.clone(),
            stripe_id: self.stripe_id.clone(),
        }
    }
}
