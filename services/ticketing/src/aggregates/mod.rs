//! Aggregates owned or replicated by the services.
//!
//! | Aggregate          | Owner    | Kind                 |
//! |--------------------|----------|----------------------|
//! | [`Ticket`]         | tickets  | `ticket`             |
//! | [`TicketReplica`]  | orders   | `ticket-replica`     |
//! | [`Reservation`]    | orders   | `ticket-reservation` |
//! | [`Order`]          | orders   | `order`              |
//! | [`OrderReplica`]   | payments | `order-replica`      |
//! | [`Payment`]        | payments | `payment`            |
//!
//! Owners write through `VersionedWriter`; replicas only change through
//! `ConcurrencyGuard`, so their versions always mirror the owner's.

/// Implements [`Versioned`](ticketbus_core::Versioned) for a struct with
/// `id: String` and `version: u64` fields.
macro_rules! versioned {
    ($ty:ty, $kind:literal) => {
        impl ticketbus_core::Versioned for $ty {
            const KIND: &'static str = $kind;

            fn id(&self) -> &str {
                &self.id
            }

            fn version(&self) -> u64 {
                self.version
            }

            fn set_version(&mut self, version: u64) {
                self.version = version;
            }
        }
    };
}

pub(crate) use versioned;

mod order;
mod payment;
mod ticket;

pub use order::{Order, OrderReplica, Reservation};
pub use payment::Payment;
pub use ticket::{Ticket, TicketReplica};
