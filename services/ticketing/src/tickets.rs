//! Tickets service: owns [`Ticket`] and follows the order lifecycle.
//!
//! ```text
//!   create_ticket ──► ticket:created
//!   update_ticket ──► ticket:updated   (refused while reserved)
//!
//!   order:created   ──► reserve  ──► ticket:updated (orderId set)
//!   order:cancelled ──► release  ──► ticket:updated (orderId cleared)
//! ```
//!
//! The listeners publish the ticket's current state even when the change was
//! already applied, so a redelivery after a failed publish still emits the
//! update. Consumers drop the repeat by version.

use crate::aggregates::Ticket;
use crate::error::{DomainError, ServiceError, publish_failed};
use std::sync::Arc;
use ticketbus_core::aggregate::AggregateStore;
use ticketbus_core::events::{OrderCancelled, OrderCreated};
use ticketbus_runtime::{
    EventHandler, GuardError, HandlerError, HandlerFuture, MessageContext, Publisher,
    UpdateError, VersionedWriter,
};
use tracing::{debug, info};
use uuid::Uuid;

/// Command side of the tickets service.
#[derive(Clone, Debug)]
pub struct TicketService {
    tickets: VersionedWriter<Ticket>,
    publisher: Publisher,
}

impl TicketService {
    /// Service writing to `store` and publishing through `publisher`.
    #[must_use]
    pub fn new(store: Arc<dyn AggregateStore<Ticket>>, publisher: Publisher) -> Self {
        Self {
            tickets: VersionedWriter::new(store),
            publisher,
        }
    }

    /// Look up a ticket.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Store`] if the store fails.
    pub async fn ticket(&self, id: &str) -> Result<Option<Ticket>, ServiceError> {
        Ok(self.tickets.load(id).await?)
    }

    /// List a new ticket for sale and announce it.
    ///
    /// # Errors
    ///
    /// - [`DomainError::Invalid`] for an empty title or a zero price
    /// - [`ServiceError::Store`] if the ticket cannot be saved
    /// - [`ServiceError::Publish`] if `ticket:created` was not acknowledged;
    ///   the ticket is saved regardless
    pub async fn create_ticket(
        &self,
        user_id: &str,
        title: &str,
        price: u64,
    ) -> Result<Ticket, ServiceError> {
        let ticket = Ticket::new(Uuid::new_v4().to_string(), user_id, title, price)?;
        let ticket = self.tickets.create(ticket).await?;
        self.publisher.publish(&ticket.created_event()).await?;

        info!(aggregate_id = %ticket.id, price, "Ticket created");
        Ok(ticket)
    }

    /// Change title and price of a ticket read at `expected_version`.
    ///
    /// # Errors
    ///
    /// - [`DomainError::NotFound`] if there is no such ticket
    /// - [`DomainError::NotOwner`] if `user_id` is not the seller
    /// - [`DomainError::Reserved`] while an order holds the ticket
    /// - [`DomainError::Invalid`] for an empty title or a zero price
    /// - [`ServiceError::Store`] with [`GuardError::Conflict`] if the ticket
    ///   changed since it was read
    /// - [`ServiceError::Publish`] if `ticket:updated` was not acknowledged
    pub async fn update_ticket(
        &self,
        id: &str,
        user_id: &str,
        expected_version: u64,
        title: &str,
        price: u64,
    ) -> Result<Ticket, ServiceError> {
        let ticket = self
            .tickets
            .update(id, expected_version, |ticket| ticket.edit(user_id, title, price))
            .await?;
        self.publisher.publish(&ticket.updated_event()).await?;

        info!(aggregate_id = %ticket.id, version = ticket.version, "Ticket updated");
        Ok(ticket)
    }
}

/// Shared body of the two listeners: apply, then announce the current state.
#[derive(Clone, Debug)]
struct Follower {
    tickets: VersionedWriter<Ticket>,
    publisher: Publisher,
}

impl Follower {
    async fn apply<F>(&self, ticket_id: &str, change: F) -> Result<(), HandlerError>
    where
        F: FnOnce(&mut Ticket) -> Result<bool, DomainError> + Send,
    {
        let modified = match self.tickets.modify(ticket_id, change).await {
            Ok(modified) => modified,
            // Another order holds the ticket; its order:cancelled frees it.
            Err(UpdateError::Rejected(DomainError::Reserved(id))) => {
                debug!(aggregate_id = %id, "Ticket held by another order, waiting for release");
                return Err(HandlerError::Transient(format!(
                    "ticket {id} held by another order"
                )));
            }
            Err(e) => return Err(e.into()),
        };
        let ticket = match modified {
            Some(ticket) => ticket,
            None => self
                .tickets
                .load(ticket_id)
                .await?
                .ok_or_else(|| GuardError::NotFound {
                    kind: "ticket",
                    id: ticket_id.to_string(),
                })?,
        };

        self.publisher
            .publish(&ticket.updated_event())
            .await
            .map_err(|e| publish_failed(&e))?;
        debug!(
            aggregate_id = %ticket.id,
            version = ticket.version,
            order_id = ?ticket.order_id,
            "Ticket state published"
        );
        Ok(())
    }
}

/// `order:created`: hold the ticket for the new order.
///
/// A ticket still held by an earlier order is a transient failure: the
/// message is redelivered until that order's `order:cancelled` frees it.
#[derive(Clone, Debug)]
pub struct OrderCreatedHandler(Follower);

impl OrderCreatedHandler {
    /// Handler over the tickets store.
    #[must_use]
    pub fn new(store: Arc<dyn AggregateStore<Ticket>>, publisher: Publisher) -> Self {
        Self(Follower {
            tickets: VersionedWriter::new(store),
            publisher,
        })
    }
}

impl EventHandler for OrderCreatedHandler {
    type Event = OrderCreated;

    fn handle<'a>(
        &'a self,
        event: OrderCreated,
        _context: &'a MessageContext,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            self.0
                .apply(&event.ticket.id, |ticket| ticket.reserve(&event.id))
                .await
        })
    }
}

/// `order:cancelled`: release the ticket if that order holds it.
#[derive(Clone, Debug)]
pub struct OrderCancelledHandler(Follower);

impl OrderCancelledHandler {
    /// Handler over the tickets store.
    #[must_use]
    pub fn new(store: Arc<dyn AggregateStore<Ticket>>, publisher: Publisher) -> Self {
        Self(Follower {
            tickets: VersionedWriter::new(store),
            publisher,
        })
    }
}

impl EventHandler for OrderCancelledHandler {
    type Event = OrderCancelled;

    fn handle<'a>(
        &'a self,
        event: OrderCancelled,
        _context: &'a MessageContext,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            self.0
                .apply(&event.ticket.id, |ticket| Ok(ticket.release(&event.id)))
                .await
        })
    }
}
