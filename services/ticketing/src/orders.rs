//! Orders service: owns [`Order`], keeps a [`TicketReplica`] per ticket and
//! claims tickets through [`Reservation`] records.
//!
//! ```text
//!   ticket:created      ──► replica created            (apply_create)
//!   ticket:updated      ──► replica title/price        (next version only)
//!   create_order        ──► claim ticket ──► order:created
//!   cancel_order        ──► release claim ──► order:cancelled
//!   expiration:complete ──► cancel unless paid ──► order:cancelled
//!   payment:created     ──► order complete
//! ```

use crate::aggregates::{Order, Reservation, TicketReplica};
use crate::error::{DomainError, ServiceError, publish_failed};
use chrono::Duration;
use std::sync::Arc;
use ticketbus_core::aggregate::{AggregateStore, StoreError};
use ticketbus_core::clock::Clock;
use ticketbus_core::events::{
    ExpirationComplete, OrderStatus, OrderTicket, PaymentCreated, TicketCreated, TicketUpdated,
};
use ticketbus_runtime::{
    ConcurrencyGuard, EventHandler, GuardError, HandlerError, HandlerFuture, MessageContext,
    OutOfOrderPolicy, PublishError, Publisher, RetryPolicy, UpdateError, VersionedWriter,
    retry_with_predicate,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Stores used by the orders service.
#[derive(Clone)]
pub struct OrderStores {
    /// Orders
    pub orders: Arc<dyn AggregateStore<Order>>,
    /// Ticket copies
    pub tickets: Arc<dyn AggregateStore<TicketReplica>>,
    /// Ticket claims
    pub reservations: Arc<dyn AggregateStore<Reservation>>,
}

/// Command side of the orders service.
#[derive(Clone)]
pub struct OrderService {
    orders: VersionedWriter<Order>,
    tickets: VersionedWriter<TicketReplica>,
    reservations: VersionedWriter<Reservation>,
    publisher: Publisher,
    clock: Arc<dyn Clock>,
    expiration_window: Duration,
    retry: RetryPolicy,
}

impl std::fmt::Debug for OrderService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderService")
            .field("publisher", &self.publisher)
            .field("expiration_window", &self.expiration_window)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl OrderService {
    /// Orders expire `expiration_window` after creation, as read from `clock`.
    #[must_use]
    pub fn new(
        stores: &OrderStores,
        publisher: Publisher,
        clock: Arc<dyn Clock>,
        expiration_window: Duration,
    ) -> Self {
        Self {
            orders: VersionedWriter::new(Arc::clone(&stores.orders)),
            tickets: VersionedWriter::new(Arc::clone(&stores.tickets)),
            reservations: VersionedWriter::new(Arc::clone(&stores.reservations)),
            publisher,
            clock,
            expiration_window,
            retry: RetryPolicy::default(),
        }
    }

    /// Backoff for announcing the cancellation of an order whose
    /// `order:created` timed out.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Look up an order.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Store`] if the store fails.
    pub async fn order(&self, id: &str) -> Result<Option<Order>, ServiceError> {
        Ok(self.orders.load(id).await?)
    }

    /// Order `ticket_id` for `user_id` and announce it.
    ///
    /// If the announcement fails the order is cancelled and the ticket freed
    /// again before the error is returned. When the publish timed out the
    /// `order:created` may still have reached the bus, so the cancellation is
    /// announced as well.
    ///
    /// # Errors
    ///
    /// - [`DomainError::NotFound`] if the ticket is unknown here
    /// - [`DomainError::Reserved`] if another order holds the ticket
    /// - [`ServiceError::Store`] if a write fails
    /// - [`ServiceError::Publish`] if `order:created` was not acknowledged
    pub async fn create_order(
        &self,
        ticket_id: &str,
        user_id: &str,
    ) -> Result<Order, ServiceError> {
        let ticket = self
            .tickets
            .load(ticket_id)
            .await?
            .ok_or_else(|| DomainError::NotFound {
                kind: "ticket",
                id: ticket_id.to_string(),
            })?;

        let order_id = Uuid::new_v4().to_string();
        self.claim(ticket_id, &order_id).await?;

        let order = Order::new(
            &order_id,
            user_id,
            OrderTicket {
                id: ticket.id.clone(),
                price: ticket.price,
            },
            self.clock.now() + self.expiration_window,
        );
        let order = match self.orders.create(order).await {
            Ok(order) => order,
            Err(e) => {
                self.release(ticket_id, &order_id).await;
                return Err(e.into());
            }
        };

        if let Err(e) = self.publisher.publish(&order.created_event()).await {
            warn!(
                aggregate_id = %order.id,
                error = %e,
                "order:created not acknowledged, cancelling order"
            );
            self.abandon(&order, &e).await;
            return Err(e.into());
        }

        info!(
            aggregate_id = %order.id,
            ticket_id = %ticket.id,
            expires_at = %order.expires_at,
            "Order created"
        );
        Ok(order)
    }

    /// Cancel an order on behalf of its buyer and free the ticket.
    ///
    /// Cancelling an already cancelled order announces it again.
    ///
    /// # Errors
    ///
    /// - [`DomainError::NotFound`] if there is no such order
    /// - [`DomainError::NotOwner`] if `user_id` is not the buyer
    /// - [`DomainError::Invalid`] if the order is paid
    /// - [`ServiceError::Store`] if a write fails
    /// - [`ServiceError::Publish`] if `order:cancelled` was not acknowledged
    pub async fn cancel_order(&self, order_id: &str, user_id: &str) -> Result<Order, ServiceError> {
        let cancelled = self
            .orders
            .modify(order_id, |order| {
                if order.user_id != user_id {
                    return Err(DomainError::NotOwner);
                }
                order.cancel()
            })
            .await?;
        let order = match cancelled {
            Some(order) => order,
            None => self.existing(order_id).await?,
        };

        self.release(&order.ticket.id, &order.id).await;
        self.publisher.publish(&order.cancelled_event()).await?;

        info!(aggregate_id = %order.id, version = order.version, "Order cancelled");
        Ok(order)
    }

    async fn existing(&self, order_id: &str) -> Result<Order, ServiceError> {
        self.orders.load(order_id).await?.ok_or_else(|| {
            DomainError::NotFound {
                kind: "order",
                id: order_id.to_string(),
            }
            .into()
        })
    }

    async fn claim(&self, ticket_id: &str, order_id: &str) -> Result<(), ServiceError> {
        let result = match self.reservations.load(ticket_id).await? {
            None => self
                .reservations
                .create(Reservation::claimed(ticket_id, order_id))
                .await
                .map(drop)
                .map_err(UpdateError::from),
            Some(current) => self
                .reservations
                .update(ticket_id, current.version, |claim| claim.claim(order_id))
                .await
                .map(drop),
        };

        // Losing a race for the claim means another order got the ticket.
        result.map_err(|e| match e {
            UpdateError::Guard(
                GuardError::Conflict { .. } | GuardError::Store(StoreError::AlreadyExists(_)),
            ) => DomainError::Reserved(ticket_id.to_string()).into(),
            other => other.into(),
        })
    }

    /// Best effort: a claim left behind keeps the ticket unorderable here.
    async fn release(&self, ticket_id: &str, order_id: &str) {
        let released = self
            .reservations
            .modify(ticket_id, |claim| Ok::<_, DomainError>(claim.release(order_id)))
            .await;
        if let Err(e) = released {
            warn!(ticket_id, order_id, error = %e, "Failed to release ticket claim");
        }
    }

    async fn abandon(&self, order: &Order, cause: &PublishError) {
        let cancelled = match self.orders.modify(&order.id, Order::cancel).await {
            Ok(cancelled) => cancelled,
            Err(e) => {
                warn!(aggregate_id = %order.id, error = %e, "Failed to cancel unannounced order");
                None
            }
        };
        self.release(&order.ticket.id, &order.id).await;

        // A rejected publish never reached the bus; only a timeout leaves doubt.
        if !matches!(cause, PublishError::Timeout { .. }) {
            return;
        }
        let Some(cancelled) = cancelled else {
            return;
        };
        let event = cancelled.cancelled_event();
        match retry_with_predicate(
            &self.retry,
            || self.publisher.publish(&event),
            PublishError::is_retryable,
        )
        .await
        {
            Ok(_) => info!(
                aggregate_id = %cancelled.id,
                version = cancelled.version,
                "Cancellation of unacknowledged order announced"
            ),
            Err(e) => {
                metrics::counter!("ticketbus.orders.abandon_unannounced").increment(1);
                error!(
                    aggregate_id = %cancelled.id,
                    error = %e,
                    "Failed to announce cancellation of unacknowledged order"
                );
            }
        }
    }
}

/// `ticket:created`: store the replica.
#[derive(Clone, Debug)]
pub struct TicketCreatedHandler {
    guard: ConcurrencyGuard<TicketReplica>,
}

impl TicketCreatedHandler {
    /// Handler over the replica store.
    #[must_use]
    pub fn new(store: Arc<dyn AggregateStore<TicketReplica>>) -> Self {
        Self {
            guard: ConcurrencyGuard::new(store),
        }
    }
}

impl EventHandler for TicketCreatedHandler {
    type Event = TicketCreated;

    fn handle<'a>(
        &'a self,
        event: TicketCreated,
        _context: &'a MessageContext,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let outcome = self.guard.apply_create(TicketReplica::from(&event)).await?;
            debug!(aggregate_id = %event.id, ?outcome, "ticket:created handled");
            Ok(())
        })
    }
}

/// `ticket:updated`: copy title and price, in version order.
#[derive(Clone, Debug)]
pub struct TicketUpdatedHandler {
    guard: ConcurrencyGuard<TicketReplica>,
    policy: OutOfOrderPolicy,
}

impl TicketUpdatedHandler {
    /// Handler over the replica store.
    #[must_use]
    pub fn new(store: Arc<dyn AggregateStore<TicketReplica>>, policy: OutOfOrderPolicy) -> Self {
        Self {
            guard: ConcurrencyGuard::new(store),
            policy,
        }
    }
}

impl EventHandler for TicketUpdatedHandler {
    type Event = TicketUpdated;

    fn handle<'a>(
        &'a self,
        event: TicketUpdated,
        _context: &'a MessageContext,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let outcome = self
                .guard
                .apply_if_next_version(&event.id, event.version, |replica| {
                    replica.apply_update(&event);
                })
                .await?;
            outcome.into_handler_result(self.policy)
        })
    }
}

/// `expiration:complete`: cancel the order unless it was paid.
#[derive(Clone, Debug)]
pub struct ExpirationCompleteHandler {
    service: OrderService,
}

impl ExpirationCompleteHandler {
    /// Handler cancelling through `service`.
    #[must_use]
    pub const fn new(service: OrderService) -> Self {
        Self { service }
    }
}

impl EventHandler for ExpirationCompleteHandler {
    type Event = ExpirationComplete;

    fn handle<'a>(
        &'a self,
        event: ExpirationComplete,
        _context: &'a MessageContext,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let service = &self.service;
            let cancelled = service
                .orders
                .modify(&event.order_id, |order| match order.status {
                    OrderStatus::Complete => Ok(false),
                    _ => order.cancel(),
                })
                .await
                .map_err(|e| match e {
                    UpdateError::Guard(GuardError::NotFound { .. }) => HandlerError::Permanent(
                        format!("order '{}' does not exist", event.order_id),
                    ),
                    other => other.into(),
                })?;

            let order = match cancelled {
                Some(order) => order,
                None => service
                    .existing(&event.order_id)
                    .await
                    .map_err(|e| HandlerError::Transient(e.to_string()))?,
            };
            if order.status == OrderStatus::Complete {
                debug!(aggregate_id = %order.id, "Order already paid, expiration ignored");
                return Ok(());
            }

            service.release(&order.ticket.id, &order.id).await;
            service
                .publisher
                .publish(&order.cancelled_event())
                .await
                .map_err(|e| publish_failed(&e))?;
            info!(aggregate_id = %order.id, version = order.version, "Order expired");
            Ok(())
        })
    }
}

/// `payment:created`: mark the order paid.
#[derive(Clone, Debug)]
pub struct PaymentCreatedHandler {
    orders: VersionedWriter<Order>,
}

impl PaymentCreatedHandler {
    /// Handler over the orders store.
    #[must_use]
    pub fn new(store: Arc<dyn AggregateStore<Order>>) -> Self {
        Self {
            orders: VersionedWriter::new(store),
        }
    }
}

impl EventHandler for PaymentCreatedHandler {
    type Event = PaymentCreated;

    fn handle<'a>(
        &'a self,
        event: PaymentCreated,
        _context: &'a MessageContext,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            if let Some(order) = self.orders.modify(&event.order_id, Order::complete).await? {
                info!(aggregate_id = %order.id, payment_id = %event.id, "Order paid");
            }
            Ok(())
        })
    }
}
