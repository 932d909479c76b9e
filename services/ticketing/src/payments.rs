//! Payments service: keeps an [`OrderReplica`] per order and charges for
//! open orders.

use crate::aggregates::{OrderReplica, Payment};
use crate::error::{DomainError, ServiceError};
use crate::payment_gateway::PaymentGateway;
use std::sync::Arc;
use ticketbus_core::aggregate::AggregateStore;
use ticketbus_core::events::{OrderCancelled, OrderCreated, OrderStatus};
use ticketbus_runtime::{
    ConcurrencyGuard, EventHandler, HandlerFuture, MessageContext, OutOfOrderPolicy, Publisher,
    VersionedWriter,
};
use tracing::{debug, info};
use uuid::Uuid;

/// Command side of the payments service.
#[derive(Clone)]
pub struct PaymentService {
    orders: VersionedWriter<OrderReplica>,
    payments: VersionedWriter<Payment>,
    gateway: Arc<dyn PaymentGateway>,
    publisher: Publisher,
}

impl std::fmt::Debug for PaymentService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentService")
            .field("publisher", &self.publisher)
            .finish_non_exhaustive()
    }
}

impl PaymentService {
    /// Service charging through `gateway`.
    #[must_use]
    pub fn new(
        orders: Arc<dyn AggregateStore<OrderReplica>>,
        payments: Arc<dyn AggregateStore<Payment>>,
        gateway: Arc<dyn PaymentGateway>,
        publisher: Publisher,
    ) -> Self {
        Self {
            orders: VersionedWriter::new(orders),
            payments: VersionedWriter::new(payments),
            gateway,
            publisher,
        }
    }

    /// Charge `user_id` for `order_id` with the card behind `token`.
    ///
    /// # Errors
    ///
    /// - [`DomainError::NotFound`] if the order is unknown here
    /// - [`DomainError::NotOwner`] if `user_id` is not the buyer
    /// - [`DomainError::Cancelled`] if the order was cancelled
    /// - [`ServiceError::Gateway`] if the charge fails
    /// - [`ServiceError::Store`] if the payment cannot be saved
    /// - [`ServiceError::Publish`] if `payment:created` was not acknowledged
    pub async fn charge(
        &self,
        order_id: &str,
        user_id: &str,
        token: &str,
    ) -> Result<Payment, ServiceError> {
        let order = self
            .orders
            .load(order_id)
            .await?
            .ok_or_else(|| DomainError::NotFound {
                kind: "order",
                id: order_id.to_string(),
            })?;
        if order.user_id != user_id {
            return Err(DomainError::NotOwner.into());
        }
        if order.status == OrderStatus::Cancelled {
            return Err(DomainError::Cancelled(order.id).into());
        }

        let charge = self.gateway.charge(token, order.price).await?;
        let payment = self
            .payments
            .create(Payment {
                id: Uuid::new_v4().to_string(),
                version: 0,
                order_id: order.id,
                stripe_id: charge.id,
            })
            .await?;
        self.publisher.publish(&payment.created_event()).await?;

        info!(
            aggregate_id = %payment.id,
            order_id = %payment.order_id,
            amount = charge.amount,
            "Payment created"
        );
        Ok(payment)
    }
}

/// `order:created`: store the replica.
#[derive(Clone, Debug)]
pub struct OrderCreatedHandler {
    guard: ConcurrencyGuard<OrderReplica>,
}

impl OrderCreatedHandler {
    /// Handler over the replica store.
    #[must_use]
    pub fn new(store: Arc<dyn AggregateStore<OrderReplica>>) -> Self {
        Self {
            guard: ConcurrencyGuard::new(store),
        }
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
            let outcome = self.guard.apply_create(OrderReplica::from(&event)).await?;
            debug!(aggregate_id = %event.id, ?outcome, "order:created handled");
            Ok(())
        })
    }
}

/// `order:cancelled`: mark the replica cancelled, in version order.
#[derive(Clone, Debug)]
pub struct OrderCancelledHandler {
    guard: ConcurrencyGuard<OrderReplica>,
    policy: OutOfOrderPolicy,
}

impl OrderCancelledHandler {
    /// Handler over the replica store.
    #[must_use]
    pub fn new(store: Arc<dyn AggregateStore<OrderReplica>>, policy: OutOfOrderPolicy) -> Self {
        Self {
            guard: ConcurrencyGuard::new(store),
            policy,
        }
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
            let outcome = self
                .guard
                .apply_if_next_version(&event.id, event.version, |replica| {
                    replica.status = OrderStatus::Cancelled;
                })
                .await?;
            outcome.into_handler_result(self.policy)
        })
    }
}
