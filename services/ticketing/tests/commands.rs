//! Command-side rules of the services, against in-memory stores and broker.

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect

use std::sync::Arc;
use std::time::Duration;
use ticketbus_core::aggregate::AggregateStore;
use ticketbus_core::clock::Clock;
use ticketbus_core::envelope::CorrelationId;
use ticketbus_core::events::{DomainEvent, OrderCreated, OrderTicket};
use ticketbus_core::subject::Subject;
use ticketbus_core::OrderStatus;
use ticketbus_runtime::{
    BusConnection, ChannelEscalation, ConnectionOptions, EventHandler, GuardError, HandlerError,
    MessageContext, PublishError, Publisher, RetryPolicy,
};
use ticketbus_testing::{InMemoryAggregateStore, InMemoryBroker, InMemoryConnector, test_clock};
use ticketing::aggregates::{Order, OrderReplica, Payment, Reservation, Ticket, TicketReplica};
use ticketing::expiration::ExpirationScheduler;
use ticketing::orders::{OrderService, OrderStores};
use ticketing::payment_gateway::{GatewayError, MockPaymentGateway};
use ticketing::payments::PaymentService;
use ticketing::tickets::{OrderCreatedHandler, TicketService};
use ticketing::{DomainError, ServiceError};

async fn publisher(broker: &InMemoryBroker) -> Publisher {
    let connection = BusConnection::connect(
        &InMemoryConnector::new(broker.clone()),
        &ConnectionOptions::new("ticketing", "commands-test", "memory://broker"),
    )
    .await
    .unwrap();
    Publisher::new(connection, Duration::from_secs(1))
}

fn delivered(subject: Subject) -> MessageContext {
    MessageContext {
        subject,
        sequence: 7,
        attempt: 1,
        correlation_id: CorrelationId::new(),
        published_at: test_clock().now(),
    }
}

fn order_created(id: &str, ticket_id: &str) -> OrderCreated {
    OrderCreated {
        id: id.to_string(),
        version: 0,
        status: OrderStatus::Created,
        user_id: "buyer".to_string(),
        expires_at: test_clock().now(),
        ticket: OrderTicket {
            id: ticket_id.to_string(),
            price: 20,
        },
    }
}

fn shared<A: ticketbus_core::Versioned>(store: &InMemoryAggregateStore<A>) -> Arc<dyn AggregateStore<A>> {
    Arc::new(store.clone())
}

// ---------------------------------------------------------------------------
// tickets
// ---------------------------------------------------------------------------

struct Tickets {
    broker: InMemoryBroker,
    store: InMemoryAggregateStore<Ticket>,
    service: TicketService,
}

async fn tickets() -> Tickets {
    let broker = InMemoryBroker::new();
    let store = InMemoryAggregateStore::new();
    let service = TicketService::new(shared(&store), publisher(&broker).await);
    Tickets {
        broker,
        store,
        service,
    }
}

#[tokio::test]
async fn create_ticket_publishes_ticket_created() {
    let t = tickets().await;

    let ticket = t.service.create_ticket("seller", "concert", 20).await.unwrap();

    assert_eq!(ticket.version, 0);
    assert_eq!(t.store.get(&ticket.id), Some(ticket.clone()));
    let published = t.broker.published_events(Subject::TicketCreated);
    assert_eq!(published.len(), 1);
    let DomainEvent::TicketCreated(event) = &published[0] else {
        unreachable!("ticket:created carries a TicketCreated payload")
    };
    assert_eq!((event.id.as_str(), event.version, event.price), (ticket.id.as_str(), 0, 20));
}

#[tokio::test]
async fn invalid_ticket_is_neither_saved_nor_published() {
    let t = tickets().await;

    let result = t.service.create_ticket("seller", "concert", 0).await;

    assert!(matches!(result, Err(ServiceError::Domain(DomainError::Invalid(_)))));
    assert!(t.store.is_empty());
    assert_eq!(t.broker.message_count(Subject::TicketCreated), 0);
}

#[tokio::test]
async fn only_the_seller_updates_a_ticket() {
    let t = tickets().await;
    let ticket = t.service.create_ticket("seller", "concert", 20).await.unwrap();

    let result = t.service.update_ticket(&ticket.id, "someone", 0, "opera", 30).await;
    assert!(matches!(result, Err(ServiceError::Domain(DomainError::NotOwner))));

    let updated = t.service.update_ticket(&ticket.id, "seller", 0, "opera", 30).await.unwrap();
    assert_eq!((updated.version, updated.price), (1, 30));
    assert_eq!(t.broker.message_count(Subject::TicketUpdated), 1);
}

#[tokio::test]
async fn stale_update_is_a_version_conflict() {
    let t = tickets().await;
    let ticket = t.service.create_ticket("seller", "concert", 20).await.unwrap();
    t.service.update_ticket(&ticket.id, "seller", 0, "opera", 30).await.unwrap();

    let result = t.service.update_ticket(&ticket.id, "seller", 0, "ballet", 40).await;

    assert!(matches!(
        result,
        Err(ServiceError::Store(GuardError::Conflict {
            expected: 0,
            actual: 1,
            ..
        }))
    ));
    assert_eq!(t.store.get(&ticket.id).unwrap().title, "opera");
}

#[tokio::test]
async fn reserved_ticket_cannot_be_updated() {
    let t = tickets().await;
    let ticket = t.service.create_ticket("seller", "concert", 20).await.unwrap();
    let mut reserved = ticket.clone();
    reserved.reserve("o-1").unwrap();
    t.store.compare_and_swap(reserved, 0).await.unwrap();

    let result = t.service.update_ticket(&ticket.id, "seller", 1, "opera", 30).await;

    assert!(matches!(result, Err(ServiceError::Domain(DomainError::Reserved(id))) if id == ticket.id));
    assert_eq!(t.broker.message_count(Subject::TicketUpdated), 0);
}

#[tokio::test]
async fn order_for_a_ticket_held_by_another_order_waits_for_its_release() {
    let t = tickets().await;
    let ticket = t.service.create_ticket("seller", "concert", 20).await.unwrap();
    let mut reserved = ticket.clone();
    reserved.reserve("o-1").unwrap();
    t.store.compare_and_swap(reserved, 0).await.unwrap();
    let handler = OrderCreatedHandler::new(shared(&t.store), publisher(&t.broker).await);

    let result = handler
        .handle(order_created("o-2", &ticket.id), &delivered(Subject::OrderCreated))
        .await;

    assert!(matches!(result, Err(HandlerError::Transient(_))));
    assert_eq!(t.store.get(&ticket.id).unwrap().order_id.as_deref(), Some("o-1"));
    assert_eq!(t.broker.message_count(Subject::TicketUpdated), 0);
}

#[tokio::test]
async fn updating_a_missing_ticket_is_not_found() {
    let t = tickets().await;

    let result = t.service.update_ticket("t-404", "seller", 0, "opera", 30).await;

    assert!(matches!(
        result,
        Err(ServiceError::Domain(DomainError::NotFound { kind: "ticket", .. }))
    ));
}

// ---------------------------------------------------------------------------
// orders
// ---------------------------------------------------------------------------

struct Orders {
    broker: InMemoryBroker,
    reservations: InMemoryAggregateStore<Reservation>,
    service: OrderService,
}

async fn orders() -> Orders {
    let broker = InMemoryBroker::new();
    let tickets = InMemoryAggregateStore::<TicketReplica>::new();
    tickets
        .insert(TicketReplica {
            id: "t-1".to_string(),
            version: 0,
            title: "concert".to_string(),
            price: 20,
        })
        .await
        .unwrap();
    let reservations = InMemoryAggregateStore::new();
    let stores = OrderStores {
        orders: Arc::new(InMemoryAggregateStore::<Order>::new()),
        tickets: shared(&tickets),
        reservations: shared(&reservations),
    };
    let service = OrderService::new(
        &stores,
        publisher(&broker).await,
        Arc::new(test_clock()),
        chrono::Duration::minutes(15),
    );
    Orders {
        broker,
        reservations,
        service,
    }
}

#[tokio::test]
async fn create_order_expires_after_the_window() {
    let o = orders().await;

    let order = o.service.create_order("t-1", "buyer").await.unwrap();

    assert_eq!(order.status, OrderStatus::Created);
    assert_eq!(order.ticket.price, 20);
    assert_eq!(order.expires_at, test_clock().now() + chrono::Duration::minutes(15));
    let published = o.broker.published_events(Subject::OrderCreated);
    assert_eq!(published.len(), 1);
    let DomainEvent::OrderCreated(event) = &published[0] else {
        unreachable!("order:created carries an OrderCreated payload")
    };
    assert_eq!(event.id, order.id);
    assert_eq!(event.expires_at, order.expires_at);
}

#[tokio::test]
async fn order_for_unknown_ticket_is_not_found() {
    let o = orders().await;

    let result = o.service.create_order("t-404", "buyer").await;

    assert!(matches!(
        result,
        Err(ServiceError::Domain(DomainError::NotFound { kind: "ticket", .. }))
    ));
    assert_eq!(o.broker.message_count(Subject::OrderCreated), 0);
}

#[tokio::test]
async fn ticket_can_only_be_ordered_once_until_cancelled() {
    let o = orders().await;
    let first = o.service.create_order("t-1", "buyer").await.unwrap();

    let second = o.service.create_order("t-1", "other").await;
    assert!(matches!(second, Err(ServiceError::Domain(DomainError::Reserved(_)))));

    let cancelled = o.service.cancel_order(&first.id, "buyer").await.unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(cancelled.version, 1);
    assert_eq!(o.broker.message_count(Subject::OrderCancelled), 1);

    let third = o.service.create_order("t-1", "other").await.unwrap();
    assert_eq!(o.reservations.get("t-1").unwrap().order_id, Some(third.id));
}

#[tokio::test]
async fn only_the_buyer_cancels() {
    let o = orders().await;
    let order = o.service.create_order("t-1", "buyer").await.unwrap();

    let result = o.service.cancel_order(&order.id, "someone").await;

    assert!(matches!(result, Err(ServiceError::Domain(DomainError::NotOwner))));
    assert_eq!(o.broker.message_count(Subject::OrderCancelled), 0);
}

#[tokio::test]
async fn unannounced_order_is_cancelled_and_frees_the_ticket() {
    let o = orders().await;
    o.broker.fail_next_publishes(1);

    let result = o.service.create_order("t-1", "buyer").await;

    assert!(matches!(result, Err(ServiceError::Publish(PublishError::Transport(_)))));
    assert_eq!(o.reservations.get("t-1").unwrap().order_id, None);
    assert_eq!(o.broker.message_count(Subject::OrderCancelled), 0);
    assert!(o.service.create_order("t-1", "buyer").await.is_ok());
}

#[tokio::test]
async fn timed_out_order_is_cancelled_and_the_cancellation_announced() {
    let o = orders().await;
    o.broker.swallow_publish_acks(1);

    let result = o.service.create_order("t-1", "buyer").await;

    assert!(matches!(result, Err(ServiceError::Publish(PublishError::Timeout { .. }))));
    let created = o.broker.published_events(Subject::OrderCreated);
    let [DomainEvent::OrderCreated(created)] = created.as_slice() else {
        unreachable!("the timed-out order:created still reached the broker")
    };
    let order = o.service.order(&created.id).await.unwrap().unwrap();
    assert_eq!((order.status, order.version), (OrderStatus::Cancelled, 1));
    let cancelled = o.broker.published_events(Subject::OrderCancelled);
    let [DomainEvent::OrderCancelled(cancelled)] = cancelled.as_slice() else {
        unreachable!("exactly one order:cancelled is published")
    };
    assert_eq!((cancelled.id.as_str(), cancelled.version), (created.id.as_str(), 1));
    assert_eq!(o.reservations.get("t-1").unwrap().order_id, None);
}

// ---------------------------------------------------------------------------
// expiration
// ---------------------------------------------------------------------------

#[tokio::test]
async fn expiration_that_cannot_be_published_is_escalated() {
    let broker = InMemoryBroker::new();
    let (sink, mut alerts) = ChannelEscalation::new();
    let retry = RetryPolicy::builder()
        .max_retries(1)
        .initial_delay(Duration::from_millis(1))
        .jitter(false)
        .build();
    let scheduler = ExpirationScheduler::new(publisher(&broker).await, Arc::new(test_clock()))
        .with_retry(retry)
        .with_escalation(Arc::new(sink), "expiration-blue");
    broker.fail_next_publishes(2);
    let context = delivered(Subject::OrderCreated);

    scheduler
        .handle(order_created("o-1", "t-1"), &context)
        .await
        .unwrap();
    let alert = tokio::time::timeout(Duration::from_secs(2), alerts.recv())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(alert.subject, Subject::ExpirationComplete);
    assert_eq!(alert.queue_group, "expiration-blue");
    assert_eq!((alert.sequence, alert.attempt), (7, 1));
    assert_eq!(alert.correlation_id, context.correlation_id);
    assert_eq!(alert.raised_at, test_clock().now());
    assert!(alert.error.contains("o-1"));
    assert_eq!(broker.message_count(Subject::ExpirationComplete), 0);
}

// ---------------------------------------------------------------------------
// payments
// ---------------------------------------------------------------------------

struct Payments {
    broker: InMemoryBroker,
    orders: InMemoryAggregateStore<OrderReplica>,
    service: PaymentService,
}

async fn payments(status: OrderStatus) -> Payments {
    let broker = InMemoryBroker::new();
    let orders = InMemoryAggregateStore::new();
    orders
        .insert(OrderReplica {
            id: "o-1".to_string(),
            version: 0,
            status,
            user_id: "buyer".to_string(),
            price: 20,
        })
        .await
        .unwrap();
    let service = PaymentService::new(
        shared(&orders),
        Arc::new(InMemoryAggregateStore::<Payment>::new()),
        MockPaymentGateway::shared(),
        publisher(&broker).await,
    );
    Payments {
        broker,
        orders,
        service,
    }
}

#[tokio::test]
async fn charge_publishes_payment_created() {
    let p = payments(OrderStatus::Created).await;

    let payment = p.service.charge("o-1", "buyer", "tok_visa").await.unwrap();

    assert_eq!(payment.order_id, "o-1");
    assert!(payment.stripe_id.starts_with("ch_mock_"));
    let published = p.broker.published_events(Subject::PaymentCreated);
    assert_eq!(published.len(), 1);
    let DomainEvent::PaymentCreated(event) = &published[0] else {
        unreachable!("payment:created carries a PaymentCreated payload")
    };
    assert_eq!(event.stripe_id, payment.stripe_id);
}

#[tokio::test]
async fn cancelled_order_cannot_be_charged() {
    let p = payments(OrderStatus::Cancelled).await;

    let result = p.service.charge("o-1", "buyer", "tok_visa").await;

    assert!(matches!(
        result,
        Err(ServiceError::Domain(DomainError::Cancelled(id))) if id == "o-1"
    ));
    assert_eq!(p.broker.message_count(Subject::PaymentCreated), 0);
}

#[tokio::test]
async fn charge_checks_owner_and_existence() {
    let p = payments(OrderStatus::Created).await;

    assert!(matches!(
        p.service.charge("o-1", "someone", "tok_visa").await,
        Err(ServiceError::Domain(DomainError::NotOwner))
    ));
    assert!(matches!(
        p.service.charge("o-404", "buyer", "tok_visa").await,
        Err(ServiceError::Domain(DomainError::NotFound { kind: "order", .. }))
    ));
    assert_eq!(p.orders.get("o-1").unwrap().version, 0);
}

#[tokio::test]
async fn declined_card_records_nothing() {
    let p = payments(OrderStatus::Created).await;

    let result = p
        .service
        .charge("o-1", "buyer", MockPaymentGateway::DECLINED_TOKEN)
        .await;

    assert!(matches!(
        result,
        Err(ServiceError::Gateway(GatewayError::CardDeclined { .. }))
    ));
    assert_eq!(p.broker.message_count(Subject::PaymentCreated), 0);
}
