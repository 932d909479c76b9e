//! The four services wired to one in-memory broker, each with its own
//! connection, stores and queue group.

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use ticketbus_core::aggregate::{AggregateStore, Versioned};
use ticketbus_core::clock::SystemClock;
use ticketbus_core::event_bus::SubscriptionOptions;
use ticketbus_core::events::{DomainEvent, ExpirationComplete, OrderCreated, OrderTicket};
use ticketbus_core::subject::Subject;
use ticketbus_core::OrderStatus;
use ticketbus_runtime::{
    BusConnection, ChannelEscalation, ConnectionOptions, EscalationSink, OperatorAlert,
    OutOfOrderPolicy, PublishError, Publisher, RetryPolicy,
};
use tokio::sync::mpsc::UnboundedReceiver;
use ticketbus_testing::{InMemoryAggregateStore, InMemoryBroker, InMemoryConnector};
use ticketing::aggregates::{Order, OrderReplica, Payment, Reservation, Ticket, TicketReplica};
use ticketing::expiration::ExpirationScheduler;
use ticketing::orders::{self, OrderService, OrderStores};
use ticketing::payment_gateway::MockPaymentGateway;
use ticketing::payments::{self, PaymentService};
use ticketing::tickets::{self, TicketService};
use ticketing::{DomainError, ServiceError, ServiceRuntime};

const TICKETS: &str = "tickets-service";
const ORDERS: &str = "orders-service";
const EXPIRATION: &str = "expiration-service";
const PAYMENTS: &str = "payments-service";

fn subscription(subject: Subject, group: &str) -> SubscriptionOptions {
    SubscriptionOptions::new(subject, group).with_ack_wait(Duration::from_millis(50))
}

fn shared<A: Versioned>(store: &InMemoryAggregateStore<A>) -> Arc<dyn AggregateStore<A>> {
    Arc::new(store.clone())
}

async fn process(
    broker: &InMemoryBroker,
    client_id: &str,
    escalation: &Arc<dyn EscalationSink>,
) -> (ServiceRuntime, Publisher) {
    let options = ConnectionOptions::new("ticketing", client_id, "memory://broker");
    let connection = BusConnection::connect(&InMemoryConnector::new(broker.clone()), &options)
        .await
        .unwrap();
    let publisher = Publisher::new(connection.clone(), Duration::from_secs(1));
    let runtime = ServiceRuntime::new(connection, Duration::from_secs(1))
        .with_retry_delay(Duration::from_millis(10))
        .with_escalation(Arc::clone(escalation));
    (runtime, publisher)
}

/// Poll `condition` for up to three seconds.
async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

struct Cluster {
    broker: InMemoryBroker,
    tickets: TicketService,
    orders: OrderService,
    payments: PaymentService,
    ticket_store: InMemoryAggregateStore<Ticket>,
    ticket_replicas: InMemoryAggregateStore<TicketReplica>,
    order_store: InMemoryAggregateStore<Order>,
    order_replicas: InMemoryAggregateStore<OrderReplica>,
    publisher: Publisher,
    alerts: UnboundedReceiver<OperatorAlert>,
    runtimes: Vec<ServiceRuntime>,
}

impl Cluster {
    async fn start(expiration_window: chrono::Duration) -> Self {
        let broker = InMemoryBroker::new();
        let (sink, alerts) = ChannelEscalation::new();
        let escalation: Arc<dyn EscalationSink> = Arc::new(sink);

        // tickets
        let ticket_store = InMemoryAggregateStore::<Ticket>::new();
        let (mut tickets_rt, tickets_pub) = process(&broker, "tickets-1", &escalation).await;
        tickets_rt.listen(
            Arc::new(tickets::OrderCreatedHandler::new(shared(&ticket_store), tickets_pub.clone())),
            subscription(Subject::OrderCreated, TICKETS),
        );
        tickets_rt.listen(
            Arc::new(tickets::OrderCancelledHandler::new(shared(&ticket_store), tickets_pub.clone())),
            subscription(Subject::OrderCancelled, TICKETS),
        );
        let tickets = TicketService::new(shared(&ticket_store), tickets_pub);

        // orders
        let ticket_replicas = InMemoryAggregateStore::<TicketReplica>::new();
        let order_store = InMemoryAggregateStore::<Order>::new();
        let stores = OrderStores {
            orders: shared(&order_store),
            tickets: shared(&ticket_replicas),
            reservations: shared(&InMemoryAggregateStore::<Reservation>::new()),
        };
        let (mut orders_rt, orders_pub) = process(&broker, "orders-1", &escalation).await;
        let orders = OrderService::new(
            &stores,
            orders_pub.clone(),
            Arc::new(SystemClock),
            expiration_window,
        );
        orders_rt.listen(
            Arc::new(orders::TicketCreatedHandler::new(shared(&ticket_replicas))),
            subscription(Subject::TicketCreated, ORDERS),
        );
        orders_rt.listen(
            Arc::new(orders::TicketUpdatedHandler::new(
                shared(&ticket_replicas),
                OutOfOrderPolicy::Redeliver,
            )),
            subscription(Subject::TicketUpdated, ORDERS),
        );
        orders_rt.listen(
            Arc::new(orders::ExpirationCompleteHandler::new(orders.clone())),
            subscription(Subject::ExpirationComplete, ORDERS),
        );
        orders_rt.listen(
            Arc::new(orders::PaymentCreatedHandler::new(shared(&order_store))),
            subscription(Subject::PaymentCreated, ORDERS),
        );

        // expiration
        let (mut expiration_rt, expiration_pub) = process(&broker, "expiration-1", &escalation).await;
        let retry = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(5))
            .build();
        expiration_rt.listen(
            Arc::new(
                ExpirationScheduler::new(expiration_pub, Arc::new(SystemClock))
                    .with_retry(retry)
                    .with_escalation(Arc::clone(&escalation), EXPIRATION),
            ),
            subscription(Subject::OrderCreated, EXPIRATION),
        );

        // payments
        let order_replicas = InMemoryAggregateStore::<OrderReplica>::new();
        let (mut payments_rt, payments_pub) = process(&broker, "payments-1", &escalation).await;
        payments_rt.listen(
            Arc::new(payments::OrderCreatedHandler::new(shared(&order_replicas))),
            subscription(Subject::OrderCreated, PAYMENTS),
        );
        payments_rt.listen(
            Arc::new(payments::OrderCancelledHandler::new(
                shared(&order_replicas),
                OutOfOrderPolicy::Redeliver,
            )),
            subscription(Subject::OrderCancelled, PAYMENTS),
        );
        let payments = PaymentService::new(
            shared(&order_replicas),
            shared(&InMemoryAggregateStore::<Payment>::new()),
            MockPaymentGateway::shared(),
            payments_pub,
        );

        Self {
            broker,
            tickets,
            orders,
            payments,
            ticket_store,
            ticket_replicas,
            order_store,
            order_replicas,
            publisher: orders_pub,
            alerts,
            runtimes: vec![tickets_rt, orders_rt, expiration_rt, payments_rt],
        }
    }

    /// Create a ticket and wait until the orders service knows it.
    async fn listed_ticket(&self) -> Ticket {
        let ticket = self.tickets.create_ticket("seller", "concert", 20).await.unwrap();
        assert!(eventually(|| self.ticket_replicas.get(&ticket.id).is_some()).await);
        ticket
    }

    async fn stop(self) {
        for runtime in self.runtimes {
            runtime.shutdown().await.unwrap();
        }
    }
}

#[tokio::test]
async fn unpaid_order_expires_and_releases_the_ticket() {
    let cluster = Cluster::start(chrono::Duration::milliseconds(300)).await;
    let ticket = cluster.listed_ticket().await;

    let order = cluster.orders.create_order(&ticket.id, "buyer").await.unwrap();

    // Reserved on the tickets side.
    assert!(
        eventually(|| cluster
            .ticket_store
            .get(&ticket.id)
            .is_some_and(|t| t.order_id.as_deref() == Some(order.id.as_str())))
        .await
    );

    // Expired, cancelled and released everywhere.
    assert!(
        eventually(|| cluster
            .ticket_store
            .get(&ticket.id)
            .is_some_and(|t| t.version == 2 && t.order_id.is_none()))
        .await
    );
    assert!(eventually(|| cluster.ticket_replicas.get(&ticket.id).is_some_and(|r| r.version == 2)).await);
    assert_eq!(cluster.order_store.get(&order.id).unwrap().status, OrderStatus::Cancelled);
    assert!(
        eventually(|| cluster
            .order_replicas
            .get(&order.id)
            .is_some_and(|o| o.status == OrderStatus::Cancelled && o.version == 1))
        .await
    );

    // The ticket can be ordered again.
    assert!(cluster.orders.create_order(&ticket.id, "other").await.is_ok());
    cluster.stop().await;
}

#[tokio::test]
async fn paid_order_survives_its_expiration() {
    let cluster = Cluster::start(chrono::Duration::seconds(60)).await;
    let ticket = cluster.listed_ticket().await;
    let order = cluster.orders.create_order(&ticket.id, "buyer").await.unwrap();
    assert!(eventually(|| cluster.order_replicas.get(&order.id).is_some()).await);

    cluster.payments.charge(&order.id, "buyer", "tok_visa").await.unwrap();
    assert!(
        eventually(|| cluster
            .order_store
            .get(&order.id)
            .is_some_and(|o| o.status == OrderStatus::Complete))
        .await
    );

    cluster
        .publisher
        .publish(&ExpirationComplete {
            order_id: order.id.clone(),
        })
        .await
        .unwrap();
    assert!(
        cluster
            .broker
            .wait_for_acks(Subject::ExpirationComplete, ORDERS, 1, Duration::from_secs(2))
            .await
    );

    assert_eq!(cluster.order_store.get(&order.id).unwrap().status, OrderStatus::Complete);
    assert_eq!(cluster.broker.message_count(Subject::OrderCancelled), 0);
    assert_eq!(
        cluster.ticket_store.get(&ticket.id).unwrap().order_id,
        Some(order.id.clone())
    );
    cluster.stop().await;
}

#[tokio::test]
async fn cancelled_order_cannot_be_paid() {
    let cluster = Cluster::start(chrono::Duration::seconds(60)).await;
    let ticket = cluster.listed_ticket().await;
    let order = cluster.orders.create_order(&ticket.id, "buyer").await.unwrap();
    assert!(eventually(|| cluster.order_replicas.get(&order.id).is_some()).await);

    cluster.orders.cancel_order(&order.id, "buyer").await.unwrap();
    assert!(
        eventually(|| cluster
            .order_replicas
            .get(&order.id)
            .is_some_and(|o| o.status == OrderStatus::Cancelled))
        .await
    );

    let result = cluster.payments.charge(&order.id, "buyer", "tok_visa").await;
    assert!(matches!(result, Err(ServiceError::Domain(DomainError::Cancelled(_)))));
    assert!(
        eventually(|| cluster
            .ticket_store
            .get(&ticket.id)
            .is_some_and(|t| t.order_id.is_none() && t.version == 2))
        .await
    );
    cluster.stop().await;
}

#[tokio::test]
async fn duplicate_order_created_reserves_once() {
    let cluster = Cluster::start(chrono::Duration::seconds(60)).await;
    let ticket = cluster.listed_ticket().await;
    let event = OrderCreated {
        id: "o-1".to_string(),
        version: 0,
        status: OrderStatus::Created,
        user_id: "buyer".to_string(),
        expires_at: Utc::now() + chrono::Duration::seconds(60),
        ticket: OrderTicket {
            id: ticket.id.clone(),
            price: ticket.price,
        },
    };

    cluster.publisher.publish(&event).await.unwrap();
    cluster.publisher.publish(&event).await.unwrap();
    assert!(
        cluster
            .broker
            .wait_for_acks(Subject::OrderCreated, TICKETS, 2, Duration::from_secs(2))
            .await
    );
    assert!(
        cluster
            .broker
            .wait_for_acks(Subject::OrderCreated, PAYMENTS, 2, Duration::from_secs(2))
            .await
    );

    let stored = cluster.ticket_store.get(&ticket.id).unwrap();
    assert_eq!((stored.version, stored.order_id.as_deref()), (1, Some("o-1")));
    let versions: Vec<u64> = cluster
        .broker
        .published_events(Subject::TicketUpdated)
        .into_iter()
        .filter_map(|event| match event {
            DomainEvent::TicketUpdated(updated) => Some(updated.version),
            _ => None,
        })
        .collect();
    assert_eq!(versions, vec![1, 1]);
    assert!(eventually(|| cluster.ticket_replicas.get(&ticket.id).is_some_and(|r| r.version == 1)).await);
    assert_eq!(cluster.order_replicas.get("o-1").unwrap().version, 0);
    cluster.stop().await;
}

#[tokio::test]
async fn second_order_waits_until_the_first_releases_the_ticket() {
    let mut cluster = Cluster::start(chrono::Duration::seconds(60)).await;
    let ticket = cluster.listed_ticket().await;
    let first = cluster.orders.create_order(&ticket.id, "buyer").await.unwrap();
    assert!(
        eventually(|| cluster
            .ticket_store
            .get(&ticket.id)
            .is_some_and(|t| t.order_id.as_deref() == Some(first.id.as_str())))
        .await
    );

    // order:created for a second order overtakes the first order's
    // order:cancelled.
    let second = OrderCreated {
        id: "o-2".to_string(),
        version: 0,
        status: OrderStatus::Created,
        user_id: "other".to_string(),
        expires_at: Utc::now() + chrono::Duration::seconds(60),
        ticket: OrderTicket {
            id: ticket.id.clone(),
            price: ticket.price,
        },
    };
    cluster.publisher.publish(&second).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    let held = cluster.ticket_store.get(&ticket.id).unwrap();
    assert_eq!((held.version, held.order_id.as_deref()), (1, Some(first.id.as_str())));

    cluster.orders.cancel_order(&first.id, "buyer").await.unwrap();

    assert!(
        eventually(|| cluster
            .ticket_store
            .get(&ticket.id)
            .is_some_and(|t| t.version == 3 && t.order_id.as_deref() == Some("o-2")))
        .await
    );
    assert!(cluster.alerts.try_recv().is_err());
    cluster.stop().await;
}

#[tokio::test]
async fn order_whose_announcement_timed_out_is_cancelled_everywhere() {
    let mut cluster = Cluster::start(chrono::Duration::seconds(60)).await;
    let ticket = cluster.listed_ticket().await;
    cluster.broker.swallow_publish_acks(1);

    let result = cluster.orders.create_order(&ticket.id, "buyer").await;

    assert!(matches!(result, Err(ServiceError::Publish(PublishError::Timeout { .. }))));
    let created = cluster.broker.published_events(Subject::OrderCreated);
    let [DomainEvent::OrderCreated(created)] = created.as_slice() else {
        unreachable!("the unacknowledged order:created was still persisted")
    };
    assert_eq!(cluster.order_store.get(&created.id).unwrap().status, OrderStatus::Cancelled);
    assert!(eventually(|| cluster.broker.message_count(Subject::OrderCancelled) == 1).await);
    assert!(
        eventually(|| cluster
            .order_replicas
            .get(&created.id)
            .is_some_and(|o| o.status == OrderStatus::Cancelled && o.version == 1))
        .await
    );
    assert!(
        eventually(|| cluster
            .ticket_store
            .get(&ticket.id)
            .is_some_and(|t| t.version == 2 && t.order_id.is_none()))
        .await
    );

    let charged = cluster.payments.charge(&created.id, "buyer", "tok_visa").await;
    assert!(matches!(charged, Err(ServiceError::Domain(DomainError::Cancelled(_)))));
    assert!(cluster.alerts.try_recv().is_err());
    cluster.stop().await;
}
