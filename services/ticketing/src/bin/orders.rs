//! Orders service process.
//!
//! Replicates tickets, expires unpaid orders and completes paid ones.
//!
//! ```bash
//! cargo run -p ticketing-services --features redpanda --bin orders
//! ```

use std::sync::Arc;
use ticketbus_core::clock::SystemClock;
use ticketbus_core::subject::Subject;
use ticketbus_postgres::{DeadLetterQueue, PostgresAggregateStore};
use ticketbus_redpanda::RedpandaConnector;
use ticketbus_runtime::{BusConnection, Publisher, shutdown_signal};
use ticketing::aggregates::{Order, Reservation, TicketReplica};
use ticketing::bootstrap::open_database;
use ticketing::orders::{
    ExpirationCompleteHandler, OrderService, OrderStores, PaymentCreatedHandler,
    TicketCreatedHandler, TicketUpdatedHandler,
};
use ticketing::{Config, ServiceKind, ServiceRuntime, init_tracing};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = Config::from_env(ServiceKind::Orders)?;
    tracing::info!(
        bus = %config.bus_url,
        client_id = %config.client_id,
        queue_group = %config.queue_group,
        expiration_window_secs = config.expiration_window.as_secs(),
        "Starting orders service"
    );

    let pool = open_database(&config).await?;
    let connection =
        BusConnection::connect(&RedpandaConnector::new(), &config.connection_options()).await?;
    let publisher = Publisher::new(connection.clone(), config.publish_timeout);
    let dead_letters = Arc::new(DeadLetterQueue::new(pool.clone()));
    let mut runtime = ServiceRuntime::from_config(&config, connection, dead_letters);

    let stores = OrderStores {
        orders: Arc::new(PostgresAggregateStore::<Order>::new(pool.clone())),
        tickets: Arc::new(PostgresAggregateStore::<TicketReplica>::new(pool.clone())),
        reservations: Arc::new(PostgresAggregateStore::<Reservation>::new(pool)),
    };
    let service = OrderService::new(
        &stores,
        publisher,
        Arc::new(SystemClock),
        config.expiration_window(),
    );

    runtime.listen(
        Arc::new(TicketCreatedHandler::new(Arc::clone(&stores.tickets))),
        config.subscription(Subject::TicketCreated),
    );
    runtime.listen(
        Arc::new(TicketUpdatedHandler::new(Arc::clone(&stores.tickets), config.out_of_order)),
        config.subscription(Subject::TicketUpdated),
    );
    runtime.listen(
        Arc::new(ExpirationCompleteHandler::new(service)),
        config.subscription(Subject::ExpirationComplete),
    );
    runtime.listen(
        Arc::new(PaymentCreatedHandler::new(Arc::clone(&stores.orders))),
        config.subscription(Subject::PaymentCreated),
    );

    runtime.run_until(shutdown_signal()).await?;
    Ok(())
}
