//! Tickets service process.
//!
//! Reserves and releases tickets as orders are created and cancelled.
//!
//! ```bash
//! cargo run -p ticketing-services --features redpanda --bin tickets
//! ```

use std::sync::Arc;
use ticketbus_core::aggregate::AggregateStore;
use ticketbus_core::subject::Subject;
use ticketbus_postgres::{DeadLetterQueue, PostgresAggregateStore};
use ticketbus_redpanda::RedpandaConnector;
use ticketbus_runtime::{BusConnection, Publisher, shutdown_signal};
use ticketing::aggregates::Ticket;
use ticketing::bootstrap::open_database;
use ticketing::tickets::{OrderCancelledHandler, OrderCreatedHandler};
use ticketing::{Config, ServiceKind, ServiceRuntime, init_tracing};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = Config::from_env(ServiceKind::Tickets)?;
    tracing::info!(
        bus = %config.bus_url,
        client_id = %config.client_id,
        queue_group = %config.queue_group,
        "Starting tickets service"
    );

    let pool = open_database(&config).await?;
    let connection =
        BusConnection::connect(&RedpandaConnector::new(), &config.connection_options()).await?;
    let publisher = Publisher::new(connection.clone(), config.publish_timeout);
    let dead_letters = Arc::new(DeadLetterQueue::new(pool.clone()));
    let mut runtime = ServiceRuntime::from_config(&config, connection, dead_letters);

    let tickets: Arc<dyn AggregateStore<Ticket>> =
        Arc::new(PostgresAggregateStore::<Ticket>::new(pool));
    runtime.listen(
        Arc::new(OrderCreatedHandler::new(Arc::clone(&tickets), publisher.clone())),
        config.subscription(Subject::OrderCreated),
    );
    runtime.listen(
        Arc::new(OrderCancelledHandler::new(tickets, publisher)),
        config.subscription(Subject::OrderCancelled),
    );

    runtime.run_until(shutdown_signal()).await?;
    Ok(())
}
