//! Payments service process.
//!
//! Replicates orders so charges can be checked locally. Charging itself is
//! exposed by `ticketing::payments::PaymentService` to whatever front end
//! embeds it.
//!
//! ```bash
//! cargo run -p ticketing-services --features redpanda --bin payments
//! ```

use std::sync::Arc;
use ticketbus_core::aggregate::AggregateStore;
use ticketbus_core::subject::Subject;
use ticketbus_postgres::{DeadLetterQueue, PostgresAggregateStore};
use ticketbus_redpanda::RedpandaConnector;
use ticketbus_runtime::{BusConnection, shutdown_signal};
use ticketing::aggregates::OrderReplica;
use ticketing::bootstrap::open_database;
use ticketing::payments::{OrderCancelledHandler, OrderCreatedHandler};
use ticketing::{Config, ServiceKind, ServiceRuntime, init_tracing};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = Config::from_env(ServiceKind::Payments)?;
    tracing::info!(
        bus = %config.bus_url,
        client_id = %config.client_id,
        queue_group = %config.queue_group,
        "Starting payments service"
    );

    let pool = open_database(&config).await?;
    let connection =
        BusConnection::connect(&RedpandaConnector::new(), &config.connection_options()).await?;
    let dead_letters = Arc::new(DeadLetterQueue::new(pool.clone()));
    let mut runtime = ServiceRuntime::from_config(&config, connection, dead_letters);

    let orders: Arc<dyn AggregateStore<OrderReplica>> =
        Arc::new(PostgresAggregateStore::<OrderReplica>::new(pool));
    runtime.listen(
        Arc::new(OrderCreatedHandler::new(Arc::clone(&orders))),
        config.subscription(Subject::OrderCreated),
    );
    runtime.listen(
        Arc::new(OrderCancelledHandler::new(orders, config.out_of_order)),
        config.subscription(Subject::OrderCancelled),
    );

    runtime.run_until(shutdown_signal()).await?;
    Ok(())
}
