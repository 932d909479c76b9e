//! Expiration service process.
//!
//! Publishes `expiration:complete` when an order's payment window closes.
//! It keeps no database: pending jobs live in memory.
//!
//! ```bash
//! cargo run -p ticketing-services --features redpanda --bin expiration
//! ```

use std::sync::Arc;
use ticketbus_core::clock::SystemClock;
use ticketbus_core::subject::Subject;
use ticketbus_redpanda::RedpandaConnector;
use ticketbus_runtime::{BusConnection, Publisher, TracingEscalation, shutdown_signal};
use ticketing::expiration::ExpirationScheduler;
use ticketing::{Config, ServiceKind, ServiceRuntime, init_tracing};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = Config::from_env(ServiceKind::Expiration)?;
    tracing::info!(
        bus = %config.bus_url,
        client_id = %config.client_id,
        queue_group = %config.queue_group,
        "Starting expiration service"
    );

    let connection =
        BusConnection::connect(&RedpandaConnector::new(), &config.connection_options()).await?;
    let publisher = Publisher::new(connection.clone(), config.publish_timeout);
    let mut runtime = ServiceRuntime::new(connection, config.shutdown_timeout);

    runtime.listen(
        Arc::new(
            ExpirationScheduler::new(publisher, Arc::new(SystemClock))
                .with_escalation(Arc::new(TracingEscalation), config.queue_group.clone()),
        ),
        config.subscription(Subject::OrderCreated),
    );

    runtime.run_until(shutdown_signal()).await?;
    Ok(())
}
