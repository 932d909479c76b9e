//! Process wiring shared by the service binaries.
//!
//! A [`ServiceRuntime`] owns the bus connection and every listener task of
//! one process. Shutdown runs in a fixed order:
//!
//! 1. broadcast the shutdown signal to all listeners
//! 2. wait up to the shutdown timeout for each listener task to stop
//! 3. close the connection, draining in-flight publishes
//!
//! # Example
//!
//! ```rust,ignore
//! let mut runtime = ServiceRuntime::new(connection, config.shutdown_timeout);
//! runtime.listen(handler, config.subscription(Subject::OrderCreated));
//! runtime.run_until(shutdown_signal()).await?;
//! ```

use crate::config::Config;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use ticketbus_core::aggregate::StoreError;
use ticketbus_core::dead_letter::DeadLetterSink;
use ticketbus_core::event_bus::{BusError, SubscriptionOptions};
use ticketbus_runtime::{BusConnection, CloseReport, EscalationSink, EventHandler, Listener};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the `fmt` subscriber, filtered by `RUST_LOG`
/// (default `info,ticketing=debug`).
pub fn init_tracing() {
    // A second call (e.g. from tests) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,ticketing=debug,ticketbus=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Open the service database and bring its schema up to date.
///
/// # Errors
///
/// Returns [`StoreError::DatabaseError`] if the database is unreachable or a
/// migration fails.
pub async fn open_database(config: &Config) -> Result<sqlx::PgPool, StoreError> {
    let pool =
        ticketbus_postgres::connect(&config.database_url, config.database_max_connections).await?;
    ticketbus_postgres::migrate(&pool).await?;
    Ok(pool)
}

/// Listeners and connection of one service process.
pub struct ServiceRuntime {
    connection: BusConnection,
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<(String, JoinHandle<()>)>,
    dead_letter: Option<(Arc<dyn DeadLetterSink>, u32)>,
    escalation: Option<Arc<dyn EscalationSink>>,
    retry_delay: Option<Duration>,
    shutdown_timeout: Duration,
}

impl std::fmt::Debug for ServiceRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRuntime")
            .field("connection", &self.connection)
            .field("listeners", &self.handles.len())
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish_non_exhaustive()
    }
}

impl ServiceRuntime {
    /// Runtime over an open connection.
    #[must_use]
    pub fn new(connection: BusConnection, shutdown_timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            connection,
            shutdown_tx,
            handles: Vec::new(),
            dead_letter: None,
            escalation: None,
            retry_delay: None,
            shutdown_timeout,
        }
    }

    /// Runtime configured from `config`; dead letters go to `sink` when
    /// `DEAD_LETTER_MAX_DELIVERIES` is set.
    #[must_use]
    pub fn from_config(
        config: &Config,
        connection: BusConnection,
        sink: Arc<dyn DeadLetterSink>,
    ) -> Self {
        let runtime = Self::new(connection, config.shutdown_timeout);
        match config.dead_letter_max_deliveries {
            Some(max) => runtime.with_dead_letter(sink, max),
            None => runtime,
        }
    }

    /// Dead-letter messages in `sink` after `max_deliveries` for every
    /// listener started afterwards.
    #[must_use]
    pub fn with_dead_letter(mut self, sink: Arc<dyn DeadLetterSink>, max_deliveries: u32) -> Self {
        self.dead_letter = Some((sink, max_deliveries));
        self
    }

    /// Send permanent failures to `sink`.
    #[must_use]
    pub fn with_escalation(mut self, sink: Arc<dyn EscalationSink>) -> Self {
        self.escalation = Some(sink);
        self
    }

    /// Resubscribe delay after a delivery stream ends.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    /// The process-wide connection.
    #[must_use]
    pub const fn connection(&self) -> &BusConnection {
        &self.connection
    }

    /// Number of listener tasks started.
    #[must_use]
    pub fn listeners(&self) -> usize {
        self.handles.len()
    }

    /// Start a listener feeding `handler`.
    pub fn listen<H: EventHandler>(&mut self, handler: Arc<H>, options: SubscriptionOptions) {
        let name = format!("{}/{}", options.subject, options.queue_group);
        let mut listener = Listener::new(self.connection.clone(), handler, options);
        if let Some((sink, max)) = &self.dead_letter {
            listener = listener.with_dead_letter(Arc::clone(sink), *max);
        }
        if let Some(sink) = &self.escalation {
            listener = listener.with_escalation(Arc::clone(sink));
        }
        if let Some(delay) = self.retry_delay {
            listener = listener.with_retry_delay(delay);
        }

        info!(listener = %name, "Starting listener");
        let handle = listener.spawn(self.shutdown_tx.subscribe());
        self.handles.push((name, handle));
    }

    /// Run until `signal` completes, then shut down.
    ///
    /// # Errors
    ///
    /// Returns the bus error if closing the connection fails.
    pub async fn run_until<S>(self, signal: S) -> Result<CloseReport, BusError>
    where
        S: Future<Output = ()>,
    {
        info!(listeners = self.handles.len(), "Service running");
        signal.await;
        info!("Shutdown requested");
        self.shutdown().await
    }

    /// Stop every listener, then close the connection.
    ///
    /// # Errors
    ///
    /// Returns the bus error if closing the connection fails.
    pub async fn shutdown(self) -> Result<CloseReport, BusError> {
        let _ = self.shutdown_tx.send(());

        for (name, handle) in self.handles {
            match tokio::time::timeout(self.shutdown_timeout, handle).await {
                Ok(Ok(())) => info!(listener = %name, "Listener stopped gracefully"),
                Ok(Err(e)) => warn!(listener = %name, error = %e, "Listener task failed"),
                Err(_) => warn!(listener = %name, "Listener shutdown timed out"),
            }
        }

        let report = self.connection.close(self.shutdown_timeout).await?;
        info!(abandoned = report.abandoned, "Graceful shutdown complete");
        Ok(report)
    }
}
