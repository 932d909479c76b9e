//! Process-wide connection to the event bus.
//!
//! A [`BusConnection`] is created once at startup through a [`Connector`] and
//! then handed (cloned) to every [`Publisher`](crate::Publisher) and
//! [`Listener`](crate::Listener). It is the only owner of the underlying
//! [`EventBus`] handle.
//!
//! # Lifecycle
//!
//! ```text
//! connect() ──retry/backoff──▶ open ──close()──▶ closing ──drained or timeout──▶ closed
//!                               │                  │
//!                           publishes          new publishes fail with Closed,
//!                           tracked            in-flight ones may settle
//! ```

use crate::retry::{RetryPolicy, retry_with_backoff};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use ticketbus_core::event_bus::{BusError, BusFuture, EventBus};
use tokio::sync::Notify;

/// Errors raised while establishing the connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Every connection attempt failed.
    #[error("Event bus at '{url}' unreachable after {attempts} attempts: {reason}")]
    Unreachable {
        /// Bus URL
        url: String,
        /// Attempts made
        attempts: usize,
        /// Error of the last attempt
        reason: String,
    },

    /// Options are unusable (empty identifiers or URL).
    #[error("Invalid connection options: {0}")]
    InvalidOptions(String),
}

/// Identity and location of the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionOptions {
    /// Bus cluster identifier
    pub cluster_id: String,
    /// Client identifier, unique per process instance
    pub client_id: String,
    /// Bus URL (broker list for Kafka-protocol buses)
    pub url: String,
    /// Backoff applied to failed connection attempts
    pub retry: RetryPolicy,
}

impl ConnectionOptions {
    /// Options with the default retry policy.
    #[must_use]
    pub fn new(
        cluster_id: impl Into<String>,
        client_id: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            client_id: client_id.into(),
            url: url.into(),
            retry: RetryPolicy::default(),
        }
    }

    /// Override the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn validate(&self) -> Result<(), ConnectionError> {
        for (name, value) in [
            ("cluster_id", &self.cluster_id),
            ("client_id", &self.client_id),
            ("url", &self.url),
        ] {
            if value.trim().is_empty() {
                return Err(ConnectionError::InvalidOptions(format!("{name} is empty")));
            }
        }
        Ok(())
    }
}

/// Something that can open an [`EventBus`].
pub trait Connector: Send + Sync {
    /// Attempt a single connection.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ConnectionFailed`] if the bus cannot be reached.
    fn connect<'a>(&'a self, options: &'a ConnectionOptions) -> BusFuture<'a, Arc<dyn EventBus>>;
}

/// Result of [`BusConnection::close`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CloseReport {
    /// Publishes still in flight when the drain timeout expired
    pub abandoned: usize,
}

struct Inner {
    bus: Arc<dyn EventBus>,
    client_id: String,
    closing: AtomicBool,
    closed: AtomicBool,
    in_flight: AtomicUsize,
    settled: Notify,
}

/// Shared handle to the process-wide bus connection.
#[derive(Clone)]
pub struct BusConnection {
    inner: Arc<Inner>,
}

impl fmt::Debug for BusConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusConnection")
            .field("client_id", &self.inner.client_id)
            .field("closing", &self.is_closing())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

impl BusConnection {
    /// Connect, retrying with backoff.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::InvalidOptions`] if an identifier or the URL is empty
    /// - [`ConnectionError::Unreachable`] once the retry policy is exhausted;
    ///   process startup treats this as fatal
    pub async fn connect(
        connector: &dyn Connector,
        options: &ConnectionOptions,
    ) -> Result<Self, ConnectionError> {
        options.validate()?;

        tracing::info!(
            cluster_id = %options.cluster_id,
            client_id = %options.client_id,
            url = %options.url,
            "Connecting to event bus"
        );

        let attempts = AtomicUsize::new(0);
        let bus = retry_with_backoff(&options.retry, || {
            attempts.fetch_add(1, Ordering::Relaxed);
            connector.connect(options)
        })
        .await
        .map_err(|e| ConnectionError::Unreachable {
            url: options.url.clone(),
            attempts: attempts.load(Ordering::Relaxed),
            reason: e.to_string(),
        })?;

        tracing::info!(client_id = %options.client_id, "Connected to event bus");
        Ok(Self::from_bus(bus, options.client_id.clone()))
    }

    /// Wrap an already open bus.
    #[must_use]
    pub fn from_bus(bus: Arc<dyn EventBus>, client_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                bus,
                client_id: client_id.into(),
                closing: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                settled: Notify::new(),
            }),
        }
    }

    /// The underlying bus.
    #[must_use]
    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.inner.bus
    }

    /// Client identifier of this process.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Whether [`close`](Self::close) has started.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst)
    }

    /// Number of publishes currently awaiting a broker ack.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Register a publish. The returned permit must live until the publish settles.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Closed`] once the connection is closing.
    pub fn begin_publish(&self) -> Result<InFlightPublish, BusError> {
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let permit = InFlightPublish {
            inner: Arc::clone(&self.inner),
        };
        if self.is_closing() {
            return Err(BusError::Closed);
        }
        Ok(permit)
    }

    /// Stop accepting publishes, let in-flight ones settle for up to
    /// `drain_timeout`, then close the bus. Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the bus error if the underlying close fails.
    pub async fn close(&self, drain_timeout: Duration) -> Result<CloseReport, BusError> {
        self.inner.closing.store(true, Ordering::SeqCst);
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(CloseReport::default());
        }

        tracing::info!(
            client_id = %self.inner.client_id,
            in_flight = self.in_flight(),
            "Closing event bus connection"
        );

        let drained = tokio::time::timeout(drain_timeout, async {
            loop {
                let settled = self.inner.settled.notified();
                if self.in_flight() == 0 {
                    break;
                }
                settled.await;
            }
        })
        .await;

        let abandoned = if drained.is_ok() { 0 } else { self.in_flight() };
        if abandoned > 0 {
            tracing::warn!(
                abandoned,
                "Drain timeout expired, abandoning in-flight publishes"
            );
        }

        self.inner.bus.close().await?;
        tracing::info!(client_id = %self.inner.client_id, "Event bus connection closed");
        Ok(CloseReport { abandoned })
    }
}

/// RAII permit for one in-flight publish.
#[derive(Debug)]
#[must_use = "dropping the permit marks the publish as settled"]
pub struct InFlightPublish {
    inner: Arc<Inner>,
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inner")
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl Drop for InFlightPublish {
    fn drop(&mut self) {
        if self.inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.settled.notify_one();
        }
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
///
/// If a signal handler cannot be installed the failure is logged and that
/// signal is ignored.
pub async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }
}
