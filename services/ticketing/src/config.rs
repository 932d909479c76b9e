//! Configuration management for the ticketing services.
//!
//! Loads configuration from environment variables. Identity of the bus and
//! the database location are required; everything else has a default.

use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use ticketbus_core::event_bus::SubscriptionOptions;
use ticketbus_core::subject::Subject;
use ticketbus_runtime::{ConnectionOptions, OutOfOrderPolicy, RetryPolicy};

/// Configuration could not be loaded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required variable is not set.
    #[error("{0} must be defined")]
    Missing(&'static str),

    /// A variable is set to something unusable.
    #[error("{key}={value:?} is invalid: {reason}")]
    Invalid {
        /// Variable name
        key: &'static str,
        /// Raw value
        value: String,
        /// What is wrong with it
        reason: String,
    },
}

/// Which service the process runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    /// Ticket catalogue
    Tickets,
    /// Orders and ticket replica
    Orders,
    /// Order expiration timers
    Expiration,
    /// Charges and order replica
    Payments,
}

impl ServiceKind {
    /// Short name, used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tickets => "tickets",
            Self::Orders => "orders",
            Self::Expiration => "expiration",
            Self::Payments => "payments",
        }
    }

    /// Queue group used when `QUEUE_GROUP` is not set.
    #[must_use]
    pub const fn default_queue_group(self) -> &'static str {
        match self {
            Self::Tickets => "tickets-service",
            Self::Orders => "orders-service",
            Self::Expiration => "expiration-service",
            Self::Payments => "payments-service",
        }
    }
}

/// Settings of one service process.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Service this configuration is for
    pub service: ServiceKind,
    /// Bus URL (`BUS_URL`)
    pub bus_url: String,
    /// Bus cluster id (`BUS_CLUSTER_ID`)
    pub cluster_id: String,
    /// Client id, unique per process (`BUS_CLIENT_ID`)
    pub client_id: String,
    /// `PostgreSQL` URL (`DATABASE_URL`)
    pub database_url: String,
    /// Queue group and durable name of every listener (`QUEUE_GROUP`)
    pub queue_group: String,
    /// Redelivery delay for unacknowledged messages (`ACK_WAIT_SECS`)
    pub ack_wait: Duration,
    /// Broker acknowledgment timeout for publishes (`PUBLISH_TIMEOUT_SECS`)
    pub publish_timeout: Duration,
    /// Lifetime of an unpaid order (`EXPIRATION_WINDOW_SECS`)
    pub expiration_window: Duration,
    /// Connection attempts after the first (`CONNECT_MAX_RETRIES`)
    pub connect_max_retries: usize,
    /// Grace period for listeners and in-flight publishes (`SHUTDOWN_TIMEOUT_SECS`)
    pub shutdown_timeout: Duration,
    /// Dead-letter a message after this many deliveries
    /// (`DEAD_LETTER_MAX_DELIVERIES`, unset disables dead-lettering)
    pub dead_letter_max_deliveries: Option<u32>,
    /// Handling of replicated events that skip a version (`OUT_OF_ORDER_POLICY`)
    pub out_of_order: OutOfOrderPolicy,
    /// Pool size (`DATABASE_MAX_CONNECTIONS`)
    pub database_max_connections: u32,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a required variable is missing or any
    /// variable cannot be parsed.
    pub fn from_env(service: ServiceKind) -> Result<Self, ConfigError> {
        Self::from_lookup(service, |key| env::var(key).ok())
    }

    /// Load configuration through `lookup` instead of the process environment.
    ///
    /// # Errors
    ///
    /// As [`Config::from_env`].
    pub fn from_lookup<F>(service: ServiceKind, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);
        Ok(Self {
            service,
            bus_url: vars.required("BUS_URL")?,
            cluster_id: vars.required("BUS_CLUSTER_ID")?,
            client_id: vars.required("BUS_CLIENT_ID")?,
            database_url: vars.required("DATABASE_URL")?,
            queue_group: vars
                .get("QUEUE_GROUP")
                .unwrap_or_else(|| service.default_queue_group().to_string()),
            ack_wait: vars.seconds("ACK_WAIT_SECS", 5)?,
            publish_timeout: vars.seconds("PUBLISH_TIMEOUT_SECS", 5)?,
            expiration_window: vars.seconds("EXPIRATION_WINDOW_SECS", 15 * 60)?,
            connect_max_retries: vars.parsed("CONNECT_MAX_RETRIES")?.unwrap_or(5),
            shutdown_timeout: vars.seconds("SHUTDOWN_TIMEOUT_SECS", 10)?,
            dead_letter_max_deliveries: vars
                .parsed::<u32>("DEAD_LETTER_MAX_DELIVERIES")?
                .filter(|max| *max > 0),
            out_of_order: vars.parsed("OUT_OF_ORDER_POLICY")?.unwrap_or_default(),
            database_max_connections: vars.parsed("DATABASE_MAX_CONNECTIONS")?.unwrap_or(10),
        })
    }

    /// Bus connection options, retrying `connect_max_retries` times.
    #[must_use]
    pub fn connection_options(&self) -> ConnectionOptions {
        let retry = RetryPolicy::builder()
            .max_retries(self.connect_max_retries)
            .build();
        ConnectionOptions::new(&self.cluster_id, &self.client_id, &self.bus_url).with_retry(retry)
    }

    /// Durable, queue-grouped subscription to `subject`.
    #[must_use]
    pub fn subscription(&self, subject: Subject) -> SubscriptionOptions {
        SubscriptionOptions::new(subject, &self.queue_group).with_ack_wait(self.ack_wait)
    }

    /// Expiration window as a calendar duration.
    #[must_use]
    pub fn expiration_window(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.expiration_window).unwrap_or(chrono::Duration::MAX)
    }
}

struct Vars<F>(F);

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|value| !value.trim().is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.get(key).ok_or(ConfigError::Missing(key))
    }

    fn parsed<T>(&self, key: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|value| {
                value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                    key,
                    value: value.clone(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    fn seconds(&self, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
        Ok(Duration::from_secs(self.parsed(key)?.unwrap_or(default)))
    }
}
