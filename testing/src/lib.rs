//! # Ticketbus Testing
//!
//! In-memory fakes for the ticketing event bus.
//!
//! This crate provides:
//! - [`InMemoryBroker`]: durable queue groups, ack-wait redelivery and fault
//!   injection behind the [`EventBus`](ticketbus_core::event_bus::EventBus) trait
//! - [`InMemoryConnector`]: connector over a shared broker that can refuse attempts
//! - [`InMemoryAggregateStore`]: compare-and-swap store
//! - [`RecordingDeadLetterSink`]: dead-letter sink that keeps what it gets
//! - [`FixedClock`] and [`ManualClock`]: deterministic time
//!
//! ## Example
//!
//! ```ignore
//! use ticketbus_testing::{InMemoryBroker, InMemoryConnector};
//! use ticketbus_runtime::{BusConnection, ConnectionOptions};
//!
//! #[tokio::test]
//! async fn publishes_reach_the_broker() {
//!     let broker = InMemoryBroker::new();
//!     let connector = InMemoryConnector::new(broker.clone());
//!     let options = ConnectionOptions::new("ticketing", "test", "memory://");
//!     let connection = BusConnection::connect(&connector, &options).await.unwrap();
//!     // ...
//! }
//! ```

pub mod broker;
pub mod sinks;
pub mod store;

use chrono::{DateTime, Utc};
use ticketbus_core::clock::Clock;

/// Deterministic clocks.
pub mod mocks {
    #![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap on poisoned locks

    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, Mutex};

    /// Clock stuck at one instant. Expiry times computed from it are exact.
    ///
    /// # Example
    ///
    /// ```
    /// use ticketbus_testing::mocks::FixedClock;
    /// use ticketbus_core::clock::Clock;
    /// use chrono::Utc;
    ///
    /// let start = Utc::now();
    /// let clock = FixedClock::new(start);
    /// assert_eq!(clock.now(), start);
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Stop the clock at `time`.
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to. Clones share the same time.
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Start at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock forward.
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.lock().unwrap();
            *time += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap()
        }
    }

    /// [`FixedClock`] at 2025-01-01T00:00:00Z.
    ///
    /// # Panics
    ///
    /// Never: the timestamp is a constant.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("constant RFC 3339 timestamp")
                .with_timezone(&Utc),
        )
    }
}

// Re-export commonly used items
pub use broker::{InMemoryBroker, InMemoryConnector};
pub use mocks::{FixedClock, ManualClock, test_clock};
pub use sinks::RecordingDeadLetterSink;
pub use store::InMemoryAggregateStore;
