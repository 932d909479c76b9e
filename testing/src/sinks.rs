//! Recording sinks for dead letters.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap on poisoned locks

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use ticketbus_core::dead_letter::{DeadLetter, DeadLetterError, DeadLetterSink};

/// Keeps every dead letter in memory; can be told to fail writes.
#[derive(Debug, Clone, Default)]
pub struct RecordingDeadLetterSink {
    letters: Arc<Mutex<Vec<DeadLetter>>>,
    failing: Arc<Mutex<bool>>,
}

impl RecordingDeadLetterSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    /// Letters recorded so far.
    #[must_use]
    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().unwrap().clone()
    }
}

impl DeadLetterSink for RecordingDeadLetterSink {
    fn record(
        &self,
        letter: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>> {
        Box::pin(async move {
            if *self.failing.lock().unwrap() {
                return Err(DeadLetterError("recording sink set to fail".to_string()));
            }
            self.letters.lock().unwrap().push(letter);
            Ok(())
        })
    }
}
