//! Expiration service: turns `order:created` into a delayed
//! `expiration:complete`.
//!
//! Jobs live in this process. The `order:created` message is acknowledged as
//! soon as its job is scheduled, so a restart loses the pending jobs; orders
//! whose job was lost stay open until cancelled by their buyer.
//!
//! A job that still cannot publish after its retries is reported through the
//! [`EscalationSink`]: the order stays open and the message that scheduled it
//! is already acknowledged, so nothing else would surface it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use ticketbus_core::clock::Clock;
use ticketbus_core::events::{ExpirationComplete, OrderCreated};
use ticketbus_core::subject::Subject;
use ticketbus_runtime::{
    EscalationSink, EventHandler, HandlerFuture, MessageContext, OperatorAlert, PublishError,
    Publisher, RetryPolicy, TracingEscalation, retry_with_predicate,
};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// `order:created`: schedule the expiration of the order.
#[derive(Clone)]
pub struct ExpirationScheduler {
    publisher: Publisher,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    escalation: Arc<dyn EscalationSink>,
    queue_group: String,
    scheduled: Arc<Mutex<HashSet<String>>>,
}

impl std::fmt::Debug for ExpirationScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpirationScheduler")
            .field("publisher", &self.publisher)
            .field("retry", &self.retry)
            .field("queue_group", &self.queue_group)
            .finish_non_exhaustive()
    }
}

impl ExpirationScheduler {
    /// Scheduler measuring delays against `clock`.
    #[must_use]
    pub fn new(publisher: Publisher, clock: Arc<dyn Clock>) -> Self {
        Self {
            publisher,
            clock,
            retry: RetryPolicy::default(),
            escalation: Arc::new(TracingEscalation),
            queue_group: "expiration-service".to_string(),
            scheduled: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Backoff for publishing `expiration:complete`.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Report jobs that exhaust their retries to `sink`, naming `queue_group`
    /// in the alert.
    #[must_use]
    pub fn with_escalation(
        mut self,
        sink: Arc<dyn EscalationSink>,
        queue_group: impl Into<String>,
    ) -> Self {
        self.escalation = sink;
        self.queue_group = queue_group.into();
        self
    }

    /// Number of jobs waiting to fire.
    pub async fn pending(&self) -> usize {
        self.scheduled.lock().await.len()
    }

    /// Time left until `event` expires, clamped at zero.
    #[must_use]
    pub fn delay_for(&self, event: &OrderCreated) -> Duration {
        (event.expires_at - self.clock.now())
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Schedule the job for `event`, delivered with `context`. Returns
    /// `false` if one is already pending.
    pub async fn schedule(&self, event: &OrderCreated, context: &MessageContext) -> bool {
        if !self.scheduled.lock().await.insert(event.id.clone()) {
            return false;
        }

        let delay = self.delay_for(event);
        let order_id = event.id.clone();
        let publisher = self.publisher.clone();
        let retry = self.retry.clone();
        let scheduled = Arc::clone(&self.scheduled);
        let escalation = Arc::clone(&self.escalation);
        let clock = Arc::clone(&self.clock);
        let queue_group = self.queue_group.clone();
        let context = context.clone();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let expired = ExpirationComplete {
                order_id: order_id.clone(),
            };
            let published = retry_with_predicate(
                &retry,
                || publisher.publish(&expired),
                PublishError::is_retryable,
            )
            .await;
            match published {
                Ok(correlation_id) => {
                    metrics::counter!("ticketbus.expiration.published").increment(1);
                    info!(order_id = %order_id, %correlation_id, "Order expiration published");
                }
                Err(e) => {
                    metrics::counter!("ticketbus.expiration.failed").increment(1);
                    error!(order_id = %order_id, error = %e, "Failed to publish order expiration");
                    escalation.escalate(OperatorAlert {
                        subject: Subject::ExpirationComplete,
                        queue_group,
                        sequence: context.sequence,
                        attempt: context.attempt,
                        correlation_id: context.correlation_id,
                        error: format!("expiration of order {order_id} not published: {e}"),
                        raised_at: clock.now(),
                    });
                }
            }
            scheduled.lock().await.remove(&order_id);
        });

        metrics::counter!("ticketbus.expiration.scheduled").increment(1);
        debug!(order_id = %event.id, delay_ms = delay.as_millis(), "Expiration scheduled");
        true
    }
}

impl EventHandler for ExpirationScheduler {
    type Event = OrderCreated;

    fn handle<'a>(
        &'a self,
        event: OrderCreated,
        context: &'a MessageContext,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            if !self.schedule(&event, context).await {
                debug!(order_id = %event.id, "Expiration already scheduled");
            }
            Ok(())
        })
    }
}
