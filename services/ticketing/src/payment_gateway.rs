//! Payment provider seam.
//!
//! The payments service charges through [`PaymentGateway`]. Production would
//! put a Stripe client behind it; [`MockPaymentGateway`] accepts every
//! charge except the test token `tok_declined`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Payment gateway result
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Boxed future returned by [`PaymentGateway`] methods.
pub type GatewayFuture<'a, T> = Pin<Box<dyn Future<Output = GatewayResult<T>> + Send + 'a>>;

/// Payment gateway error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Card declined
    #[error("Card declined: {reason}")]
    CardDeclined {
        /// Decline reason
        reason: String,
    },
    /// Malformed or unknown payment token
    #[error("Invalid payment token: {reason}")]
    InvalidToken {
        /// Invalid reason
        reason: String,
    },
    /// Provider unreachable or too slow
    #[error("Gateway timeout")]
    Timeout,
}

/// A settled charge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Charge {
    /// Provider-side charge id
    pub id: String,
    /// Amount in minor currency units
    pub amount: u64,
}

/// Abstraction over payment processors.
pub trait PaymentGateway: Send + Sync {
    /// Charge `amount` to the card behind `token`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] if the charge is refused or the provider fails.
    fn charge<'a>(&'a self, token: &'a str, amount: u64) -> GatewayFuture<'a, Charge>;
}

/// Mock payment gateway for development and tests.
#[derive(Clone, Debug, Default)]
pub struct MockPaymentGateway;

impl MockPaymentGateway {
    /// Token the mock always declines.
    pub const DECLINED_TOKEN: &'static str = "tok_declined";

    /// Creates a new mock payment gateway
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Creates an Arc-wrapped instance for sharing
    #[must_use]
    pub fn shared() -> Arc<dyn PaymentGateway> {
        Arc::new(Self::new())
    }
}

impl PaymentGateway for MockPaymentGateway {
    fn charge<'a>(&'a self, token: &'a str, amount: u64) -> GatewayFuture<'a, Charge> {
        Box::pin(async move {
            if token.trim().is_empty() {
                return Err(GatewayError::InvalidToken {
                    reason: "token is empty".to_string(),
                });
            }
            if token == Self::DECLINED_TOKEN {
                return Err(GatewayError::CardDeclined {
                    reason: "test card declined".to_string(),
                });
            }

            let id = format!("ch_mock_{}", uuid::Uuid::new_v4().simple());
            tracing::info!(charge_id = %id, amount, "Mock charge processed");
            Ok(Charge { id, amount })
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Tests can unwrap
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_charges_valid_tokens() {
        let charge = MockPaymentGateway::new().charge("tok_visa", 2000).await.unwrap();
        assert_eq!(charge.amount, 2000);
        assert!(charge.id.starts_with("ch_mock_"));
    }

    #[tokio::test]
    async fn mock_declines_the_test_token() {
        let result = MockPaymentGateway::new()
            .charge(MockPaymentGateway::DECLINED_TOKEN, 2000)
            .await;
        assert!(matches!(result, Err(GatewayError::CardDeclined { .. })));
    }

    #[tokio::test]
    async fn mock_rejects_empty_tokens() {
        let result = MockPaymentGateway::new().charge(" ", 2000).await;
        assert!(matches!(result, Err(GatewayError::InvalidToken { .. })));
    }
}
