//! Hosted-checkout gateway port.
//!
//! The adapter only speaks the gateway's request/response contract. It never
//! decides whether an order is paid, never touches the database and never
//! retries; those policies belong to the finalization engine and the sweeper.

pub mod iyzico;
pub mod types;

use async_trait::async_trait;

pub use iyzico::IyzicoGateway;
pub use types::{
    BasketItem, CancelRequest, CheckoutSession, GatewayAddress, GatewayBuyer, GatewayRefund,
    InitiateRequest, PaymentItem, PaymentRetrieval, RefundByPaymentIdRequest, RefundRequest,
};

/// Transport-level and contract-level gateway failures.
///
/// A refund the gateway declines is *not* an error: it comes back as
/// `GatewayRefund { success: false, .. }`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("could not decode response: {0}")]
    Decode(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("gateway not configured: {0}")]
    NotConfigured(String),

    #[error("gateway rejected request ({}): {message}", code.as_deref().unwrap_or("-"))]
    Rejected {
        code: Option<String>,
        message: String,
        group: Option<String>,
    },
}

/// Checkout gateway operations used by the order engine.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CheckoutGateway: Send + Sync {
    /// Starts a hosted checkout session.
    async fn initiate(&self, request: &InitiateRequest) -> Result<CheckoutSession, GatewayError>;

    /// Authoritative status of a checkout session.
    async fn retrieve_by_token(&self, token: &str) -> Result<PaymentRetrieval, GatewayError>;

    async fn retrieve_by_payment_id(
        &self,
        payment_id: &str,
    ) -> Result<PaymentRetrieval, GatewayError>;

    /// Refunds part of one basket transaction.
    async fn refund(&self, request: &RefundRequest) -> Result<GatewayRefund, GatewayError>;

    /// Cancels a whole payment; only possible on the day it was taken.
    async fn cancel(&self, request: &CancelRequest) -> Result<GatewayRefund, GatewayError>;

    /// Refund keyed by payment id rather than basket transaction.
    async fn refund_by_payment_id(
        &self,
        request: &RefundByPaymentIdRequest,
    ) -> Result<GatewayRefund, GatewayError>;
}
