use http::StatusCode;
use rust_decimal::Decimal;
use sea_orm::error::DbErr;
use serde::Serialize;
use uuid::Uuid;

use crate::gateway::GatewayError;

/// Reasons a refund request is turned away before or after talking to the gateway.
///
/// The `code()` strings are what admin tooling keys its messages on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RefundRejection {
    /// Order payment is not in a refundable state.
    Status(String),
    /// No gateway payment id was ever persisted for the order.
    MissingPaymentId,
    /// Nothing left to refund.
    AlreadyRefunded,
    /// Requested amount exceeds the remaining refundable balance.
    TooMuch { requested: Decimal, remaining: Decimal },
    /// Gateway declined every refund attempt.
    NotRefundable(String),
}

impl RefundRejection {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Status(_) => "status",
            Self::MissingPaymentId => "missing_payment_id",
            Self::AlreadyRefunded => "already_refunded",
            Self::TooMuch { .. } => "too_much",
            Self::NotRefundable(_) => "iyzico_not_refundable",
        }
    }

    /// Short human text shown to an admin performing the refund.
    pub fn admin_message(&self) -> String {
        match self {
            Self::Status(status) => {
                format!("Order cannot be refunded while payment is '{}'", status)
            }
            Self::MissingPaymentId => "Order has no payment reference to refund".to_string(),
            Self::AlreadyRefunded => "Order has already been fully refunded".to_string(),
            Self::TooMuch {
                requested,
                remaining,
            } => format!(
                "Requested {} exceeds the refundable balance of {}",
                requested, remaining
            ),
            Self::NotRefundable(reason) => {
                format!("Payment provider declined the refund: {}", reason)
            }
        }
    }
}

impl std::fmt::Display for RefundRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.admin_message())
    }
}

/// Coarse error classes; callers decide retry and alerting policy from these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Validation,
    Conflict,
    Security,
    Gateway,
    Integrity,
    NotFound,
    Internal,
}

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        DbErr,
    ),

    #[error("Gateway error: {0}")]
    Gateway(
        #[from]
        #[serde(skip)]
        GatewayError,
    ),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Cart is empty")]
    EmptyCart,

    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    #[error("Product unavailable: {0}")]
    ProductUnavailable(Uuid),

    #[error("Shipping address is required")]
    AddressRequired,

    #[error("Size selection is required")]
    MissingSize,

    #[error("Color selection is required")]
    MissingColor,

    #[error("Invalid size: {0}")]
    InvalidSize(String),

    #[error("Invalid color: {0}")]
    InvalidColor(String),

    #[error("Insufficient stock: {0}")]
    InsufficientStock(String),

    #[error("Invalid status transition from '{from}' to '{to}'")]
    InvalidStatusTransition { from: String, to: String },

    #[error("Order status is locked after a full refund")]
    StatusLocked,

    #[error("Invalid payment state: {0}")]
    InvalidState(String),

    #[error("A refund is already in progress for order {0}")]
    RefundInProgress(Uuid),

    #[error("Nothing to refund")]
    NothingToRefund,

    #[error("Order balance was not fully refunded; remaining {0}")]
    NotRefunded(Decimal),

    #[error("Refund rejected: {0}")]
    RefundRejected(RefundRejection),

    #[error("Payment token does not match order {0}")]
    TokenMismatch(Uuid),

    #[error("Paid amount {actual} does not match order total {expected}")]
    AmountMismatch { expected: Decimal, actual: Decimal },

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(
        #[from]
        #[serde(skip)]
        anyhow::Error,
    ),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::SerializationError(err.to_string())
    }
}

impl ServiceError {
    /// Wraps any database error input.
    pub fn db_error(error: DbErr) -> Self {
        ServiceError::DatabaseError(error)
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DatabaseError(_) => "DATABASE_ERROR",
            Self::Gateway(_) => "GATEWAY_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::OrderNotFound(_) => "ORDER_NOT_FOUND",
            Self::ValidationError(_) => "VALIDATION_ERROR",
            Self::EmptyCart => "EMPTY_CART",
            Self::InvalidQuantity(_) => "INVALID_QUANTITY",
            Self::ProductUnavailable(_) => "PRODUCT_UNAVAILABLE",
            Self::AddressRequired => "ADDRESS_REQUIRED",
            Self::MissingSize => "MISSING_SIZE",
            Self::MissingColor => "MISSING_COLOR",
            Self::InvalidSize(_) => "INVALID_SIZE",
            Self::InvalidColor(_) => "INVALID_COLOR",
            Self::InsufficientStock(_) => "INSUFFICIENT_STOCK",
            Self::InvalidStatusTransition { .. } => "INVALID_STATUS_TRANSITION",
            Self::StatusLocked => "STATUS_LOCKED",
            Self::InvalidState(_) => "INVALID_STATE",
            Self::RefundInProgress(_) => "REFUND_IN_PROGRESS",
            Self::NothingToRefund => "NOTHING_TO_REFUND",
            Self::NotRefunded(_) => "NOT_REFUNDED",
            Self::RefundRejected(_) => "REFUND_REJECTED",
            Self::TokenMismatch(_) => "TOKEN_MISMATCH",
            Self::AmountMismatch { .. } => "AMOUNT_MISMATCH",
            Self::SerializationError(_) => "SERIALIZATION_ERROR",
            Self::InternalError(_) | Self::Other(_) => "INTERNAL_ERROR",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::ValidationError(_)
            | Self::EmptyCart
            | Self::InvalidQuantity(_)
            | Self::AddressRequired
            | Self::MissingSize
            | Self::MissingColor
            | Self::InvalidSize(_)
            | Self::InvalidColor(_) => ErrorClass::Validation,
            Self::ProductUnavailable(_)
            | Self::InsufficientStock(_)
            | Self::InvalidStatusTransition { .. }
            | Self::StatusLocked
            | Self::InvalidState(_)
            | Self::RefundInProgress(_)
            | Self::NothingToRefund
            | Self::NotRefunded(_)
            | Self::RefundRejected(_) => ErrorClass::Conflict,
            Self::TokenMismatch(_) | Self::AmountMismatch { .. } => ErrorClass::Security,
            Self::Gateway(_) => ErrorClass::Gateway,
            Self::NotFound(_) | Self::OrderNotFound(_) => ErrorClass::NotFound,
            Self::DatabaseError(_)
            | Self::SerializationError(_)
            | Self::InternalError(_)
            | Self::Other(_) => ErrorClass::Internal,
        }
    }

    /// Whether a caller may simply try again later without changing anything.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RefundInProgress(_) | Self::InvalidState(_) | Self::Gateway(_)
        )
    }

    /// HTTP status a controller should answer with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::StatusLocked
            | Self::InvalidStatusTransition { .. }
            | Self::InvalidState(_)
            | Self::RefundInProgress(_) => StatusCode::CONFLICT,
            Self::InsufficientStock(_)
            | Self::ProductUnavailable(_)
            | Self::NothingToRefund
            | Self::NotRefunded(_)
            | Self::RefundRejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::TokenMismatch(_) | Self::AmountMismatch { .. } => StatusCode::PAYMENT_REQUIRED,
            _ => match self.class() {
                ErrorClass::Validation => StatusCode::BAD_REQUEST,
                ErrorClass::NotFound => StatusCode::NOT_FOUND,
                ErrorClass::Gateway => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    /// Message safe to return to a caller; internal errors stay generic.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::SerializationError(_) | Self::InternalError(_) | Self::Other(_) => {
                "Internal server error".to_string()
            }
            Self::Gateway(_) => "Payment provider unavailable".to_string(),
            Self::RefundRejected(rejection) => rejection.admin_message(),
            _ => self.to_string(),
        }
    }
}
