//! Outbound notification collaborators.
//!
//! Mail rendering and delivery transport live outside this crate; the engine
//! only calls these traits, always after its database transaction commits.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Delivery failed: {0}")]
    Delivery(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A stock row crossed its low-stock threshold on the way down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LowStockAlert {
    pub product_id: Uuid,
    pub product_name: String,
    /// `None` when the product aggregate crossed the threshold
    pub variant_key: Option<String>,
    pub previous_stock: i32,
    pub new_stock: i32,
    pub threshold: i32,
}

impl LowStockAlert {
    /// `previous > threshold >= new`
    pub fn crossed(previous_stock: i32, new_stock: i32, threshold: i32) -> bool {
        previous_stock > threshold && threshold >= new_stock
    }
}

/// Customer-facing order mail.
#[async_trait]
pub trait OrderMailer: Send + Sync {
    async fn send_order_confirmation(
        &self,
        order_id: Uuid,
        tracking_code: &str,
        paid_amount: Decimal,
    ) -> Result<(), NotificationError>;

    async fn send_refund_notice(
        &self,
        order_id: Uuid,
        amount: Decimal,
        fully_refunded: bool,
    ) -> Result<(), NotificationError>;

    async fn send_cancellation_notice(&self, order_id: Uuid) -> Result<(), NotificationError>;
}

/// Operator alert for low inventory.
#[async_trait]
pub trait LowStockNotifier: Send + Sync {
    async fn notify_low_stock(&self, alert: &LowStockAlert) -> Result<(), NotificationError>;
}

/// Default collaborator that only logs.
#[derive(Debug, Clone, Default)]
pub struct TracingNotifier;

#[async_trait]
impl OrderMailer for TracingNotifier {
    #[instrument(skip(self))]
    async fn send_order_confirmation(
        &self,
        order_id: Uuid,
        tracking_code: &str,
        paid_amount: Decimal,
    ) -> Result<(), NotificationError> {
        info!(order_id = %order_id, tracking_code, paid_amount = %paid_amount, "Order confirmation");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn send_refund_notice(
        &self,
        order_id: Uuid,
        amount: Decimal,
        fully_refunded: bool,
    ) -> Result<(), NotificationError> {
        info!(order_id = %order_id, amount = %amount, fully_refunded, "Refund notice");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn send_cancellation_notice(&self, order_id: Uuid) -> Result<(), NotificationError> {
        info!(order_id = %order_id, "Cancellation notice");
        Ok(())
    }
}

#[async_trait]
impl LowStockNotifier for TracingNotifier {
    async fn notify_low_stock(&self, alert: &LowStockAlert) -> Result<(), NotificationError> {
        warn!(
            product_id = %alert.product_id,
            product = %alert.product_name,
            variant_key = ?alert.variant_key,
            previous_stock = alert.previous_stock,
            new_stock = alert.new_stock,
            threshold = alert.threshold,
            "Stock is running low"
        );
        Ok(())
    }
}
