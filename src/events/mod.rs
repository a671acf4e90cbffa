use std::sync::Arc;

use metrics::counter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::notifications::{LowStockAlert, LowStockNotifier, OrderMailer};

/// Post-commit notifications produced by the order engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    OrderCreated {
        order_id: Uuid,
        tracking_code: String,
        total_amount: Decimal,
    },
    /// Emitted only by the call that actually performed the paid transition.
    OrderPaid {
        order_id: Uuid,
        tracking_code: String,
        paid_amount: Decimal,
    },
    PaymentFailed {
        order_id: Uuid,
        code: Option<String>,
        message: Option<String>,
    },
    StockLow(LowStockAlert),
    OrderRefunded {
        order_id: Uuid,
        amount: Decimal,
        fully_refunded: bool,
    },
    OrderCancelled {
        order_id: Uuid,
        restocked: bool,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::OrderCreated { .. } => "order_created",
            Event::OrderPaid { .. } => "order_paid",
            Event::PaymentFailed { .. } => "payment_failed",
            Event::StockLow(_) => "stock_low",
            Event::OrderRefunded { .. } => "order_refunded",
            Event::OrderCancelled { .. } => "order_cancelled",
        }
    }
}

/// Sending half of the event channel; cheap to clone.
#[derive(Clone, Debug)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Bounded channel plus its sender.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    /// Never waits. A full or closed channel drops the event with a warning.
    pub fn publish(&self, event: Event) {
        let name = event.name();
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                counter!("storefront.events.dropped", 1, "event" => name);
                warn!(event = name, "Event channel full; dropping event");
            }
            Err(TrySendError::Closed(_)) => {
                counter!("storefront.events.dropped", 1, "event" => name);
                warn!(event = name, "Event channel closed; dropping event");
            }
        }
    }
}

/// Dispatches events to the collaborators.
///
/// Each delivery runs in its own task so a slow mail transport never holds up
/// the loop.
pub async fn process_events(
    mut rx: mpsc::Receiver<Event>,
    mailer: Arc<dyn OrderMailer>,
    low_stock: Arc<dyn LowStockNotifier>,
) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        let name = event.name();
        counter!("storefront.events.received", 1, "event" => name);

        let mailer = mailer.clone();
        let low_stock = low_stock.clone();
        tokio::spawn(async move {
            let result = match event {
                Event::OrderPaid {
                    order_id,
                    tracking_code,
                    paid_amount,
                } => {
                    mailer
                        .send_order_confirmation(order_id, &tracking_code, paid_amount)
                        .await
                }
                Event::OrderRefunded {
                    order_id,
                    amount,
                    fully_refunded,
                } => mailer.send_refund_notice(order_id, amount, fully_refunded).await,
                Event::OrderCancelled { order_id, .. } => {
                    mailer.send_cancellation_notice(order_id).await
                }
                Event::StockLow(alert) => low_stock.notify_low_stock(&alert).await,
                Event::OrderCreated { order_id, .. } => {
                    info!(order_id = %order_id, "Order created");
                    Ok(())
                }
                Event::PaymentFailed {
                    order_id,
                    code,
                    message,
                } => {
                    warn!(order_id = %order_id, code = ?code, message = ?message, "Payment failed");
                    Ok(())
                }
            };

            if let Err(e) = result {
                counter!("storefront.events.handler_error", 1, "event" => name);
                error!(event = name, error = %e, "Event handler failed");
            }
        });
    }

    info!("Event processing loop stopped");
}
