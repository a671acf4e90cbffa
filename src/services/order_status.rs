use crate::entities::order::{Model as OrderModel, OrderStatus, PaymentStatus};
use crate::errors::ServiceError;

/// Order status transition table.
///
/// Same-state transitions are allowed (idempotent writes); terminal states only
/// map to themselves.
pub fn is_valid_transition(from: OrderStatus, to: OrderStatus) -> bool {
    use OrderStatus::*;

    match from {
        Pending => matches!(to, Pending | Shipped | Completed | Cancelled),
        Shipped => matches!(to, Shipped | Completed),
        Completed => matches!(to, Completed),
        Cancelled => matches!(to, Cancelled),
    }
}

/// Checks a requested status change against the current order row.
///
/// A fully refunded payment freezes the order status entirely, even for
/// same-state writes.
pub fn check_transition(order: &OrderModel, to: OrderStatus) -> Result<(), ServiceError> {
    if order.payment_status == PaymentStatus::Refunded {
        return Err(ServiceError::StatusLocked);
    }
    if !is_valid_transition(order.status, to) {
        return Err(ServiceError::InvalidStatusTransition {
            from: order.status.to_string(),
            to: to.to_string(),
        });
    }
    Ok(())
}
