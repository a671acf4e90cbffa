pub mod order;
pub mod order_item;
pub mod order_payment_event;
pub mod order_refund;
pub mod product;
pub mod product_stock_event;
pub mod product_variant;

pub use order::{OrderStatus, PaymentStatus};
pub use order_refund::RefundStatus;
