mod common;

use assert_matches::assert_matches;
use rust_decimal_macros::dec;
use serde_json::json;
use uuid::Uuid;

use common::{address, buyer, TestEngine};
use storefront_orders::{
    common::Actor,
    entities::{OrderStatus, PaymentStatus},
    events::Event,
    services::orders::CartLine,
    ServiceError,
};

#[tokio::test]
async fn create_order_prices_from_catalog_and_starts_pending() {
    let mut engine = TestEngine::new().await;
    let tee = engine.seed_plain_product(dec!(50.00), 10).await;

    let created = engine.place_order(vec![CartLine::new(tee.id, 3)]).await;

    assert_eq!(created.total_amount, dec!(150.00));
    assert!(created.tracking_code.starts_with("TRK-"));

    let order = engine.order(created.order_id).await;
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.payment_status, PaymentStatus::Pending);
    assert_eq!(order.refunded_amount, dec!(0));
    assert!(order.payment_token.is_none());

    let lines = engine.orders.order_lines(created.order_id).await.unwrap();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].price_at_purchase, dec!(50.00));
    assert_eq!(lines[0].line_total(), dec!(150.00));

    // Stock is untouched until payment
    assert_eq!(engine.product(tee.id).await.stock, 10);

    let history = engine.payment_events(created.order_id).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].payment_status, PaymentStatus::Pending);

    let events = engine.drain_events();
    assert_matches!(events.as_slice(), [Event::OrderCreated { total_amount, .. }] if *total_amount == dec!(150.00));
}

#[tokio::test]
async fn variant_price_override_wins() {
    let engine = TestEngine::new().await;
    let tee = engine
        .seed_product(dec!(40.00), 20, json!(["S", "M"]), json!(["red"]), false)
        .await;
    engine.seed_variant(tee.id, "S", "red", 5, None).await;
    engine.seed_variant(tee.id, "M", "red", 5, Some(dec!(45.50))).await;

    let created = engine
        .place_order(vec![
            CartLine::new(tee.id, 1).with_size("S"),
            CartLine::new(tee.id, 2).with_size("M"),
        ])
        .await;

    // Single color is picked automatically
    assert_eq!(created.total_amount, dec!(131.00));
    let lines = engine.orders.order_lines(created.order_id).await.unwrap();
    assert!(lines.iter().all(|l| l.selected_color == "red"));
}

#[tokio::test]
async fn create_order_validation_order() {
    let engine = TestEngine::new().await;
    let tee = engine.seed_plain_product(dec!(10.00), 1).await;

    let empty = engine
        .orders
        .create_order_from_cart(vec![], None, buyer())
        .await;
    assert_matches!(empty, Err(ServiceError::EmptyCart));

    let no_address = engine
        .orders
        .create_order_from_cart(vec![CartLine::new(tee.id, 1)], None, buyer())
        .await;
    assert_matches!(no_address, Err(ServiceError::AddressRequired));

    let bad_qty = engine
        .orders
        .create_order_from_cart(vec![CartLine::new(tee.id, 0)], Some(address()), buyer())
        .await;
    assert_matches!(bad_qty, Err(ServiceError::InvalidQuantity(_)));

    let unknown = engine
        .orders
        .create_order_from_cart(vec![CartLine::new(Uuid::new_v4(), 1)], Some(address()), buyer())
        .await;
    assert_matches!(unknown, Err(ServiceError::ProductUnavailable(_)));

    let short = engine
        .orders
        .create_order_from_cart(vec![CartLine::new(tee.id, 2)], Some(address()), buyer())
        .await;
    assert_matches!(short, Err(ServiceError::InsufficientStock(_)));
}

#[tokio::test]
async fn demand_is_aggregated_per_pool() {
    let engine = TestEngine::new().await;
    let tee = engine.seed_plain_product(dec!(10.00), 3).await;

    // Two lines of 2 on a product with 3 in stock
    let result = engine
        .orders
        .create_order_from_cart(
            vec![CartLine::new(tee.id, 2), CartLine::new(tee.id, 2)],
            Some(address()),
            buyer(),
        )
        .await;
    assert_matches!(result, Err(ServiceError::InsufficientStock(_)));
}

#[tokio::test]
async fn missing_and_invalid_selection_are_rejected() {
    let engine = TestEngine::new().await;
    let tee = engine
        .seed_product(dec!(30.00), 10, json!(["S", "M"]), json!(["red", "blue"]), false)
        .await;

    let missing = engine
        .orders
        .create_order_from_cart(
            vec![CartLine::new(tee.id, 1).with_color("red")],
            Some(address()),
            buyer(),
        )
        .await;
    assert_matches!(missing, Err(ServiceError::MissingSize));

    let invalid = engine
        .orders
        .create_order_from_cart(
            vec![CartLine::new(tee.id, 1).with_size("S").with_color("green")],
            Some(address()),
            buyer(),
        )
        .await;
    assert_matches!(invalid, Err(ServiceError::InvalidColor(c)) if c == "green");
}

#[tokio::test]
async fn status_table_is_enforced() {
    let engine = TestEngine::new().await;
    let tee = engine.seed_plain_product(dec!(10.00), 5).await;
    let created = engine.place_order(vec![CartLine::new(tee.id, 1)]).await;
    let admin = Actor::Admin(Uuid::new_v4());

    let shipped = engine
        .orders
        .update_order_status(created.order_id, OrderStatus::Shipped, admin)
        .await
        .unwrap();
    assert_eq!(shipped.status, OrderStatus::Shipped);

    // Same-state write is a no-op
    let again = engine
        .orders
        .update_order_status(created.order_id, OrderStatus::Shipped, admin)
        .await
        .unwrap();
    assert_eq!(again.status, OrderStatus::Shipped);

    let back = engine
        .orders
        .update_order_status(created.order_id, OrderStatus::Pending, admin)
        .await;
    assert_matches!(back, Err(ServiceError::InvalidStatusTransition { .. }));

    let cancel = engine.orders.cancel_order(created.order_id, admin).await;
    assert_matches!(cancel, Err(ServiceError::InvalidStatusTransition { .. }));
}

#[tokio::test]
async fn cancelling_an_unpaid_order_restocks_nothing() {
    let mut engine = TestEngine::new().await;
    let tee = engine.seed_plain_product(dec!(10.00), 5).await;
    let created = engine.place_order(vec![CartLine::new(tee.id, 2)]).await;
    engine.drain_events();

    let cancelled = engine
        .orders
        .cancel_order(created.order_id, Actor::Customer(Uuid::new_v4()))
        .await
        .unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(engine.product(tee.id).await.stock, 5);
    assert!(engine.stock_events(created.order_id).await.is_empty());

    let events = engine.drain_events();
    assert_matches!(events.as_slice(), [Event::OrderCancelled { restocked: false, .. }]);
}

#[tokio::test]
async fn tracking_code_lookup_normalizes_input() {
    let engine = TestEngine::new().await;
    let tee = engine.seed_plain_product(dec!(10.00), 5).await;
    let created = engine.place_order(vec![CartLine::new(tee.id, 1)]).await;

    let found = engine
        .orders
        .get_order_by_tracking_code(&format!("  {}  ", created.tracking_code.to_lowercase()))
        .await
        .unwrap();
    assert_eq!(found.id, created.order_id);

    let malformed = engine.orders.get_order_by_tracking_code("TRK-123").await;
    assert_matches!(malformed, Err(ServiceError::ValidationError(_)));

    let unknown = engine
        .orders
        .get_order_by_tracking_code("TRK-AAAA-AAAA-AAAA")
        .await;
    assert_matches!(unknown, Err(ServiceError::OrderNotFound(_)));
}

#[tokio::test]
async fn manual_adjustment_never_goes_negative() {
    let engine = TestEngine::new().await;
    let tee = engine
        .seed_product(dec!(30.00), 4, json!(["S"]), json!(["red"]), false)
        .await;
    engine.seed_variant(tee.id, "S", "red", 4, None).await;
    let admin = Actor::Admin(Uuid::new_v4());

    let level = engine
        .inventory
        .adjust_stock(tee.id, Some("S|red".to_string()), 3, admin)
        .await
        .unwrap();
    assert_eq!(level, 7);
    assert_eq!(engine.variant_stock(tee.id, "S|red").await, 7);
    assert_eq!(engine.product(tee.id).await.stock, 7);

    let too_far = engine
        .inventory
        .adjust_stock(tee.id, Some("S|red".to_string()), -8, admin)
        .await;
    assert_matches!(too_far, Err(ServiceError::InsufficientStock(_)));
    assert_eq!(engine.variant_stock(tee.id, "S|red").await, 7);

    let zero = engine.inventory.adjust_stock(tee.id, None, 0, admin).await;
    assert_matches!(zero, Err(ServiceError::ValidationError(_)));
}

#[tokio::test]
async fn paid_orders_must_be_refunded_before_cancelling() {
    let mut engine = TestEngine::new().await;
    let tee = engine.seed_plain_product(dec!(50.00), 5).await;
    let order = engine
        .paid_order(vec![CartLine::new(tee.id, 2)], "tok-keep", "pay-keep", &[])
        .await;
    assert_eq!(engine.product(tee.id).await.stock, 3);
    engine.drain_events();

    let result = engine
        .orders
        .cancel_order(order.id, Actor::Admin(Uuid::new_v4()))
        .await;
    assert_matches!(result, Err(ServiceError::NotRefunded(remaining)) if remaining == dec!(100.00));

    let after = engine.order(order.id).await;
    assert_eq!(after.status, OrderStatus::Pending);
    assert_eq!(after.payment_status, PaymentStatus::Paid);
    assert_eq!(engine.product(tee.id).await.stock, 3);
    assert!(engine
        .stock_events(order.id)
        .await
        .iter()
        .all(|e| !e.reason.starts_with("order_cancel_")));
    assert!(engine.drain_events().is_empty());
}

#[tokio::test]
async fn quote_uses_shared_pool_minimum_and_override() {
    let engine = TestEngine::new().await;
    let tee = engine
        .seed_product(dec!(30.00), 8, json!(["S"]), json!(["red", "blue"]), true)
        .await;
    engine.seed_variant(tee.id, "S", "red", 3, None).await;
    engine.seed_variant(tee.id, "S", "blue", 5, Some(dec!(35.00))).await;

    let (selection, price, available) = engine
        .catalog
        .quote(tee.id, None, Some("blue"))
        .await
        .unwrap();
    assert_eq!(selection.variant_key, "S|blue");
    assert_eq!(price, dec!(35.00));
    assert_eq!(available, 3);

    let bad = engine.catalog.quote(tee.id, Some("S"), Some("green")).await;
    assert_matches!(bad, Err(ServiceError::InvalidColor(_)));
    let missing = engine.catalog.quote(Uuid::new_v4(), None, None).await;
    assert_matches!(missing, Err(ServiceError::ProductUnavailable(_)));
}
