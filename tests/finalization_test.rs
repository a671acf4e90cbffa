mod common;

use assert_matches::assert_matches;
use rust_decimal_macros::dec;
use serde_json::json;

use common::{declined_retrieval, paid_retrieval, TestEngine};
use storefront_orders::{
    entities::{OrderStatus, PaymentStatus},
    events::Event,
    gateway::GatewayError,
    services::{
        finalization::AMOUNT_MISMATCH_CODE,
        orders::CartLine,
    },
    ServiceError,
};

#[tokio::test]
async fn paid_order_decrements_stock_once() {
    let mut engine = TestEngine::new().await;
    let tee = engine.seed_plain_product(dec!(50.00), 10).await;
    let created = engine
        .place_order_with_token(vec![CartLine::new(tee.id, 3)], "tok-150")
        .await;
    engine.gateway.set_retrieval(
        "tok-150",
        Ok(paid_retrieval(created.order_id, "tok-150", "150.00", "pay-1", &[("tx-1", "150.00")])),
    );

    let outcome = engine.finalization.finalize("tok-150").await.unwrap();
    assert!(outcome.ok);
    assert!(!outcome.already_paid);
    assert_eq!(outcome.paid_amount, Some(dec!(150.00)));
    assert!(outcome.warnings.is_empty());

    let order = engine.order(created.order_id).await;
    assert_eq!(order.payment_status, PaymentStatus::Paid);
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.payment_id.as_deref(), Some("pay-1"));
    assert!(order.paid_at.is_some());
    assert!(order.payment_items.is_some());
    assert_eq!(engine.product(tee.id).await.stock, 7);

    let stock_events = engine.stock_events(created.order_id).await;
    assert_eq!(stock_events.len(), 1);
    assert_eq!(stock_events[0].delta, -3);
    assert_eq!(stock_events[0].reason, "iyzico_payment");

    // Replay is a no-op
    let replay = engine.finalization.finalize("tok-150").await.unwrap();
    assert!(replay.ok);
    assert!(replay.already_paid);
    assert_eq!(engine.product(tee.id).await.stock, 7);
    assert_eq!(engine.stock_events(created.order_id).await.len(), 1);

    let paid_events = engine
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, Event::OrderPaid { .. }))
        .count();
    assert_eq!(paid_events, 1);
}

#[tokio::test]
async fn concurrent_finalize_applies_once() {
    let engine = TestEngine::new().await;
    let tee = engine.seed_plain_product(dec!(25.00), 5).await;
    let created = engine
        .place_order_with_token(vec![CartLine::new(tee.id, 2)], "tok-race")
        .await;
    engine.gateway.set_retrieval(
        "tok-race",
        Ok(paid_retrieval(created.order_id, "tok-race", "50.00", "pay-race", &[])),
    );

    let (a, b) = tokio::join!(
        engine.finalization.finalize("tok-race"),
        engine.finalization.finalize("tok-race"),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(a.ok && b.ok);
    assert_eq!([a.already_paid, b.already_paid].iter().filter(|p| **p).count(), 1);
    assert_eq!(engine.product(tee.id).await.stock, 3);
    assert_eq!(engine.stock_events(created.order_id).await.len(), 1);
}

#[tokio::test]
async fn shared_size_pool_decrements_every_color() {
    let engine = TestEngine::new().await;
    let tee = engine
        .seed_product(dec!(20.00), 30, json!(["M"]), json!(["red", "blue", "black"]), true)
        .await;
    engine.seed_variant(tee.id, "M", "red", 10, None).await;
    engine.seed_variant(tee.id, "M", "blue", 10, None).await;
    engine.seed_variant(tee.id, "M", "black", 10, None).await;

    let order = engine
        .paid_order(
            vec![CartLine::new(tee.id, 2).with_size("M").with_color("blue")],
            "tok-shared",
            "pay-shared",
            &[("tx-s", "40.00")],
        )
        .await;

    for color in ["red", "blue", "black"] {
        assert_eq!(engine.variant_stock(tee.id, &format!("M|{}", color)).await, 8);
    }
    assert_eq!(engine.product(tee.id).await.stock, 28);
    // Three variant rows plus the aggregate
    assert_eq!(engine.stock_events(order.id).await.len(), 4);
}

#[tokio::test]
async fn shortfall_after_payment_is_a_warning() {
    let engine = TestEngine::new().await;
    let tee = engine
        .seed_product(dec!(20.00), 10, json!(["S"]), json!(["red"]), false)
        .await;
    engine.seed_variant(tee.id, "S", "red", 2, None).await;
    let created = engine
        .place_order_with_token(vec![CartLine::new(tee.id, 2).with_size("S")], "tok-short")
        .await;

    // Someone else took the stock between order and payment
    engine
        .inventory
        .adjust_stock(tee.id, Some("S|red".to_string()), -1, storefront_orders::common::Actor::System)
        .await
        .unwrap();

    engine.gateway.set_retrieval(
        "tok-short",
        Ok(paid_retrieval(created.order_id, "tok-short", "40.00", "pay-short", &[])),
    );
    let outcome = engine.finalization.finalize("tok-short").await.unwrap();

    assert!(outcome.ok);
    assert_eq!(outcome.warnings.len(), 1);
    assert_eq!(engine.order(created.order_id).await.payment_status, PaymentStatus::Paid);
    // Savepoint rolled back: neither the variant nor the aggregate moved
    assert_eq!(engine.variant_stock(tee.id, "S|red").await, 1);
    assert_eq!(engine.product(tee.id).await.stock, 9);
    assert!(engine.stock_events(created.order_id).await.is_empty());
}

#[tokio::test]
async fn declined_payment_marks_failed_and_can_recover() {
    let mut engine = TestEngine::new().await;
    let tee = engine.seed_plain_product(dec!(10.00), 5).await;
    let created = engine
        .place_order_with_token(vec![CartLine::new(tee.id, 1)], "tok-decline")
        .await;
    engine.gateway.set_retrieval(
        "tok-decline",
        Ok(declined_retrieval(created.order_id, "tok-decline", "10051")),
    );

    let outcome = engine.finalization.finalize("tok-decline").await.unwrap();
    assert!(!outcome.ok);
    assert_eq!(outcome.error_code.as_deref(), Some("10051"));

    let order = engine.order(created.order_id).await;
    assert_eq!(order.payment_status, PaymentStatus::Failed);
    assert_eq!(order.payment_error_code.as_deref(), Some("10051"));
    assert!(engine
        .drain_events()
        .iter()
        .any(|e| matches!(e, Event::PaymentFailed { .. })));

    // A later success still lands
    engine.gateway.set_retrieval(
        "tok-decline",
        Ok(paid_retrieval(created.order_id, "tok-decline", "10.00", "pay-ok", &[])),
    );
    let outcome = engine.finalization.finalize("tok-decline").await.unwrap();
    assert!(outcome.ok);
    let order = engine.order(created.order_id).await;
    assert_eq!(order.payment_status, PaymentStatus::Paid);
    assert!(order.payment_error_code.is_none());
}

#[tokio::test]
async fn amount_mismatch_is_refused() {
    let engine = TestEngine::new().await;
    let tee = engine.seed_plain_product(dec!(50.00), 10).await;
    let created = engine
        .place_order_with_token(vec![CartLine::new(tee.id, 3)], "tok-amount")
        .await;
    engine.gateway.set_retrieval(
        "tok-amount",
        Ok(paid_retrieval(created.order_id, "tok-amount", "1.00", "pay-x", &[])),
    );

    let result = engine.finalization.finalize("tok-amount").await;
    assert_matches!(
        result,
        Err(ServiceError::AmountMismatch { expected, actual })
            if expected == dec!(150.00) && actual == dec!(1.00)
    );

    let order = engine.order(created.order_id).await;
    assert_eq!(order.payment_status, PaymentStatus::Failed);
    assert_eq!(order.payment_error_code.as_deref(), Some(AMOUNT_MISMATCH_CODE));
    assert_eq!(engine.product(tee.id).await.stock, 10);
}

#[tokio::test]
async fn token_mismatch_leaves_order_alone() {
    let engine = TestEngine::new().await;
    let tee = engine.seed_plain_product(dec!(10.00), 5).await;
    let created = engine
        .place_order_with_token(vec![CartLine::new(tee.id, 1)], "tok-real")
        .await;
    // Gateway echoes our order id for a token we never stored
    engine.gateway.set_retrieval(
        "tok-forged",
        Ok(paid_retrieval(created.order_id, "tok-forged", "10.00", "pay-f", &[])),
    );

    let result = engine.finalization.finalize("tok-forged").await;
    assert_matches!(result, Err(ServiceError::TokenMismatch(id)) if id == created.order_id);

    let order = engine.order(created.order_id).await;
    assert_eq!(order.payment_status, PaymentStatus::Pending);
    let audit = engine.payment_events(created.order_id).await;
    assert!(audit
        .iter()
        .any(|e| e.note.as_deref().is_some_and(|n| n.starts_with("TOKEN_MISMATCH"))));
}

#[tokio::test]
async fn cancelled_order_is_not_marked_paid() {
    let engine = TestEngine::new().await;
    let tee = engine.seed_plain_product(dec!(10.00), 5).await;
    let created = engine
        .place_order_with_token(vec![CartLine::new(tee.id, 1)], "tok-late")
        .await;
    engine
        .orders
        .cancel_order(created.order_id, storefront_orders::common::Actor::System)
        .await
        .unwrap();
    engine.gateway.set_retrieval(
        "tok-late",
        Ok(paid_retrieval(created.order_id, "tok-late", "10.00", "pay-late", &[])),
    );

    let result = engine.finalization.finalize("tok-late").await;
    assert_matches!(result, Err(ServiceError::InvalidState(_)));
    assert_eq!(engine.product(tee.id).await.stock, 5);
}

#[tokio::test]
async fn gateway_errors_propagate_without_changes() {
    let engine = TestEngine::new().await;
    let tee = engine.seed_plain_product(dec!(10.00), 5).await;
    let created = engine
        .place_order_with_token(vec![CartLine::new(tee.id, 1)], "tok-down")
        .await;
    engine
        .gateway
        .set_retrieval("tok-down", Err(GatewayError::Timeout));

    let result = engine.finalization.finalize("tok-down").await;
    assert_matches!(result, Err(ServiceError::Gateway(GatewayError::Timeout)));
    assert_eq!(
        engine.order(created.order_id).await.payment_status,
        PaymentStatus::Pending
    );

    let blank = engine.finalization.finalize("   ").await;
    assert_matches!(blank, Err(ServiceError::ValidationError(_)));
}

#[tokio::test]
async fn low_stock_alert_fires_on_crossing() {
    let mut engine = TestEngine::new().await;
    // Threshold seeded at 2
    let tee = engine.seed_plain_product(dec!(10.00), 4).await;
    engine
        .paid_order(vec![CartLine::new(tee.id, 2)], "tok-low", "pay-low", &[])
        .await;

    let alerts: Vec<_> = engine
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            Event::StockLow(alert) => Some(alert),
            _ => None,
        })
        .collect();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].previous_stock, 4);
    assert_eq!(alerts[0].new_stock, 2);
}
