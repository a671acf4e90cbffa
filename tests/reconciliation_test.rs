mod common;

use rust_decimal_macros::dec;
use serde_json::json;
use tokio::sync::watch;
use tokio::time::{timeout, Duration};

use common::{declined_retrieval, paid_retrieval, TestEngine};
use storefront_orders::{
    entities::PaymentStatus,
    gateway::{GatewayError, PaymentRetrieval},
    services::orders::CartLine,
};

#[tokio::test]
async fn sweep_finalizes_orders_that_missed_their_callback() {
    let engine = TestEngine::new().await;
    let tee = engine.seed_plain_product(dec!(20.00), 5).await;
    let created = engine
        .place_order_with_token(vec![CartLine::new(tee.id, 1)], "tok-sweep")
        .await;
    engine.gateway.set_retrieval(
        "tok-sweep",
        Ok(paid_retrieval(created.order_id, "tok-sweep", "20.00", "pay-sweep", &[])),
    );

    let report = engine.reconciliation.sweep_pending_once().await.unwrap();
    assert_eq!(report.scanned, 1);
    assert_eq!(report.finalized, 1);
    assert_eq!(
        engine.order(created.order_id).await.payment_status,
        PaymentStatus::Paid
    );
    assert_eq!(engine.product(tee.id).await.stock, 4);

    // Paid orders drop out of the next pass
    let report = engine.reconciliation.sweep_pending_once().await.unwrap();
    assert_eq!(report.scanned, 0);
}

#[tokio::test]
async fn orders_without_token_are_not_swept() {
    let engine = TestEngine::new().await;
    let tee = engine.seed_plain_product(dec!(20.00), 5).await;
    engine.place_order(vec![CartLine::new(tee.id, 1)]).await;

    let report = engine.reconciliation.sweep_pending_once().await.unwrap();
    assert_eq!(report.scanned, 0);
    assert_eq!(engine.gateway.retrieve_count(), 0);
}

#[tokio::test]
async fn declines_back_off_between_passes() {
    let engine = TestEngine::new().await;
    let tee = engine.seed_plain_product(dec!(20.00), 5).await;
    let created = engine
        .place_order_with_token(vec![CartLine::new(tee.id, 1)], "tok-back")
        .await;
    engine.gateway.set_retrieval(
        "tok-back",
        Ok(declined_retrieval(created.order_id, "tok-back", "10051")),
    );

    let first = engine.reconciliation.sweep_pending_once().await.unwrap();
    assert_eq!(first.declined, 1);
    assert_eq!(engine.reconciliation.attempts_for(created.order_id), 1);

    // Backoff has not elapsed yet
    let second = engine.reconciliation.sweep_pending_once().await.unwrap();
    assert_eq!(second.skipped, 1);
    assert_eq!(engine.gateway.retrieve_count(), 1);
    assert_eq!(
        engine.order(created.order_id).await.payment_status,
        PaymentStatus::Failed
    );
}

#[tokio::test]
async fn retry_ceiling_stops_the_sweeper() {
    let engine = TestEngine::with_config(|config| {
        config.reconciliation.max_attempts = 1;
    })
    .await;
    let tee = engine.seed_plain_product(dec!(20.00), 5).await;
    let created = engine
        .place_order_with_token(vec![CartLine::new(tee.id, 1)], "tok-ceiling")
        .await;
    engine
        .gateway
        .set_retrieval("tok-ceiling", Err(GatewayError::Timeout));

    let first = engine.reconciliation.sweep_pending_once().await.unwrap();
    assert_eq!(first.errors, 1);

    tokio::time::sleep(Duration::from_millis(2100)).await;
    let second = engine.reconciliation.sweep_pending_once().await.unwrap();
    assert_eq!(second.skipped, 1);
    assert_eq!(engine.reconciliation.attempts_for(created.order_id), 1);
}

#[tokio::test]
async fn drift_pass_corrects_and_redrives() {
    let engine = TestEngine::with_config(|config| {
        // Everything already counts as "older"
        config.reconciliation.pending_window_secs = 0;
    })
    .await;
    let tee = engine.seed_plain_product(dec!(20.00), 5).await;
    let failed = engine
        .place_order_with_token(vec![CartLine::new(tee.id, 1)], "tok-drift-failed")
        .await;
    let paid = engine
        .place_order_with_token(vec![CartLine::new(tee.id, 1)], "tok-drift-paid")
        .await;
    engine.gateway.set_retrieval(
        "tok-drift-failed",
        Ok(declined_retrieval(failed.order_id, "tok-drift-failed", "10051")),
    );
    engine.gateway.set_retrieval(
        "tok-drift-paid",
        Ok(paid_retrieval(paid.order_id, "tok-drift-paid", "20.00", "pay-drift", &[])),
    );

    let report = engine.reconciliation.reconcile_drift_once().await.unwrap();
    assert_eq!(report.scanned, 2);
    assert_eq!(report.corrected, 1);
    assert_eq!(report.redriven, 1);

    assert_eq!(
        engine.order(failed.order_id).await.payment_status,
        PaymentStatus::Failed
    );
    assert_eq!(
        engine.order(paid.order_id).await.payment_status,
        PaymentStatus::Paid
    );
    let notes: Vec<_> = engine
        .payment_events(failed.order_id)
        .await
        .into_iter()
        .filter_map(|e| e.note)
        .collect();
    assert!(notes.iter().any(|n| n.starts_with("reconciled from")));

    // Stable once corrected
    let report = engine.reconciliation.reconcile_drift_once().await.unwrap();
    assert_eq!(report.scanned, 1);
    assert_eq!(report.unchanged, 1);
}

#[tokio::test]
async fn drift_back_to_pending_clears_failure_fields() {
    let engine = TestEngine::with_config(|config| {
        config.reconciliation.pending_window_secs = 0;
    })
    .await;
    let tee = engine.seed_plain_product(dec!(20.00), 5).await;
    let created = engine
        .place_order_with_token(vec![CartLine::new(tee.id, 1)], "tok-3ds")
        .await;
    engine.gateway.set_retrieval(
        "tok-3ds",
        Ok(declined_retrieval(created.order_id, "tok-3ds", "10051")),
    );
    engine.finalization.finalize("tok-3ds").await.unwrap();
    let failed = engine.order(created.order_id).await;
    assert_eq!(failed.payment_status, PaymentStatus::Failed);
    assert_eq!(failed.payment_error_code.as_deref(), Some("10051"));

    // Gateway now says the 3DS step is still open
    engine.gateway.set_retrieval(
        "tok-3ds",
        Ok(PaymentRetrieval::from_wire(json!({
            "status": "success",
            "paymentStatus": "INIT_THREEDS",
            "basketId": created.order_id.to_string(),
            "token": "tok-3ds",
        }))
        .unwrap()),
    );
    let report = engine.reconciliation.reconcile_drift_once().await.unwrap();
    assert_eq!(report.corrected, 1);

    let order = engine.order(created.order_id).await;
    assert_eq!(order.payment_status, PaymentStatus::Pending);
    assert_eq!(order.payment_error_code, None);
    assert_eq!(order.payment_error_message, None);
    assert_eq!(order.payment_error_group, None);
    assert_eq!(order.payment_error_raw, None);
}

#[tokio::test]
async fn run_stops_on_shutdown() {
    let engine = TestEngine::new().await;
    let (tx, rx) = watch::channel(false);
    let reconciliation = engine.reconciliation.clone();
    let handle = tokio::spawn(async move { reconciliation.run(rx).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    tx.send(true).unwrap();
    timeout(Duration::from_secs(5), handle)
        .await
        .expect("loops stop promptly")
        .unwrap();
}
