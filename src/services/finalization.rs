//! Payment finalization: the single entry point every trigger converges on.
//!
//! Webhook, browser redirect, status poll and the sweeper all call
//! [`FinalizationService::finalize`]. The order row lock plus the already-paid
//! short-circuit make concurrent calls for one order safe.

use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::Serialize;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    common::amounts_match,
    db::DbPool,
    entities::order::{
        self, ActiveModel as OrderActiveModel, Entity as OrderEntity, Model as OrderModel,
        OrderStatus, PaymentStatus,
    },
    entities::order_item::{self, Entity as OrderItemEntity},
    errors::ServiceError,
    events::{Event, EventSender},
    gateway::{CheckoutGateway, GatewayError, PaymentRetrieval},
    notifications::LowStockAlert,
    services::catalog::load_products,
    services::inventory::decrement_line,
    services::orders::{append_payment_event, lock_order},
};

pub const AMOUNT_MISMATCH_CODE: &str = "AMOUNT_MISMATCH";
pub const TOKEN_MISMATCH_NOTE: &str = "TOKEN_MISMATCH";

/// Result of one finalize call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinalizeOutcome {
    pub ok: bool,
    /// Set when another call already performed the paid transition
    pub already_paid: bool,
    pub order_id: Uuid,
    pub tracking_code: String,
    pub paid_amount: Option<Decimal>,
    /// Gateway decline code when `ok` is false
    pub error_code: Option<String>,
    /// Stock bookkeeping problems that did not block the payment
    pub warnings: Vec<String>,
}

impl FinalizeOutcome {
    fn declined(order: &OrderModel, retrieval: &PaymentRetrieval) -> Self {
        Self {
            ok: false,
            already_paid: false,
            order_id: order.id,
            tracking_code: order.tracking_code.clone(),
            paid_amount: None,
            error_code: retrieval.error_code.clone(),
            warnings: Vec::new(),
        }
    }

    fn paid(order: &OrderModel, already_paid: bool, warnings: Vec<String>) -> Self {
        Self {
            ok: true,
            already_paid,
            order_id: order.id,
            tracking_code: order.tracking_code.clone(),
            paid_amount: Some(order.total_amount),
            error_code: None,
            warnings,
        }
    }
}

struct FailureDetails {
    code: Option<String>,
    message: Option<String>,
    group: Option<String>,
    raw: Option<serde_json::Value>,
}

/// Order id the gateway echoes back; basket id first, then conversation id.
fn echoed_order_id(retrieval: &PaymentRetrieval) -> Option<Uuid> {
    [&retrieval.basket_id, &retrieval.conversation_id]
        .into_iter()
        .flatten()
        .find_map(|id| Uuid::parse_str(id).ok())
}

#[derive(Clone)]
pub struct FinalizationService {
    db_pool: Arc<DbPool>,
    gateway: Arc<dyn CheckoutGateway>,
    event_sender: Option<Arc<EventSender>>,
    default_low_stock_threshold: i32,
}

impl FinalizationService {
    pub fn new(
        db_pool: Arc<DbPool>,
        gateway: Arc<dyn CheckoutGateway>,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        Self {
            db_pool,
            gateway,
            event_sender,
            default_low_stock_threshold: 5,
        }
    }

    pub fn with_low_stock_threshold(mut self, threshold: i32) -> Self {
        self.default_low_stock_threshold = threshold;
        self
    }

    fn publish(&self, event: Event) {
        if let Some(sender) = &self.event_sender {
            sender.publish(event);
        }
    }

    /// Confirms a payment with the gateway and applies it locally, once.
    ///
    /// A declined payment is `Ok` with `ok: false`. Gateway transport errors,
    /// token and amount mismatches, and `INVALID_STATE` are errors.
    #[instrument(skip(self, token))]
    pub async fn finalize(&self, token: &str) -> Result<FinalizeOutcome, ServiceError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(ServiceError::ValidationError("payment token is required".to_string()));
        }
        counter!("storefront.finalize.calls", 1);

        let retrieval = self.gateway.retrieve_by_token(token).await.map_err(|e| {
            counter!("storefront.finalize.gateway_error", 1);
            warn!(error = %e, "Gateway retrieval failed during finalize");
            ServiceError::from(e)
        })?;

        let order = self.find_order(&retrieval, token).await?;
        let order_id = order.id;

        if order.payment_token.as_deref() != Some(token) {
            counter!("storefront.finalize.token_mismatch", 1);
            error!(order_id = %order_id, "Presented payment token does not match the order");
            self.record_token_mismatch(&order).await;
            return Err(ServiceError::TokenMismatch(order_id));
        }

        if !retrieval.is_success() {
            counter!("storefront.finalize.declined", 1);
            warn!(
                order_id = %order_id,
                status = %retrieval.status,
                payment_status = ?retrieval.payment_status,
                code = ?retrieval.error_code,
                "Gateway reports payment not successful"
            );
            let details = FailureDetails {
                code: retrieval.error_code.clone(),
                message: retrieval.error_message.clone(),
                group: retrieval.error_group.clone(),
                raw: Some(retrieval.raw.clone()),
            };
            if self.record_failure(order_id, details).await? {
                self.publish(Event::PaymentFailed {
                    order_id,
                    code: retrieval.error_code.clone(),
                    message: retrieval.error_message.clone(),
                });
            }
            return Ok(FinalizeOutcome::declined(&order, &retrieval));
        }

        let paid_price = retrieval
            .paid_price
            .ok_or(ServiceError::Gateway(GatewayError::MissingField("paidPrice")))?;
        if !amounts_match(paid_price, order.total_amount) {
            counter!("storefront.finalize.amount_mismatch", 1);
            error!(
                order_id = %order_id,
                expected = %order.total_amount,
                actual = %paid_price,
                "Paid amount does not match order total"
            );
            let details = FailureDetails {
                code: Some(AMOUNT_MISMATCH_CODE.to_string()),
                message: Some(format!(
                    "gateway paid {} for an order total of {}",
                    paid_price, order.total_amount
                )),
                group: None,
                raw: Some(retrieval.raw.clone()),
            };
            self.record_failure(order_id, details).await?;
            return Err(ServiceError::AmountMismatch {
                expected: order.total_amount,
                actual: paid_price,
            });
        }

        self.persist_payment_details(order_id, &retrieval).await;

        self.apply_paid_transition(order_id, &retrieval).await
    }

    async fn find_order(
        &self,
        retrieval: &PaymentRetrieval,
        token: &str,
    ) -> Result<OrderModel, ServiceError> {
        let db = &*self.db_pool;
        if let Some(order_id) = echoed_order_id(retrieval) {
            if let Some(order) = OrderEntity::find_by_id(order_id)
                .one(db)
                .await
                .map_err(ServiceError::db_error)?
            {
                return Ok(order);
            }
        }

        OrderEntity::find()
            .filter(order::Column::PaymentToken.eq(token))
            .order_by_desc(order::Column::CreatedAt)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                let reference = retrieval
                    .basket_id
                    .clone()
                    .or_else(|| retrieval.conversation_id.clone())
                    .unwrap_or_else(|| "unknown".to_string());
                ServiceError::OrderNotFound(reference)
            })
    }

    /// Audit row only; the order itself is left alone.
    async fn record_token_mismatch(&self, order: &OrderModel) {
        let txn = match self.db_pool.begin().await {
            Ok(txn) => txn,
            Err(e) => {
                warn!(order_id = %order.id, error = %e, "Could not record token mismatch");
                return;
            }
        };
        append_payment_event(
            &txn,
            order.id,
            order.payment_status,
            None,
            Some(format!("{}: presented token does not match stored token", TOKEN_MISMATCH_NOTE)),
        )
        .await;
        if let Err(e) = txn.commit().await {
            warn!(order_id = %order.id, error = %e, "Could not record token mismatch");
        }
    }

    /// Marks an order awaiting payment as failed. Returns whether anything changed.
    async fn record_failure(
        &self,
        order_id: Uuid,
        details: FailureDetails,
    ) -> Result<bool, ServiceError> {
        let txn = self.db_pool.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start transaction for payment failure");
            ServiceError::db_error(e)
        })?;
        let order = lock_order(&txn, order_id).await?;
        if !order.payment_status.awaiting_payment() || order.status == OrderStatus::Cancelled {
            return Ok(false);
        }

        let previous = order.payment_status;
        let note = details.code.clone();
        let mut active: OrderActiveModel = order.into();
        active.payment_status = Set(PaymentStatus::Failed);
        active.payment_error_code = Set(details.code);
        active.payment_error_message = Set(details.message);
        active.payment_error_group = Set(details.group);
        active.payment_error_raw = Set(details.raw);
        active.update(&txn).await.map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to record payment failure");
            ServiceError::db_error(e)
        })?;

        if previous != PaymentStatus::Failed {
            append_payment_event(&txn, order_id, PaymentStatus::Failed, None, note).await;
        }
        txn.commit().await.map_err(ServiceError::db_error)?;
        Ok(true)
    }

    /// Stores the per-transaction breakdown later used for refunds. Never fails the call.
    async fn persist_payment_details(&self, order_id: Uuid, retrieval: &PaymentRetrieval) {
        let mut update = OrderEntity::update_many().filter(order::Column::Id.eq(order_id));
        let mut touched = false;

        if !retrieval.payment_items.is_empty() {
            match serde_json::to_value(&retrieval.payment_items) {
                Ok(items) => {
                    update = update.col_expr(order::Column::PaymentItems, Expr::value(items));
                    touched = true;
                }
                Err(e) => warn!(order_id = %order_id, error = %e, "Could not encode payment items"),
            }
        }
        if let Some(payment_id) = &retrieval.payment_id {
            update = update.col_expr(order::Column::PaymentId, Expr::value(payment_id.clone()));
            touched = true;
        }

        if touched {
            if let Err(e) = update.exec(&*self.db_pool).await {
                warn!(order_id = %order_id, error = %e, "Could not persist payment details");
            }
        }
    }

    async fn apply_paid_transition(
        &self,
        order_id: Uuid,
        retrieval: &PaymentRetrieval,
    ) -> Result<FinalizeOutcome, ServiceError> {
        let txn = self.db_pool.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start transaction for paid transition");
            ServiceError::db_error(e)
        })?;
        let order = lock_order(&txn, order_id).await?;

        if order.payment_status == PaymentStatus::Paid {
            counter!("storefront.finalize.already_paid", 1);
            info!(order_id = %order_id, "Order already paid");
            return Ok(FinalizeOutcome::paid(&order, true, Vec::new()));
        }
        if order.status == OrderStatus::Cancelled {
            error!(order_id = %order_id, "Payment confirmed for a cancelled order; manual refund needed");
            return Err(ServiceError::InvalidState("order is cancelled".to_string()));
        }
        if !order.payment_status.awaiting_payment() {
            return Err(ServiceError::InvalidState(format!(
                "payment status is {}",
                order.payment_status
            )));
        }

        let payment_id = retrieval.payment_id.clone().or_else(|| order.payment_id.clone());
        let mut active: OrderActiveModel = order.into();
        active.payment_status = Set(PaymentStatus::Paid);
        active.payment_id = Set(payment_id);
        active.payment_error_code = Set(None);
        active.payment_error_message = Set(None);
        active.payment_error_group = Set(None);
        active.payment_error_raw = Set(None);
        active.paid_at = Set(Some(Utc::now()));
        let paid = active.update(&txn).await.map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to mark order paid");
            ServiceError::db_error(e)
        })?;
        append_payment_event(&txn, order_id, PaymentStatus::Paid, None, None).await;

        // Stock failures below never undo the paid marking
        let lines = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .order_by_asc(order_item::Column::CreatedAt)
            .all(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        let product_ids: Vec<Uuid> = lines.iter().map(|l| l.product_id).collect();
        let catalog = load_products(&txn, &product_ids).await?;

        let mut warnings = Vec::new();
        let mut alerts: Vec<LowStockAlert> = Vec::new();
        for line in &lines {
            let Some(stock) = catalog.get(&line.product_id) else {
                warnings.push(format!("product {} no longer exists", line.product_id));
                continue;
            };
            match decrement_line(&txn, order_id, line, stock, self.default_low_stock_threshold).await {
                Ok(found) => alerts.extend(found),
                Err(e) => {
                    counter!("storefront.finalize.stock_failure", 1);
                    error!(
                        order_id = %order_id,
                        product_id = %line.product_id,
                        variant_key = %line.variant_key,
                        error = %e,
                        class = "integrity",
                        "Stock decrement failed after payment; manual correction needed"
                    );
                    warnings.push(format!("line {}: {}", line.id, e));
                }
            }
        }

        txn.commit().await.map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to commit paid transition");
            ServiceError::db_error(e)
        })?;

        counter!("storefront.finalize.paid", 1);
        info!(order_id = %order_id, tracking_code = %paid.tracking_code, amount = %paid.total_amount, "Order paid");

        self.publish(Event::OrderPaid {
            order_id,
            tracking_code: paid.tracking_code.clone(),
            paid_amount: paid.total_amount,
        });
        for alert in alerts {
            self.publish(Event::StockLow(alert));
        }

        Ok(FinalizeOutcome::paid(&paid, false, warnings))
    }
}
