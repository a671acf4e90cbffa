//! Refund ledger and orchestration.
//!
//! Refunds on one order are serialized by the `refund_in_progress` flag:
//! [`RefundService::begin_refund`] claims it in a short transaction, gateway
//! calls run with no database lock held, and [`RefundService::finish_refund`]
//! records the attempts and always releases the flag.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set, TransactionTrait,
};
use serde::Serialize;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    common::{amounts_match, round_money, validate_positive_decimal, Actor, MONEY_EPSILON},
    db::DbPool,
    entities::order::{
        self, ActiveModel as OrderActiveModel, Entity as OrderEntity, Model as OrderModel,
        OrderStatus, PaymentStatus,
    },
    entities::order_refund::{self, Entity as OrderRefundEntity, RefundStatus, CANCEL_MARKER, REFUND_V2_MARKER},
    errors::{RefundRejection, ServiceError},
    events::{Event, EventSender},
    gateway::{
        CancelRequest, CheckoutGateway, GatewayRefund, PaymentItem, RefundByPaymentIdRequest,
        RefundRequest,
    },
    services::inventory::CancelReason,
    services::orders::{append_payment_event, cancel_with_restock, lock_order},
};

/// Where one slice of a refund goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefundTarget {
    /// Part of one basket transaction
    PerTransaction { id: String, amount: Decimal },
    /// Same-day void of the whole payment
    WholePaymentCancel { payment_id: String },
    /// Payment-id keyed refund; cannot target a specific basket line
    WholePaymentRefundV2 { payment_id: String },
}

/// One gateway call and what came of it, as written to `order_refunds`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefundAttempt {
    pub payment_transaction_id: String,
    pub amount: Decimal,
    pub status: RefundStatus,
    pub gateway_refund_id: Option<String>,
    pub error_message: Option<String>,
    pub raw_response: Option<serde_json::Value>,
}

impl RefundAttempt {
    fn from_gateway(payment_transaction_id: String, amount: Decimal, result: GatewayRefund) -> Self {
        Self {
            payment_transaction_id,
            amount,
            status: if result.success {
                RefundStatus::Success
            } else {
                RefundStatus::Failure
            },
            gateway_refund_id: result.gateway_refund_id,
            error_message: result.error_message,
            raw_response: Some(result.raw),
        }
    }

    fn unreachable(payment_transaction_id: String, amount: Decimal, message: String) -> Self {
        Self {
            payment_transaction_id,
            amount,
            status: RefundStatus::Failure,
            gateway_refund_id: None,
            error_message: Some(message),
            raw_response: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == RefundStatus::Success
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefundOutcome {
    pub order_id: Uuid,
    pub refunded_now: Decimal,
    pub refunded_total: Decimal,
    pub payment_status: PaymentStatus,
    pub order_cancelled: bool,
    pub attempts: Vec<RefundAttempt>,
}

impl RefundOutcome {
    pub fn fully_refunded(&self) -> bool {
        self.payment_status == PaymentStatus::Refunded
    }
}

/// Plans per-transaction refunds, filling each transaction's headroom in order.
///
/// `refunded` holds what has already been refunded successfully per
/// transaction id. Fails with `NOTHING_TO_REFUND` when no transaction has room.
pub fn plan_allocation(
    items: &[PaymentItem],
    refunded: &HashMap<String, Decimal>,
    amount: Decimal,
) -> Result<Vec<RefundTarget>, ServiceError> {
    let mut remaining = round_money(amount);
    let mut plan = Vec::new();

    for item in items {
        if remaining <= Decimal::ZERO {
            break;
        }
        let already = refunded
            .get(&item.payment_transaction_id)
            .copied()
            .unwrap_or(Decimal::ZERO);
        let headroom = round_money(item.paid_price - already);
        if headroom <= Decimal::ZERO {
            continue;
        }
        let take = remaining.min(headroom);
        plan.push(RefundTarget::PerTransaction {
            id: item.payment_transaction_id.clone(),
            amount: take,
        });
        remaining -= take;
    }

    if plan.is_empty() {
        return Err(ServiceError::NothingToRefund);
    }
    Ok(plan)
}

/// Successful refund totals per basket transaction, markers excluded.
fn refunded_per_transaction(rows: &[order_refund::Model]) -> HashMap<String, Decimal> {
    let mut totals: HashMap<String, Decimal> = HashMap::new();
    for row in rows
        .iter()
        .filter(|r| r.status == RefundStatus::Success && !r.is_whole_payment())
    {
        *totals
            .entry(row.payment_transaction_id.clone())
            .or_insert(Decimal::ZERO) += row.amount;
    }
    totals
}

fn same_day(order: &OrderModel) -> bool {
    let taken = order.paid_at.unwrap_or(order.created_at);
    taken.date_naive() == Utc::now().date_naive()
}

#[derive(Clone)]
pub struct RefundService {
    db_pool: Arc<DbPool>,
    gateway: Arc<dyn CheckoutGateway>,
    event_sender: Option<Arc<EventSender>>,
}

impl RefundService {
    pub fn new(
        db_pool: Arc<DbPool>,
        gateway: Arc<dyn CheckoutGateway>,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        Self {
            db_pool,
            gateway,
            event_sender,
        }
    }

    fn publish(&self, event: Event) {
        if let Some(sender) = &self.event_sender {
            sender.publish(event);
        }
    }

    /// Claims refund exclusivity for an order.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn begin_refund(&self, order_id: Uuid) -> Result<OrderModel, ServiceError> {
        let txn = self.db_pool.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start transaction for refund claim");
            ServiceError::db_error(e)
        })?;
        let order = lock_order(&txn, order_id).await?;

        if order.refund_in_progress {
            counter!("storefront.refund.in_progress", 1);
            return Err(ServiceError::RefundInProgress(order_id));
        }
        if order.payment_status == PaymentStatus::Refunded
            || (order.payment_status.is_refundable()
                && order.remaining_refundable() <= MONEY_EPSILON)
        {
            return Err(ServiceError::RefundRejected(RefundRejection::AlreadyRefunded));
        }
        if !order.payment_status.is_refundable() {
            return Err(ServiceError::RefundRejected(RefundRejection::Status(
                order.payment_status.to_string(),
            )));
        }

        let mut active: OrderActiveModel = order.into();
        active.refund_in_progress = Set(true);
        let claimed = active.update(&txn).await.map_err(ServiceError::db_error)?;
        txn.commit().await.map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to commit refund claim");
            ServiceError::db_error(e)
        })?;
        Ok(claimed)
    }

    /// Records attempts, applies the successful total and releases the claim.
    ///
    /// The claim is released even when recording fails.
    #[instrument(skip(self, attempts), fields(order_id = %order_id, attempts = attempts.len()))]
    pub async fn finish_refund(
        &self,
        order_id: Uuid,
        attempts: &[RefundAttempt],
        actor: Actor,
    ) -> Result<OrderModel, ServiceError> {
        match self.record_refund(order_id, attempts, actor).await {
            Ok(order) => Ok(order),
            Err(e) => {
                error!(order_id = %order_id, error = %e, "Failed to record refund; releasing claim");
                let release = OrderEntity::update_many()
                    .col_expr(order::Column::RefundInProgress, Expr::value(false))
                    .filter(order::Column::Id.eq(order_id))
                    .exec(&*self.db_pool)
                    .await;
                if let Err(release_err) = release {
                    error!(order_id = %order_id, error = %release_err, "Refund claim could not be released");
                }
                Err(e)
            }
        }
    }

    async fn record_refund(
        &self,
        order_id: Uuid,
        attempts: &[RefundAttempt],
        actor: Actor,
    ) -> Result<OrderModel, ServiceError> {
        let txn = self.db_pool.begin().await.map_err(ServiceError::db_error)?;
        let order = lock_order(&txn, order_id).await?;

        for attempt in attempts {
            order_refund::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                payment_transaction_id: Set(attempt.payment_transaction_id.clone()),
                amount: Set(attempt.amount),
                currency: Set(order.currency.clone()),
                status: Set(attempt.status),
                gateway_refund_id: Set(attempt.gateway_refund_id.clone()),
                error_message: Set(attempt.error_message.clone()),
                raw_response: Set(attempt.raw_response.clone()),
                admin_id: Set(actor.admin_id()),
                created_at: Set(Utc::now()),
            }
            .insert(&txn)
            .await
            .map_err(|e| {
                error!(error = %e, order_id = %order_id, "Failed to insert refund attempt");
                ServiceError::db_error(e)
            })?;
        }

        let delta: Decimal = attempts
            .iter()
            .filter(|a| a.succeeded())
            .map(|a| a.amount)
            .sum();

        let previous_status = order.payment_status;
        let total = order.total_amount;
        let refunded = order.refunded_amount;
        let mut active: OrderActiveModel = order.into();
        active.refund_in_progress = Set(false);

        let mut next_status = previous_status;
        if delta > Decimal::ZERO {
            let new_refunded = round_money((refunded + delta).min(total));
            next_status = if total - new_refunded <= MONEY_EPSILON {
                PaymentStatus::Refunded
            } else {
                PaymentStatus::PartialRefunded
            };
            active.refunded_amount = Set(new_refunded);
            active.payment_status = Set(next_status);
        }

        let updated = active.update(&txn).await.map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to update refunded amount");
            ServiceError::db_error(e)
        })?;

        if next_status != previous_status {
            append_payment_event(&txn, order_id, next_status, actor.admin_id(), None).await;
        }

        txn.commit().await.map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to commit refund");
            ServiceError::db_error(e)
        })?;
        Ok(updated)
    }

    /// Refunds `amount` (or the whole remaining balance) through the gateway.
    ///
    /// Itemized payments are refunded per transaction; older orders without a
    /// breakdown fall back to a same-day cancel and then a payment-id refund.
    /// A refund that clears a still-pending order also cancels and restocks it.
    #[instrument(skip(self, ip), fields(order_id = %order_id, amount = ?amount))]
    pub async fn refund_order(
        &self,
        order_id: Uuid,
        amount: Option<Decimal>,
        actor: Actor,
        ip: &str,
    ) -> Result<RefundOutcome, ServiceError> {
        if let Some(amount) = amount {
            validate_positive_decimal(amount, "refund amount")?;
        }

        let order = self.begin_refund(order_id).await?;

        let attempts = match self.execute_refund(&order, amount, ip).await {
            Ok(attempts) => attempts,
            Err(e) => {
                self.finish_refund(order_id, &[], actor).await?;
                return Err(e);
            }
        };

        let updated = self.finish_refund(order_id, &attempts, actor).await?;
        let refunded_now: Decimal = attempts
            .iter()
            .filter(|a| a.succeeded())
            .map(|a| a.amount)
            .sum();

        if refunded_now <= Decimal::ZERO {
            counter!("storefront.refund.rejected", 1);
            let reason = attempts
                .iter()
                .rev()
                .find_map(|a| a.error_message.clone())
                .unwrap_or_else(|| "no refund attempt succeeded".to_string());
            warn!(order_id = %order_id, reason = %reason, "Gateway declined refund");
            return Err(ServiceError::RefundRejected(RefundRejection::NotRefundable(reason)));
        }

        counter!("storefront.refund.succeeded", 1);
        info!(
            order_id = %order_id,
            refunded_now = %refunded_now,
            refunded_total = %updated.refunded_amount,
            payment_status = %updated.payment_status,
            "Refund recorded"
        );
        let fully_refunded = updated.payment_status == PaymentStatus::Refunded;
        self.publish(Event::OrderRefunded {
            order_id,
            amount: refunded_now,
            fully_refunded,
        });

        let mut order_cancelled = false;
        if fully_refunded && updated.status == OrderStatus::Pending {
            match self.cancel_order_after_refund(order_id, actor).await {
                Ok(_) => order_cancelled = true,
                Err(e) => {
                    warn!(order_id = %order_id, error = %e, "Refund succeeded but automatic cancel failed")
                }
            }
        }

        Ok(RefundOutcome {
            order_id,
            refunded_now,
            refunded_total: updated.refunded_amount,
            payment_status: updated.payment_status,
            order_cancelled,
            attempts,
        })
    }

    async fn execute_refund(
        &self,
        order: &OrderModel,
        amount: Option<Decimal>,
        ip: &str,
    ) -> Result<Vec<RefundAttempt>, ServiceError> {
        let remaining = order.remaining_refundable();
        let requested = round_money(amount.unwrap_or(remaining));
        if requested > remaining + MONEY_EPSILON {
            return Err(ServiceError::RefundRejected(RefundRejection::TooMuch {
                requested,
                remaining,
            }));
        }
        let requested = requested.min(remaining);

        let items: Vec<PaymentItem> = match &order.payment_items {
            Some(value) => serde_json::from_value(value.clone()).unwrap_or_else(|e| {
                warn!(order_id = %order.id, error = %e, "Stored payment items unreadable; using whole-payment refund");
                Vec::new()
            }),
            None => Vec::new(),
        };

        if !items.is_empty() {
            let history = OrderRefundEntity::find()
                .filter(order_refund::Column::OrderId.eq(order.id))
                .all(&*self.db_pool)
                .await
                .map_err(ServiceError::db_error)?;
            let plan = plan_allocation(&items, &refunded_per_transaction(&history), requested)?;
            return Ok(self.run_plan(order, plan, requested, ip).await);
        }

        let payment_id = order
            .payment_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .ok_or(ServiceError::RefundRejected(RefundRejection::MissingPaymentId))?;

        let mut plan = Vec::new();
        let whole = amounts_match(requested, remaining) && order.refunded_amount.is_zero();
        if whole && same_day(order) {
            plan.push(RefundTarget::WholePaymentCancel {
                payment_id: payment_id.clone(),
            });
        }
        plan.push(RefundTarget::WholePaymentRefundV2 { payment_id });
        Ok(self.run_plan(order, plan, requested, ip).await)
    }

    /// Per-transaction targets all run; whole-payment targets stop at the first success.
    async fn run_plan(
        &self,
        order: &OrderModel,
        plan: Vec<RefundTarget>,
        requested: Decimal,
        ip: &str,
    ) -> Vec<RefundAttempt> {
        let conversation_id = order.id.to_string();
        let mut attempts = Vec::with_capacity(plan.len());

        for target in plan {
            let attempt = match target {
                RefundTarget::PerTransaction { id, amount } => {
                    let request = RefundRequest {
                        conversation_id: conversation_id.clone(),
                        payment_transaction_id: id.clone(),
                        amount,
                        currency: order.currency.clone(),
                        ip: ip.to_string(),
                    };
                    match self.gateway.refund(&request).await {
                        Ok(result) => RefundAttempt::from_gateway(id, amount, result),
                        Err(e) => RefundAttempt::unreachable(id, amount, e.to_string()),
                    }
                }
                RefundTarget::WholePaymentCancel { payment_id } => {
                    let marker = format!("{}{}", CANCEL_MARKER, payment_id);
                    let request = CancelRequest {
                        conversation_id: conversation_id.clone(),
                        payment_id,
                        ip: ip.to_string(),
                    };
                    match self.gateway.cancel(&request).await {
                        Ok(result) => RefundAttempt::from_gateway(marker, requested, result),
                        Err(e) => RefundAttempt::unreachable(marker, requested, e.to_string()),
                    }
                }
                RefundTarget::WholePaymentRefundV2 { payment_id } => {
                    let marker = format!("{}{}", REFUND_V2_MARKER, payment_id);
                    let request = RefundByPaymentIdRequest {
                        conversation_id: conversation_id.clone(),
                        payment_id,
                        amount: requested,
                        currency: order.currency.clone(),
                        ip: ip.to_string(),
                    };
                    match self.gateway.refund_by_payment_id(&request).await {
                        Ok(result) => RefundAttempt::from_gateway(marker, requested, result),
                        Err(e) => RefundAttempt::unreachable(marker, requested, e.to_string()),
                    }
                }
            };

            let whole_payment = attempt.payment_transaction_id.starts_with(CANCEL_MARKER)
                || attempt.payment_transaction_id.starts_with(REFUND_V2_MARKER);
            let stop = whole_payment && attempt.succeeded();
            if !attempt.succeeded() {
                warn!(
                    order_id = %order.id,
                    target = %attempt.payment_transaction_id,
                    error = ?attempt.error_message,
                    "Refund attempt failed"
                );
            }
            attempts.push(attempt);
            if stop {
                break;
            }
        }
        attempts
    }

    /// Refunds the whole remaining balance of a pending order, then cancels it.
    #[instrument(skip(self, ip), fields(order_id = %order_id))]
    pub async fn cancel_and_refund(
        &self,
        order_id: Uuid,
        actor: Actor,
        ip: &str,
    ) -> Result<RefundOutcome, ServiceError> {
        let order = OrderEntity::find_by_id(order_id)
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::OrderNotFound(order_id.to_string()))?;
        if order.status != OrderStatus::Pending {
            return Err(ServiceError::InvalidStatusTransition {
                from: order.status.to_string(),
                to: OrderStatus::Cancelled.to_string(),
            });
        }

        let outcome = if order.payment_status == PaymentStatus::Refunded {
            RefundOutcome {
                order_id,
                refunded_now: Decimal::ZERO,
                refunded_total: order.refunded_amount,
                payment_status: order.payment_status,
                order_cancelled: false,
                attempts: Vec::new(),
            }
        } else {
            self.refund_order(order_id, None, actor, ip).await?
        };

        if !outcome.fully_refunded() {
            let remaining = (order.total_amount - outcome.refunded_total).max(Decimal::ZERO);
            return Err(ServiceError::NotRefunded(remaining));
        }
        if outcome.order_cancelled {
            return Ok(outcome);
        }

        self.cancel_order_after_refund(order_id, actor).await?;
        Ok(RefundOutcome {
            order_cancelled: true,
            ..outcome
        })
    }

    /// Cancels and restocks a pending order whose payment is fully refunded.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn cancel_order_after_refund(
        &self,
        order_id: Uuid,
        actor: Actor,
    ) -> Result<OrderModel, ServiceError> {
        let txn = self.db_pool.begin().await.map_err(ServiceError::db_error)?;
        let order = lock_order(&txn, order_id).await?;

        if order.payment_status != PaymentStatus::Refunded {
            return Err(ServiceError::NotRefunded(order.remaining_refundable()));
        }
        if order.status == OrderStatus::Cancelled {
            return Ok(order);
        }
        if order.status != OrderStatus::Pending {
            return Err(ServiceError::InvalidStatusTransition {
                from: order.status.to_string(),
                to: OrderStatus::Cancelled.to_string(),
            });
        }

        let (cancelled, restocked) =
            cancel_with_restock(&txn, order, CancelReason::Refund, actor.admin_id()).await?;
        txn.commit().await.map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to commit cancel after refund");
            ServiceError::db_error(e)
        })?;

        counter!("storefront.orders.cancelled", 1);
        info!(order_id = %order_id, restocked, "Order cancelled after refund");
        self.publish(Event::OrderCancelled { order_id, restocked });
        Ok(cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn item(id: &str, paid: Decimal) -> PaymentItem {
        PaymentItem {
            payment_transaction_id: id.to_string(),
            item_id: None,
            paid_price: paid,
            price: None,
        }
    }

    fn amounts(plan: &[RefundTarget]) -> Vec<(String, Decimal)> {
        plan.iter()
            .map(|t| match t {
                RefundTarget::PerTransaction { id, amount } => (id.clone(), *amount),
                other => panic!("unexpected target {:?}", other),
            })
            .collect()
    }

    #[test]
    fn allocation_walks_items_in_order() {
        let items = vec![item("a", dec!(100)), item("b", dec!(50))];
        let plan = plan_allocation(&items, &HashMap::new(), dec!(120)).unwrap();
        assert_eq!(
            amounts(&plan),
            vec![("a".to_string(), dec!(100)), ("b".to_string(), dec!(20))]
        );
    }

    #[test]
    fn allocation_skips_exhausted_transactions() {
        let items = vec![item("a", dec!(100)), item("b", dec!(50))];
        let mut refunded = HashMap::new();
        refunded.insert("a".to_string(), dec!(100));
        let plan = plan_allocation(&items, &refunded, dec!(30)).unwrap();
        assert_eq!(amounts(&plan), vec![("b".to_string(), dec!(30))]);
    }

    #[test]
    fn allocation_with_no_headroom_is_nothing_to_refund() {
        let items = vec![item("a", dec!(10))];
        let mut refunded = HashMap::new();
        refunded.insert("a".to_string(), dec!(10));
        assert_matches!(
            plan_allocation(&items, &refunded, dec!(5)),
            Err(ServiceError::NothingToRefund)
        );
        assert_matches!(
            plan_allocation(&[], &HashMap::new(), dec!(5)),
            Err(ServiceError::NothingToRefund)
        );
    }

    #[test]
    fn markers_are_excluded_from_per_transaction_totals() {
        let row = |tx: &str, amount: Decimal, status: RefundStatus| order_refund::Model {
            id: Uuid::new_v4(),
            order_id: Uuid::nil(),
            payment_transaction_id: tx.to_string(),
            amount,
            currency: "TRY".into(),
            status,
            gateway_refund_id: None,
            error_message: None,
            raw_response: None,
            admin_id: None,
            created_at: Utc::now(),
        };
        let rows = vec![
            row("a", dec!(10), RefundStatus::Success),
            row("a", dec!(5), RefundStatus::Success),
            row("a", dec!(50), RefundStatus::Failure),
            row("REFUND_V2:p1", dec!(200), RefundStatus::Success),
        ];
        let totals = refunded_per_transaction(&rows);
        assert_eq!(totals.get("a"), Some(&dec!(15)));
        assert_eq!(totals.len(), 1);
    }

    fn cents(max: i64) -> impl Strategy<Value = Decimal> {
        (1..=max).prop_map(|c| Decimal::new(c, 2))
    }

    proptest! {
        #[test]
        fn allocation_never_exceeds_request_or_headroom(
            paid in prop::collection::vec(cents(50_000), 1..6),
            spent in prop::collection::vec(0i64..50_000, 1..6),
            request in cents(200_000),
        ) {
            let items: Vec<PaymentItem> = paid
                .iter()
                .enumerate()
                .map(|(i, p)| item(&format!("tx{}", i), *p))
                .collect();
            let refunded: HashMap<String, Decimal> = spent
                .iter()
                .enumerate()
                .map(|(i, s)| (format!("tx{}", i), Decimal::new(*s, 2)))
                .collect();

            if let Ok(plan) = plan_allocation(&items, &refunded, request) {
                let planned = amounts(&plan);
                let total: Decimal = planned.iter().map(|(_, a)| *a).sum();
                prop_assert!(total <= request);
                for (id, amount) in planned {
                    prop_assert!(amount > Decimal::ZERO);
                    let it = items.iter().find(|i| i.payment_transaction_id == id).unwrap();
                    let already = refunded.get(&id).copied().unwrap_or(Decimal::ZERO);
                    prop_assert!(amount + already <= it.paid_price);
                }
            }
        }
    }
}
