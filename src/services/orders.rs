use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use metrics::counter;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseTransaction, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set, SqlErr, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::{
    common::{generate_tracking_code, normalize_tracking_code, round_money, Actor, Address},
    db::DbPool,
    entities::order::{
        self, ActiveModel as OrderActiveModel, Entity as OrderEntity, Model as OrderModel,
        OrderStatus, PaymentStatus,
    },
    entities::order_item::{self, Entity as OrderItemEntity, Model as OrderItemModel},
    entities::order_payment_event,
    entities::order_refund::{self, Entity as OrderRefundEntity, Model as OrderRefundModel},
    errors::ServiceError,
    events::{Event, EventSender},
    services::catalog::{
        load_products, resolve_availability, resolve_selection, resolve_unit_price, stock_pool,
        StockPool,
    },
    services::inventory::{restock_order, CancelReason},
    services::order_status::check_transition,
};

const TRACKING_CODE_ATTEMPTS: usize = 5;

/// One cart line as submitted by the client. Prices are never taken from here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartLine {
    pub product_id: Uuid,
    /// Decimal so fractional input can be rejected rather than truncated
    pub quantity: Decimal,
    pub size: Option<String>,
    pub color: Option<String>,
}

impl CartLine {
    pub fn new(product_id: Uuid, quantity: i32) -> Self {
        Self {
            product_id,
            quantity: Decimal::from(quantity),
            size: None,
            color: None,
        }
    }

    pub fn with_size(mut self, size: impl Into<String>) -> Self {
        self.size = Some(size.into());
        self
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }
}

/// Buyer details the gateway requires at checkout.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BuyerIdentity {
    pub customer_id: Option<Uuid>,
    #[validate(length(min = 1, message = "Buyer name is required"))]
    pub name: String,
    #[validate(length(min = 1, message = "Buyer surname is required"))]
    pub surname: String,
    #[validate(email(message = "Buyer email is invalid"))]
    pub email: String,
    #[validate(length(min = 1, message = "Buyer phone is required"))]
    pub phone: String,
    #[validate(length(min = 1, message = "Identity number is required"))]
    pub identity_number: String,
    #[validate(length(min = 1, message = "Buyer IP is required"))]
    pub ip: String,
    /// Defaults to the shipping address
    #[validate]
    pub billing_address: Option<Address>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedOrder {
    pub order_id: Uuid,
    pub tracking_code: String,
    pub total_amount: Decimal,
}

fn parse_quantity(line: &CartLine) -> Result<i32, ServiceError> {
    let q = line.quantity;
    if q <= Decimal::ZERO || !q.fract().is_zero() {
        return Err(ServiceError::InvalidQuantity(format!(
            "{} for product {}",
            q, line.product_id
        )));
    }
    q.to_i32()
        .ok_or_else(|| ServiceError::InvalidQuantity(format!("{} is too large", q)))
}

/// Appends a payment-status audit row inside its own savepoint.
///
/// Failures are logged and swallowed; the surrounding transaction is unaffected.
pub(crate) async fn append_payment_event(
    txn: &DatabaseTransaction,
    order_id: Uuid,
    payment_status: PaymentStatus,
    admin_id: Option<Uuid>,
    note: Option<String>,
) {
    let savepoint = match txn.begin().await {
        Ok(sp) => sp,
        Err(e) => {
            warn!(order_id = %order_id, error = %e, "Could not open savepoint for payment event");
            return;
        }
    };

    let insert = order_payment_event::ActiveModel {
        id: Set(Uuid::new_v4()),
        order_id: Set(order_id),
        payment_status: Set(payment_status),
        admin_id: Set(admin_id),
        note: Set(note),
        created_at: Set(Utc::now()),
    }
    .insert(&savepoint)
    .await;

    let outcome = match insert {
        Ok(_) => savepoint.commit().await,
        Err(e) => {
            if let Err(rollback_err) = savepoint.rollback().await {
                error!(error = %rollback_err, "Failed to roll back payment event savepoint");
            }
            Err(e)
        }
    };
    if let Err(e) = outcome {
        warn!(order_id = %order_id, error = %e, "Payment event not recorded");
    }
}

/// Reads the order row under `FOR UPDATE`.
pub(crate) async fn lock_order(
    txn: &DatabaseTransaction,
    order_id: Uuid,
) -> Result<OrderModel, ServiceError> {
    OrderEntity::find_by_id(order_id)
        .lock_exclusive()
        .one(txn)
        .await
        .map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to lock order");
            ServiceError::db_error(e)
        })?
        .ok_or_else(|| ServiceError::OrderNotFound(order_id.to_string()))
}

/// Cancels a locked order and puts its decremented stock back.
///
/// Skips the transition table; callers check it when they need to.
pub(crate) async fn cancel_with_restock(
    txn: &DatabaseTransaction,
    order: OrderModel,
    reason: CancelReason,
    admin_id: Option<Uuid>,
) -> Result<(OrderModel, bool), ServiceError> {
    let order_id = order.id;
    let restocked = restock_order(txn, order_id, reason, admin_id).await? > 0;

    let mut active: OrderActiveModel = order.into();
    active.status = Set(OrderStatus::Cancelled);
    let updated = active.update(txn).await.map_err(|e| {
        error!(error = %e, order_id = %order_id, "Failed to cancel order");
        ServiceError::db_error(e)
    })?;
    Ok((updated, restocked))
}

/// Inserts the order row under a fresh tracking code, retrying on a unique
/// violation. Each attempt runs in its own savepoint so a collision leaves the
/// outer transaction usable.
pub(crate) async fn insert_with_tracking_code<G, B>(
    txn: &DatabaseTransaction,
    mut next_code: G,
    build: B,
) -> Result<String, ServiceError>
where
    G: FnMut() -> String,
    B: Fn(String) -> OrderActiveModel,
{
    for _ in 0..TRACKING_CODE_ATTEMPTS {
        let candidate = next_code();
        let savepoint = txn.begin().await.map_err(ServiceError::db_error)?;
        match build(candidate.clone()).insert(&savepoint).await {
            Ok(_) => {
                savepoint.commit().await.map_err(ServiceError::db_error)?;
                return Ok(candidate);
            }
            Err(e) if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                savepoint.rollback().await.map_err(ServiceError::db_error)?;
                warn!(tracking_code = %candidate, "Tracking code collision; retrying");
            }
            Err(e) => {
                error!(error = %e, "Failed to create order in database");
                return Err(ServiceError::db_error(e));
            }
        }
    }
    Err(ServiceError::InternalError(
        "Could not allocate a unique tracking code".to_string(),
    ))
}

/// Service for order creation, status changes and order lookups
#[derive(Clone)]
pub struct OrderService {
    db_pool: Arc<DbPool>,
    event_sender: Option<Arc<EventSender>>,
    currency: String,
}

impl OrderService {
    pub fn new(db_pool: Arc<DbPool>, event_sender: Option<Arc<EventSender>>) -> Self {
        Self {
            db_pool,
            event_sender,
            currency: "TRY".to_string(),
        }
    }

    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = currency.into();
        self
    }

    fn publish(&self, event: Event) {
        if let Some(sender) = &self.event_sender {
            sender.publish(event);
        }
    }

    /// Creates a `pending/pending` order from cart lines, re-pricing everything
    /// from current catalog state.
    #[instrument(skip(self, lines, shipping_address, buyer), fields(lines = lines.len()))]
    pub async fn create_order_from_cart(
        &self,
        lines: Vec<CartLine>,
        shipping_address: Option<Address>,
        buyer: BuyerIdentity,
    ) -> Result<CreatedOrder, ServiceError> {
        if lines.is_empty() {
            return Err(ServiceError::EmptyCart);
        }
        let shipping_address = match shipping_address {
            Some(addr) if !addr.is_blank() => addr,
            _ => return Err(ServiceError::AddressRequired),
        };
        let quantities = lines
            .iter()
            .map(parse_quantity)
            .collect::<Result<Vec<_>, _>>()?;
        buyer.validate()?;
        let billing_address = buyer
            .billing_address
            .clone()
            .filter(|a| !a.is_blank())
            .unwrap_or_else(|| shipping_address.clone());

        let txn = self.db_pool.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start transaction for order creation");
            ServiceError::db_error(e)
        })?;

        let product_ids: Vec<Uuid> = lines.iter().map(|l| l.product_id).collect();
        let catalog = load_products(&txn, &product_ids).await?;

        struct PricedLine {
            product_id: Uuid,
            product_name: String,
            quantity: i32,
            unit_price: Decimal,
            size: String,
            color: String,
            variant_key: String,
        }

        let mut priced = Vec::with_capacity(lines.len());
        let mut demand: HashMap<StockPool, (i32, i32)> = HashMap::new();
        for (line, quantity) in lines.iter().zip(quantities) {
            let stock = catalog
                .get(&line.product_id)
                .filter(|s| s.product.is_active)
                .ok_or(ServiceError::ProductUnavailable(line.product_id))?;
            let selection =
                resolve_selection(&stock.product, line.size.as_deref(), line.color.as_deref())?;

            let pool = stock_pool(stock, &selection.variant_key, &selection.size);
            let available = resolve_availability(stock, &selection.variant_key, &selection.size);
            let entry = demand.entry(pool).or_insert((0, available));
            entry.0 = entry.0.saturating_add(quantity);

            priced.push(PricedLine {
                product_id: line.product_id,
                product_name: stock.product.name.clone(),
                quantity,
                unit_price: resolve_unit_price(stock, &selection.variant_key),
                size: selection.size,
                color: selection.color,
                variant_key: selection.variant_key,
            });
        }

        for (pool, (wanted, available)) in &demand {
            if wanted > available {
                return Err(ServiceError::InsufficientStock(format!(
                    "{:?}: requested {}, available {}",
                    pool, wanted, available
                )));
            }
        }

        let total_amount = round_money(
            priced
                .iter()
                .map(|l| l.unit_price * Decimal::from(l.quantity))
                .sum(),
        );

        let order_id = Uuid::new_v4();
        let shipping_address = serde_json::to_value(&shipping_address)?;
        let billing_address = serde_json::to_value(&billing_address)?;
        let tracking_code = insert_with_tracking_code(&txn, generate_tracking_code, |code| {
            OrderActiveModel {
                id: Set(order_id),
                tracking_code: Set(code),
                customer_id: Set(buyer.customer_id),
                buyer_name: Set(buyer.name.trim().to_string()),
                buyer_surname: Set(buyer.surname.trim().to_string()),
                buyer_email: Set(buyer.email.trim().to_string()),
                buyer_phone: Set(buyer.phone.trim().to_string()),
                buyer_identity_number: Set(buyer.identity_number.trim().to_string()),
                buyer_ip: Set(buyer.ip.trim().to_string()),
                shipping_address: Set(shipping_address.clone()),
                billing_address: Set(billing_address.clone()),
                total_amount: Set(total_amount),
                refunded_amount: Set(Decimal::ZERO),
                currency: Set(self.currency.clone()),
                status: Set(OrderStatus::Pending),
                payment_status: Set(PaymentStatus::Pending),
                payment_token: Set(None),
                payment_id: Set(None),
                payment_error_code: Set(None),
                payment_error_message: Set(None),
                payment_error_group: Set(None),
                payment_error_raw: Set(None),
                refund_in_progress: Set(false),
                payment_items: Set(None),
                paid_at: Set(None),
                created_at: Set(Utc::now()),
                updated_at: Set(None),
                version: Set(1),
            }
        })
        .await?;

        for line in priced {
            order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(line.product_id),
                product_name: Set(line.product_name),
                quantity: Set(line.quantity),
                price_at_purchase: Set(line.unit_price),
                selected_size: Set(line.size),
                selected_color: Set(line.color),
                variant_key: Set(line.variant_key),
                created_at: Set(Utc::now()),
            }
            .insert(&txn)
            .await
            .map_err(|e| {
                error!(error = %e, order_id = %order_id, "Failed to insert order line");
                ServiceError::db_error(e)
            })?;
        }

        append_payment_event(&txn, order_id, PaymentStatus::Pending, None, None).await;

        txn.commit().await.map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to commit order creation");
            ServiceError::db_error(e)
        })?;

        counter!("storefront.orders.created", 1);
        info!(order_id = %order_id, tracking_code = %tracking_code, total = %total_amount, "Order created");
        self.publish(Event::OrderCreated {
            order_id,
            tracking_code: tracking_code.clone(),
            total_amount,
        });

        Ok(CreatedOrder {
            order_id,
            tracking_code,
            total_amount,
        })
    }

    /// Moves an order along the status table; cancelling restocks.
    #[instrument(skip(self), fields(order_id = %order_id, next = %next))]
    pub async fn update_order_status(
        &self,
        order_id: Uuid,
        next: OrderStatus,
        actor: Actor,
    ) -> Result<OrderModel, ServiceError> {
        let txn = self.db_pool.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start transaction for status update");
            ServiceError::db_error(e)
        })?;

        let order = lock_order(&txn, order_id).await?;
        check_transition(&order, next)?;

        if order.status == next {
            txn.commit().await.map_err(ServiceError::db_error)?;
            return Ok(order);
        }

        // Paid balances go through RefundService::cancel_and_refund
        if next == OrderStatus::Cancelled && order.payment_status.is_refundable() {
            let remaining = order.remaining_refundable();
            warn!(order_id = %order_id, payment_status = %order.payment_status, remaining = %remaining, "Refusing to cancel an order with an unrefunded payment");
            return Err(ServiceError::NotRefunded(remaining));
        }

        let previous = order.status;
        let (updated, restocked) = if next == OrderStatus::Cancelled {
            cancel_with_restock(&txn, order, CancelReason::from_actor(&actor), actor.admin_id())
                .await?
        } else {
            let mut active: OrderActiveModel = order.into();
            active.status = Set(next);
            let updated = active.update(&txn).await.map_err(|e| {
                error!(error = %e, order_id = %order_id, "Failed to update order status");
                ServiceError::db_error(e)
            })?;
            (updated, false)
        };

        txn.commit().await.map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to commit status update");
            ServiceError::db_error(e)
        })?;

        info!(order_id = %order_id, from = %previous, to = %next, actor = ?actor, "Order status updated");
        if next == OrderStatus::Cancelled {
            counter!("storefront.orders.cancelled", 1);
            self.publish(Event::OrderCancelled {
                order_id,
                restocked,
            });
        }
        Ok(updated)
    }

    pub async fn cancel_order(&self, order_id: Uuid, actor: Actor) -> Result<OrderModel, ServiceError> {
        self.update_order_status(order_id, OrderStatus::Cancelled, actor)
            .await
    }

    #[instrument(skip(self))]
    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderModel, ServiceError> {
        OrderEntity::find_by_id(order_id)
            .one(&*self.db_pool)
            .await
            .map_err(|e| {
                error!(error = %e, order_id = %order_id, "Failed to fetch order");
                ServiceError::db_error(e)
            })?
            .ok_or_else(|| ServiceError::OrderNotFound(order_id.to_string()))
    }

    /// Customer lookup; malformed codes are rejected before touching the database.
    #[instrument(skip(self))]
    pub async fn get_order_by_tracking_code(&self, code: &str) -> Result<OrderModel, ServiceError> {
        let code = normalize_tracking_code(code).ok_or_else(|| {
            ServiceError::ValidationError("Tracking code format is invalid".to_string())
        })?;
        OrderEntity::find()
            .filter(order::Column::TrackingCode.eq(code.clone()))
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or(ServiceError::OrderNotFound(code))
    }

    pub async fn order_lines(&self, order_id: Uuid) -> Result<Vec<OrderItemModel>, ServiceError> {
        OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .order_by_asc(order_item::Column::CreatedAt)
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)
    }

    pub async fn refund_history(&self, order_id: Uuid) -> Result<Vec<OrderRefundModel>, ServiceError> {
        OrderRefundEntity::find()
            .filter(order_refund::Column::OrderId.eq(order_id))
            .order_by_asc(order_refund::Column::CreatedAt)
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)
    }

    /// Orders still awaiting payment, holding a token, created within `window`.
    #[instrument(skip(self))]
    pub async fn list_pending_orders_with_token(
        &self,
        window: Duration,
        limit: u64,
    ) -> Result<Vec<OrderModel>, ServiceError> {
        let since = Utc::now() - window;
        OrderEntity::find()
            .filter(
                order::Column::PaymentStatus.is_in([PaymentStatus::Pending, PaymentStatus::Failed]),
            )
            .filter(order::Column::PaymentToken.is_not_null())
            .filter(order::Column::Status.ne(OrderStatus::Cancelled))
            .filter(order::Column::CreatedAt.gte(since))
            .order_by_asc(order::Column::CreatedAt)
            .limit(limit)
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)
    }

    /// Older unresolved orders, aged between `min_age` and `max_age`.
    #[instrument(skip(self))]
    pub async fn list_orders_for_reconciliation(
        &self,
        min_age: Duration,
        max_age: Duration,
        limit: u64,
    ) -> Result<Vec<OrderModel>, ServiceError> {
        let now = Utc::now();
        OrderEntity::find()
            .filter(
                order::Column::PaymentStatus.is_in([PaymentStatus::Pending, PaymentStatus::Failed]),
            )
            .filter(order::Column::PaymentToken.is_not_null())
            .filter(order::Column::Status.ne(OrderStatus::Cancelled))
            .filter(order::Column::CreatedAt.lte(now - min_age))
            .filter(order::Column::CreatedAt.gte(now - max_age))
            .order_by_asc(order::Column::CreatedAt)
            .limit(limit)
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;

    #[test]
    fn quantity_must_be_a_positive_integer() {
        let id = Uuid::new_v4();
        let line = |q: Decimal| CartLine {
            quantity: q,
            ..CartLine::new(id, 1)
        };
        assert_eq!(parse_quantity(&line(dec!(3))).unwrap(), 3);
        assert_eq!(parse_quantity(&line(dec!(2.0))).unwrap(), 2);
        assert_matches!(parse_quantity(&line(dec!(0))), Err(ServiceError::InvalidQuantity(_)));
        assert_matches!(parse_quantity(&line(dec!(-1))), Err(ServiceError::InvalidQuantity(_)));
        assert_matches!(parse_quantity(&line(dec!(1.5))), Err(ServiceError::InvalidQuantity(_)));
        assert_matches!(
            parse_quantity(&line(dec!(99999999999))),
            Err(ServiceError::InvalidQuantity(_))
        );
    }

    #[test]
    fn buyer_validation_names_fields() {
        let buyer = BuyerIdentity {
            customer_id: None,
            name: "".into(),
            surname: "Yilmaz".into(),
            email: "not-an-email".into(),
            phone: "+905350000000".into(),
            identity_number: "74300864791".into(),
            ip: "85.34.78.112".into(),
            billing_address: None,
        };
        let errors = buyer.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("name"));
        assert!(errors.field_errors().contains_key("email"));
    }

    fn order_with_code(code: String) -> OrderActiveModel {
        OrderActiveModel {
            id: Set(Uuid::new_v4()),
            tracking_code: Set(code),
            customer_id: Set(None),
            buyer_name: Set("Ayse".into()),
            buyer_surname: Set("Yilmaz".into()),
            buyer_email: Set("ayse@example.com".into()),
            buyer_phone: Set("+905350000000".into()),
            buyer_identity_number: Set("74300864791".into()),
            buyer_ip: Set("85.34.78.112".into()),
            shipping_address: Set(serde_json::json!({})),
            billing_address: Set(serde_json::json!({})),
            total_amount: Set(dec!(10.00)),
            refunded_amount: Set(Decimal::ZERO),
            currency: Set("TRY".into()),
            status: Set(OrderStatus::Pending),
            payment_status: Set(PaymentStatus::Pending),
            payment_token: Set(None),
            payment_id: Set(None),
            payment_error_code: Set(None),
            payment_error_message: Set(None),
            payment_error_group: Set(None),
            payment_error_raw: Set(None),
            refund_in_progress: Set(false),
            payment_items: Set(None),
            paid_at: Set(None),
            created_at: Set(Utc::now()),
            updated_at: Set(None),
            version: Set(1),
        }
    }

    #[tokio::test]
    async fn tracking_code_collision_retries_inside_the_transaction() {
        use crate::db::{establish_connection_with_config, run_migrations, DbConfig};

        let pool = establish_connection_with_config(&DbConfig::in_memory_sqlite())
            .await
            .expect("connect");
        run_migrations(&pool).await.expect("migrations");

        let txn = pool.begin().await.unwrap();
        let first = insert_with_tracking_code(&txn, || "TRK-AAAA-AAAA-AAAA".to_string(), order_with_code)
            .await
            .unwrap();
        assert_eq!(first, "TRK-AAAA-AAAA-AAAA");

        let mut codes = vec!["TRK-BBBB-BBBB-BBBB", "TRK-AAAA-AAAA-AAAA"];
        let second = insert_with_tracking_code(
            &txn,
            || codes.pop().unwrap_or("TRK-CCCC-CCCC-CCCC").to_string(),
            order_with_code,
        )
        .await
        .unwrap();
        assert_eq!(second, "TRK-BBBB-BBBB-BBBB");
        txn.commit().await.unwrap();

        assert_eq!(OrderEntity::find().all(&pool).await.unwrap().len(), 2);

        let txn = pool.begin().await.unwrap();
        let exhausted =
            insert_with_tracking_code(&txn, || "TRK-AAAA-AAAA-AAAA".to_string(), order_with_code).await;
        assert_matches!(exhausted, Err(ServiceError::InternalError(_)));
    }
}
