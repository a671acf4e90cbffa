//! Stock decrement, restock and manual adjustments.
//!
//! Decrements are guarded `UPDATE .. WHERE stock >= q` statements; a short row
//! count is the failure signal. Every changed row gets a stock-event audit row.

use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseTransaction, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::common::Actor;
use crate::db::DbPool;
use crate::entities::order_item::Model as OrderItemModel;
use crate::entities::product::{self, Entity as ProductEntity, Model as ProductModel};
use crate::entities::product_stock_event::{
    self, Entity as StockEventEntity, REASON_CANCEL_PREFIX, REASON_MANUAL, REASON_PAYMENT,
};
use crate::entities::product_variant::{self, Entity as VariantEntity, Model as VariantModel};
use crate::errors::ServiceError;
use crate::notifications::LowStockAlert;
use crate::services::catalog::{stock_pool, ProductStock, StockPool};

/// Why a cancelled order's stock is being put back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Admin,
    Customer,
    Refund,
}

impl CancelReason {
    pub fn from_actor(actor: &Actor) -> Self {
        match actor {
            Actor::Customer(_) => CancelReason::Customer,
            Actor::Admin(_) | Actor::System => CancelReason::Admin,
        }
    }

    pub fn as_reason(&self) -> &'static str {
        match self {
            CancelReason::Admin => "order_cancel_admin",
            CancelReason::Customer => "order_cancel_customer",
            CancelReason::Refund => "order_cancel_refund",
        }
    }
}

struct RowChange {
    variant_key: Option<String>,
    previous: i32,
    new: i32,
}

async fn record_stock_event(
    txn: &DatabaseTransaction,
    product_id: Uuid,
    change: &RowChange,
    reason: &str,
    order_id: Option<Uuid>,
    admin_id: Option<Uuid>,
) -> Result<(), ServiceError> {
    product_stock_event::ActiveModel {
        id: Set(Uuid::new_v4()),
        product_id: Set(product_id),
        variant_key: Set(change.variant_key.clone()),
        delta: Set(change.new - change.previous),
        previous_stock: Set(change.previous),
        new_stock: Set(change.new),
        reason: Set(reason.to_string()),
        order_id: Set(order_id),
        admin_id: Set(admin_id),
        created_at: Set(Utc::now()),
    }
    .insert(txn)
    .await
    .map_err(ServiceError::db_error)?;
    Ok(())
}

async fn lock_product(txn: &DatabaseTransaction, product_id: Uuid) -> Result<ProductModel, ServiceError> {
    ProductEntity::find_by_id(product_id)
        .lock_exclusive()
        .one(txn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))
}

fn insufficient(product_id: Uuid, what: &str) -> ServiceError {
    ServiceError::InsufficientStock(format!("product {} ({})", product_id, what))
}

/// Decrements stock for one order line, all or nothing.
///
/// Runs inside its own savepoint: when any guarded update comes up short the
/// savepoint is rolled back and nothing from this line stays applied.
#[instrument(skip(txn, line, stock), fields(order_id = %order_id, product_id = %line.product_id, quantity = line.quantity))]
pub async fn decrement_line(
    txn: &DatabaseTransaction,
    order_id: Uuid,
    line: &OrderItemModel,
    stock: &ProductStock,
    default_threshold: i32,
) -> Result<Vec<LowStockAlert>, ServiceError> {
    let savepoint = txn.begin().await.map_err(ServiceError::db_error)?;
    match decrement_line_inner(&savepoint, order_id, line, stock, default_threshold).await {
        Ok(alerts) => {
            savepoint.commit().await.map_err(ServiceError::db_error)?;
            Ok(alerts)
        }
        Err(e) => {
            if let Err(rollback_err) = savepoint.rollback().await {
                error!(error = %rollback_err, "Failed to roll back stock savepoint");
            }
            Err(e)
        }
    }
}

async fn decrement_line_inner(
    txn: &DatabaseTransaction,
    order_id: Uuid,
    line: &OrderItemModel,
    stock: &ProductStock,
    default_threshold: i32,
) -> Result<Vec<LowStockAlert>, ServiceError> {
    let qty = line.quantity;
    let product_id = line.product_id;
    let mut changes: Vec<RowChange> = Vec::new();

    match stock_pool(stock, &line.variant_key, &line.selected_size) {
        StockPool::SharedSize { size, .. } => {
            let rows: Vec<VariantModel> = VariantEntity::find()
                .filter(product_variant::Column::ProductId.eq(product_id))
                .filter(product_variant::Column::Size.eq(size.clone()))
                .lock_exclusive()
                .all(txn)
                .await
                .map_err(ServiceError::db_error)?;

            let result = VariantEntity::update_many()
                .col_expr(
                    product_variant::Column::Stock,
                    Expr::col(product_variant::Column::Stock).sub(qty),
                )
                .col_expr(
                    product_variant::Column::UpdatedAt,
                    Expr::value(Some(Utc::now())),
                )
                .filter(product_variant::Column::ProductId.eq(product_id))
                .filter(product_variant::Column::Size.eq(size.clone()))
                .filter(product_variant::Column::Stock.gte(qty))
                .exec(txn)
                .await
                .map_err(ServiceError::db_error)?;

            if rows.is_empty() || result.rows_affected != rows.len() as u64 {
                return Err(insufficient(product_id, &format!("size pool {}", size)));
            }
            changes.extend(rows.into_iter().map(|row| RowChange {
                variant_key: Some(row.variant_key),
                previous: row.stock,
                new: row.stock - qty,
            }));
        }
        StockPool::Variant { variant_key, .. } => {
            let row = VariantEntity::find()
                .filter(product_variant::Column::ProductId.eq(product_id))
                .filter(product_variant::Column::VariantKey.eq(variant_key.clone()))
                .lock_exclusive()
                .one(txn)
                .await
                .map_err(ServiceError::db_error)?;

            // Row may have been removed since the order was placed
            if let Some(row) = row {
                let result = VariantEntity::update_many()
                    .col_expr(
                        product_variant::Column::Stock,
                        Expr::col(product_variant::Column::Stock).sub(qty),
                    )
                    .col_expr(
                        product_variant::Column::UpdatedAt,
                        Expr::value(Some(Utc::now())),
                    )
                    .filter(product_variant::Column::Id.eq(row.id))
                    .filter(product_variant::Column::Stock.gte(qty))
                    .exec(txn)
                    .await
                    .map_err(ServiceError::db_error)?;

                if result.rows_affected != 1 {
                    return Err(insufficient(product_id, &format!("variant {}", variant_key)));
                }
                changes.push(RowChange {
                    variant_key: Some(row.variant_key),
                    previous: row.stock,
                    new: row.stock - qty,
                });
            }
        }
        StockPool::Product { .. } => {}
    }

    let product_row = lock_product(txn, product_id).await?;
    let result = ProductEntity::update_many()
        .col_expr(product::Column::Stock, Expr::col(product::Column::Stock).sub(qty))
        .col_expr(product::Column::UpdatedAt, Expr::value(Some(Utc::now())))
        .filter(product::Column::Id.eq(product_id))
        .filter(product::Column::Stock.gte(qty))
        .exec(txn)
        .await
        .map_err(ServiceError::db_error)?;
    if result.rows_affected != 1 {
        return Err(insufficient(product_id, "product aggregate"));
    }
    changes.push(RowChange {
        variant_key: None,
        previous: product_row.stock,
        new: product_row.stock - qty,
    });

    let threshold = product_row.low_stock_threshold.unwrap_or(default_threshold);
    let mut alerts = Vec::new();
    for change in &changes {
        record_stock_event(txn, product_id, change, REASON_PAYMENT, Some(order_id), None).await?;
        if LowStockAlert::crossed(change.previous, change.new, threshold) {
            alerts.push(LowStockAlert {
                product_id,
                product_name: product_row.name.clone(),
                variant_key: change.variant_key.clone(),
                previous_stock: change.previous,
                new_stock: change.new,
                threshold,
            });
        }
    }

    counter!("storefront.stock.decremented", 1);
    Ok(alerts)
}

/// Whether this order's stock has already been put back.
pub async fn already_restocked<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<bool, ServiceError> {
    let count = StockEventEntity::find()
        .filter(product_stock_event::Column::OrderId.eq(order_id))
        .filter(product_stock_event::Column::Reason.starts_with(REASON_CANCEL_PREFIX))
        .count(conn)
        .await
        .map_err(ServiceError::db_error)?;
    Ok(count > 0)
}

/// Reverses exactly the payment decrements recorded for `order_id`.
///
/// Returns the number of compensating rows written; zero when the order was
/// never decremented or was already restocked.
#[instrument(skip(txn), fields(order_id = %order_id, reason = reason.as_reason()))]
pub async fn restock_order(
    txn: &DatabaseTransaction,
    order_id: Uuid,
    reason: CancelReason,
    admin_id: Option<Uuid>,
) -> Result<usize, ServiceError> {
    if already_restocked(txn, order_id).await? {
        info!(order_id = %order_id, "Order already restocked; skipping");
        return Ok(0);
    }

    let decrements = StockEventEntity::find()
        .filter(product_stock_event::Column::OrderId.eq(order_id))
        .filter(product_stock_event::Column::Reason.eq(REASON_PAYMENT))
        .order_by_asc(product_stock_event::Column::CreatedAt)
        .all(txn)
        .await
        .map_err(ServiceError::db_error)?;

    let mut written = 0;
    for event in decrements {
        let qty = -event.delta;
        if qty <= 0 {
            continue;
        }

        let previous = match &event.variant_key {
            Some(key) => {
                let row = VariantEntity::find()
                    .filter(product_variant::Column::ProductId.eq(event.product_id))
                    .filter(product_variant::Column::VariantKey.eq(key.clone()))
                    .lock_exclusive()
                    .one(txn)
                    .await
                    .map_err(ServiceError::db_error)?;
                let Some(row) = row else {
                    warn!(product_id = %event.product_id, variant_key = %key, "Variant gone; cannot restock");
                    continue;
                };
                VariantEntity::update_many()
                    .col_expr(
                        product_variant::Column::Stock,
                        Expr::col(product_variant::Column::Stock).add(qty),
                    )
                    .col_expr(
                        product_variant::Column::UpdatedAt,
                        Expr::value(Some(Utc::now())),
                    )
                    .filter(product_variant::Column::Id.eq(row.id))
                    .exec(txn)
                    .await
                    .map_err(ServiceError::db_error)?;
                row.stock
            }
            None => {
                let row = match lock_product(txn, event.product_id).await {
                    Ok(row) => row,
                    Err(ServiceError::NotFound(_)) => {
                        warn!(product_id = %event.product_id, "Product gone; cannot restock");
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                ProductEntity::update_many()
                    .col_expr(product::Column::Stock, Expr::col(product::Column::Stock).add(qty))
                    .col_expr(product::Column::UpdatedAt, Expr::value(Some(Utc::now())))
                    .filter(product::Column::Id.eq(row.id))
                    .exec(txn)
                    .await
                    .map_err(ServiceError::db_error)?;
                row.stock
            }
        };

        let change = RowChange {
            variant_key: event.variant_key.clone(),
            previous,
            new: previous + qty,
        };
        record_stock_event(txn, event.product_id, &change, reason.as_reason(), Some(order_id), admin_id)
            .await?;
        written += 1;
    }

    if written > 0 {
        counter!("storefront.stock.restocked", 1);
        info!(order_id = %order_id, rows = written, "Restocked cancelled order");
    }
    Ok(written)
}

/// Manual stock corrections.
#[derive(Clone)]
pub struct InventoryService {
    db: Arc<DbPool>,
}

impl InventoryService {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }

    /// Applies `delta` to a variant (and the product aggregate) or to the product alone.
    ///
    /// Fails with `INSUFFICIENT_STOCK` instead of going below zero.
    #[instrument(skip(self), fields(product_id = %product_id, delta))]
    pub async fn adjust_stock(
        &self,
        product_id: Uuid,
        variant_key: Option<String>,
        delta: i32,
        actor: Actor,
    ) -> Result<i32, ServiceError> {
        if delta == 0 {
            return Err(ServiceError::ValidationError("delta must not be zero".to_string()));
        }

        let txn = self.db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start transaction for stock adjustment");
            ServiceError::db_error(e)
        })?;

        let product_row = lock_product(&txn, product_id).await?;
        let mut changes = Vec::new();

        if let Some(key) = &variant_key {
            let row = VariantEntity::find()
                .filter(product_variant::Column::ProductId.eq(product_id))
                .filter(product_variant::Column::VariantKey.eq(key.clone()))
                .lock_exclusive()
                .one(&txn)
                .await
                .map_err(ServiceError::db_error)?
                .ok_or_else(|| ServiceError::NotFound(format!("Variant {} not found", key)))?;
            let new = row.stock + delta;
            if new < 0 {
                return Err(insufficient(product_id, &format!("variant {}", key)));
            }
            let mut active: product_variant::ActiveModel = row.clone().into();
            active.stock = Set(new);
            active.updated_at = Set(Some(Utc::now()));
            active.update(&txn).await.map_err(ServiceError::db_error)?;
            changes.push(RowChange {
                variant_key: Some(key.clone()),
                previous: row.stock,
                new,
            });
        }

        let new_total = product_row.stock + delta;
        if new_total < 0 {
            return Err(insufficient(product_id, "product aggregate"));
        }
        let mut active: product::ActiveModel = product_row.clone().into();
        active.stock = Set(new_total);
        active.update(&txn).await.map_err(ServiceError::db_error)?;
        changes.push(RowChange {
            variant_key: None,
            previous: product_row.stock,
            new: new_total,
        });

        for change in &changes {
            record_stock_event(&txn, product_id, change, REASON_MANUAL, None, actor.admin_id()).await?;
        }

        txn.commit().await.map_err(|e| {
            error!(error = %e, "Failed to commit stock adjustment");
            ServiceError::db_error(e)
        })?;

        info!(product_id = %product_id, variant_key = ?variant_key, delta, "Stock adjusted");
        Ok(changes.first().map(|c| c.new).unwrap_or(new_total))
    }
}
