use std::sync::Arc;

use metrics::counter;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    common::{round_money, Address},
    config::GatewayConfig,
    db::DbPool,
    entities::order::{
        ActiveModel as OrderActiveModel, Entity as OrderEntity, Model as OrderModel, OrderStatus,
        PaymentStatus,
    },
    entities::order_item::{self, Entity as OrderItemEntity, Model as OrderItemModel},
    errors::ServiceError,
    gateway::{
        BasketItem, CheckoutGateway, CheckoutSession, GatewayAddress, GatewayBuyer, GatewayError,
        InitiateRequest,
    },
    services::orders::{append_payment_event, lock_order},
};

const BASKET_CATEGORY: &str = "General";

fn stored_address(value: &serde_json::Value, which: &str) -> Result<Address, ServiceError> {
    serde_json::from_value(value.clone()).map_err(|e| {
        ServiceError::InvalidState(format!("order has an unreadable {} address: {}", which, e))
    })
}

fn gateway_address(address: &Address) -> GatewayAddress {
    GatewayAddress {
        contact_name: address.contact_name.clone(),
        city: address.city.clone(),
        country: address.country.clone(),
        address: address.address.clone(),
        zip_code: address.zip_code.clone(),
    }
}

/// Builds the session-init payload from what the order row stored at creation.
pub fn build_initiate_request(
    order: &OrderModel,
    lines: &[OrderItemModel],
    config: &GatewayConfig,
) -> Result<InitiateRequest, ServiceError> {
    let shipping = stored_address(&order.shipping_address, "shipping")?;
    let billing = stored_address(&order.billing_address, "billing")?;

    let basket_items = lines
        .iter()
        .map(|line| BasketItem {
            id: line.id.to_string(),
            name: line.product_name.clone(),
            category: BASKET_CATEGORY.to_string(),
            price: round_money(line.line_total()),
        })
        .collect();

    Ok(InitiateRequest {
        locale: config.locale.clone(),
        conversation_id: order.id.to_string(),
        basket_id: order.id.to_string(),
        price: order.total_amount,
        paid_price: order.total_amount,
        currency: order.currency.clone(),
        callback_url: config.callback_url.clone(),
        buyer: GatewayBuyer {
            id: order
                .customer_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| order.id.to_string()),
            name: order.buyer_name.clone(),
            surname: order.buyer_surname.clone(),
            gsm_number: order.buyer_phone.clone(),
            email: order.buyer_email.clone(),
            identity_number: order.buyer_identity_number.clone(),
            registration_address: shipping.address.clone(),
            ip: order.buyer_ip.clone(),
            city: shipping.city.clone(),
            country: shipping.country.clone(),
            zip_code: shipping.zip_code.clone(),
        },
        shipping_address: gateway_address(&shipping),
        billing_address: gateway_address(&billing),
        basket_items,
    })
}

/// Starts hosted checkout sessions for existing orders.
#[derive(Clone)]
pub struct CheckoutService {
    db_pool: Arc<DbPool>,
    gateway: Arc<dyn CheckoutGateway>,
    config: GatewayConfig,
}

impl CheckoutService {
    pub fn new(db_pool: Arc<DbPool>, gateway: Arc<dyn CheckoutGateway>, config: GatewayConfig) -> Self {
        Self {
            db_pool,
            gateway,
            config,
        }
    }

    /// Opens a checkout session and stores its token on the order.
    ///
    /// A retry after a failed payment replaces the token; the old one is then
    /// rejected by finalization.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn initiate_checkout(&self, order_id: Uuid) -> Result<CheckoutSession, ServiceError> {
        let db = &*self.db_pool;
        let order = OrderEntity::find_by_id(order_id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::OrderNotFound(order_id.to_string()))?;

        if order.status == OrderStatus::Cancelled || !order.payment_status.awaiting_payment() {
            return Err(ServiceError::InvalidState(format!(
                "order is {}/{}",
                order.status, order.payment_status
            )));
        }

        let lines = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .order_by_asc(order_item::Column::CreatedAt)
            .all(db)
            .await
            .map_err(ServiceError::db_error)?;

        let request = build_initiate_request(&order, &lines, &self.config)?;

        let session = match self.gateway.initiate(&request).await {
            Ok(session) => session,
            Err(err) => {
                counter!("storefront.checkout.initiate_failed", 1);
                if let GatewayError::Rejected { code, message, group } = &err {
                    warn!(order_id = %order_id, code = ?code, message = %message, "Gateway rejected checkout initiation");
                    self.record_initiation_failure(order_id, code.clone(), message.clone(), group.clone())
                        .await;
                } else {
                    error!(order_id = %order_id, error = %err, "Checkout initiation failed");
                }
                return Err(err.into());
            }
        };

        let txn = db.begin().await.map_err(ServiceError::db_error)?;
        let locked = lock_order(&txn, order_id).await?;
        if locked.status == OrderStatus::Cancelled || !locked.payment_status.awaiting_payment() {
            warn!(order_id = %order_id, payment_status = %locked.payment_status, "Order moved on during checkout initiation; token not stored");
            return Err(ServiceError::InvalidState(format!(
                "order is {}/{}",
                locked.status, locked.payment_status
            )));
        }

        let retrying = locked.payment_status == PaymentStatus::Failed;
        let mut active: OrderActiveModel = locked.into();
        active.payment_token = Set(Some(session.token.clone()));
        active.payment_status = Set(PaymentStatus::Pending);
        active.payment_error_code = Set(None);
        active.payment_error_message = Set(None);
        active.payment_error_group = Set(None);
        active.payment_error_raw = Set(None);
        active.update(&txn).await.map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to store payment token");
            ServiceError::db_error(e)
        })?;
        if retrying {
            append_payment_event(
                &txn,
                order_id,
                PaymentStatus::Pending,
                None,
                Some("checkout retried".to_string()),
            )
            .await;
        }
        txn.commit().await.map_err(ServiceError::db_error)?;

        counter!("storefront.checkout.initiated", 1);
        info!(order_id = %order_id, "Checkout session started");
        Ok(session)
    }

    async fn record_initiation_failure(
        &self,
        order_id: Uuid,
        code: Option<String>,
        message: String,
        group: Option<String>,
    ) {
        let result: Result<(), ServiceError> = async {
            let txn = self.db_pool.begin().await.map_err(ServiceError::db_error)?;
            let order = lock_order(&txn, order_id).await?;
            if !order.payment_status.awaiting_payment() {
                return Ok(());
            }
            let mut active: OrderActiveModel = order.into();
            active.payment_error_code = Set(code);
            active.payment_error_message = Set(Some(message));
            active.payment_error_group = Set(group);
            active.update(&txn).await.map_err(ServiceError::db_error)?;
            txn.commit().await.map_err(ServiceError::db_error)
        }
        .await;

        if let Err(e) = result {
            warn!(order_id = %order_id, error = %e, "Could not record initiation failure");
        }
    }
}
