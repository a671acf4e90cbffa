use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveModelBehavior, ActiveValue, ActiveValue::Set, ConnectionTrait};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fulfillment side of the order.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OrderStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "shipped")]
    Shipped,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

/// Money side of the order.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PaymentStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "paid")]
    Paid,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "partial_refunded")]
    PartialRefunded,
    #[sea_orm(string_value = "refunded")]
    Refunded,
}

impl PaymentStatus {
    /// States from which a successful gateway confirmation may still be applied.
    pub fn awaiting_payment(&self) -> bool {
        matches!(self, PaymentStatus::Pending | PaymentStatus::Failed)
    }

    pub fn is_refundable(&self) -> bool {
        matches!(self, PaymentStatus::Paid | PaymentStatus::PartialRefunded)
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// `TRK-XXXX-XXXX-XXXX`, unique
    #[sea_orm(unique)]
    pub tracking_code: String,

    pub customer_id: Option<Uuid>,
    pub buyer_name: String,
    pub buyer_surname: String,
    pub buyer_email: String,
    pub buyer_phone: String,
    pub buyer_identity_number: String,
    pub buyer_ip: String,

    #[sea_orm(column_type = "Json")]
    pub shipping_address: Json,
    #[sea_orm(column_type = "Json")]
    pub billing_address: Json,

    /// Frozen at creation
    #[sea_orm(column_type = "Decimal(Some((12, 2)))")]
    pub total_amount: Decimal,
    /// Never decreases, never exceeds `total_amount`
    #[sea_orm(column_type = "Decimal(Some((12, 2)))")]
    pub refunded_amount: Decimal,
    pub currency: String,

    pub status: OrderStatus,
    pub payment_status: PaymentStatus,

    pub payment_token: Option<String>,
    pub payment_id: Option<String>,
    pub payment_error_code: Option<String>,
    pub payment_error_message: Option<String>,
    pub payment_error_group: Option<String>,
    #[sea_orm(column_type = "Json", nullable)]
    pub payment_error_raw: Option<Json>,

    pub refund_in_progress: bool,

    /// Gateway per-transaction breakdown, persisted once known
    #[sea_orm(column_type = "Json", nullable)]
    pub payment_items: Option<Json>,

    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub version: i32,
}

impl Model {
    pub fn remaining_refundable(&self) -> Decimal {
        (self.total_amount - self.refunded_amount).max(Decimal::ZERO)
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItem,
    #[sea_orm(has_many = "super::order_refund::Entity")]
    OrderRefund,
    #[sea_orm(has_many = "super::order_payment_event::Entity")]
    OrderPaymentEvent,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItem.def()
    }
}

impl Related<super::order_refund::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderRefund.def()
    }
}

impl Related<super::order_payment_event::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderPaymentEvent.def()
    }
}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C: ConnectionTrait>(self, _db: &C, insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        let mut active_model = self;
        let now = Utc::now();

        if insert {
            if let ActiveValue::NotSet = active_model.created_at {
                active_model.created_at = Set(now);
            }
        } else {
            active_model.updated_at = Set(Some(now));
            // Optimistic version bump on every row write
            if let ActiveValue::Unchanged(v) | ActiveValue::Set(v) = active_model.version {
                active_model.version = Set(v + 1);
            }
        }

        Ok(active_model)
    }
}
