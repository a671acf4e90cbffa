use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

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
pub enum RefundStatus {
    #[sea_orm(string_value = "requested")]
    Requested,
    #[sea_orm(string_value = "success")]
    Success,
    #[sea_orm(string_value = "failure")]
    Failure,
}

/// Marker prefix for a whole-payment same-day cancel attempt.
pub const CANCEL_MARKER: &str = "CANCEL:";
/// Marker prefix for a payment-id keyed refund attempt.
pub const REFUND_V2_MARKER: &str = "REFUND_V2:";

/// One refund attempt against the gateway. Append-only.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "order_refunds")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub order_id: Uuid,
    /// Gateway transaction id, or `CANCEL:<paymentId>` / `REFUND_V2:<paymentId>`
    pub payment_transaction_id: String,
    #[sea_orm(column_type = "Decimal(Some((12, 2)))")]
    pub amount: Decimal,
    pub currency: String,
    pub status: RefundStatus,
    pub gateway_refund_id: Option<String>,
    pub error_message: Option<String>,
    #[sea_orm(column_type = "Json", nullable)]
    pub raw_response: Option<Json>,
    pub admin_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Model {
    /// Whether this attempt targeted the whole payment rather than one basket transaction.
    pub fn is_whole_payment(&self) -> bool {
        self.payment_transaction_id.starts_with(CANCEL_MARKER)
            || self.payment_transaction_id.starts_with(REFUND_V2_MARKER)
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::order::Entity",
        from = "Column::OrderId",
        to = "super::order::Column::Id"
    )]
    Order,
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Order.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
