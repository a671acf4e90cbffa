use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reason tag for decrements applied when a payment is confirmed.
pub const REASON_PAYMENT: &str = "iyzico_payment";
/// Reason tag for manual stock corrections.
pub const REASON_MANUAL: &str = "manual";
/// Prefix shared by every cancellation restock reason.
pub const REASON_CANCEL_PREFIX: &str = "order_cancel_";

/// Append-only audit of every stock delta.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "product_stock_events")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub product_id: Uuid,
    /// `None` for the product aggregate row
    pub variant_key: Option<String>,
    pub delta: i32,
    pub previous_stock: i32,
    pub new_stock: i32,
    pub reason: String,
    pub order_id: Option<Uuid>,
    pub admin_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::product::Entity",
        from = "Column::ProductId",
        to = "super::product::Column::Id"
    )]
    Product,
}

impl Related<super::product::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Product.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
