use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveModelBehavior, ActiveValue, ActiveValue::Set, ConnectionTrait};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Product entity
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize, Validate)]
#[sea_orm(table_name = "products")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[validate(length(
        min = 1,
        max = 255,
        message = "Product name must be between 1 and 255 characters"
    ))]
    pub name: String,

    /// Base unit price
    #[sea_orm(column_type = "Decimal(Some((12, 2)))")]
    pub price: Decimal,

    /// Aggregate stock across all variants
    pub stock: i32,

    pub is_active: bool,

    /// Configured size options, JSON array of strings
    #[sea_orm(column_type = "Json")]
    pub sizes: Json,

    /// Configured color options, JSON array of strings
    #[sea_orm(column_type = "Json")]
    pub colors: Json,

    /// One stock count per size, shared by every color of that size
    pub share_stock_across_colors: bool,

    #[sea_orm(nullable)]
    pub low_stock_threshold: Option<i32>,

    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Model {
    pub fn size_options(&self) -> Vec<String> {
        option_list(&self.sizes)
    }

    pub fn color_options(&self) -> Vec<String> {
        option_list(&self.colors)
    }

    pub fn has_variant_dimensions(&self) -> bool {
        !self.size_options().is_empty() || !self.color_options().is_empty()
    }
}

/// Trimmed, de-duplicated, non-empty option strings in configured order.
fn option_list(value: &Json) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    if let Some(items) = value.as_array() {
        for item in items {
            if let Some(s) = item.as_str() {
                let s = s.trim();
                if !s.is_empty() && !out.iter().any(|existing| existing == s) {
                    out.push(s.to_string());
                }
            }
        }
    }
    out
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::product_variant::Entity")]
    Variants,
}

impl Related<super::product_variant::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Variants.def()
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
        }

        Ok(active_model)
    }
}
