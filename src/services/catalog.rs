//! Price and stock resolution for cart lines.
//!
//! Everything here except the loader is pure: it reads a product and its
//! variant rows and never touches the database.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter};
use tracing::{error, instrument};
use uuid::Uuid;

use crate::db::DbPool;
use crate::entities::product::{self, Entity as ProductEntity, Model as ProductModel};
use crate::entities::product_variant::{self, Entity as VariantEntity, Model as VariantModel};
use crate::errors::ServiceError;

/// Stable encoding of a (size, color) pair; empty components for absent dimensions.
pub fn variant_key(size: &str, color: &str) -> String {
    format!("{}|{}", size, color)
}

/// Resolved size/color for one cart line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub size: String,
    pub color: String,
    pub variant_key: String,
}

/// Which physical stock count a line draws from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StockPool {
    /// Every color of one size, shared
    SharedSize { product_id: Uuid, size: String },
    Variant { product_id: Uuid, variant_key: String },
    Product { product_id: Uuid },
}

/// A product with its variant rows, loaded once per request.
#[derive(Debug, Clone)]
pub struct ProductStock {
    pub product: ProductModel,
    pub variants: Vec<VariantModel>,
}

impl ProductStock {
    pub fn variant(&self, key: &str) -> Option<&VariantModel> {
        self.variants.iter().find(|v| v.variant_key == key)
    }

    pub fn size_pool(&self, size: &str) -> impl Iterator<Item = &VariantModel> {
        let size = size.to_string();
        self.variants.iter().filter(move |v| v.size == size)
    }
}

fn clean(input: Option<&str>) -> Option<&str> {
    input.map(str::trim).filter(|s| !s.is_empty())
}

fn pick<E>(
    options: &[String],
    requested: Option<&str>,
    missing: E,
    invalid: impl FnOnce(String) -> E,
) -> Result<String, E> {
    if options.is_empty() {
        // Dimension not configured: client input is ignored
        return Ok(String::new());
    }
    match clean(requested) {
        Some(value) if options.iter().any(|o| o == value) => Ok(value.to_string()),
        Some(value) => Err(invalid(value.to_string())),
        None if options.len() == 1 => Ok(options[0].clone()),
        None => Err(missing),
    }
}

/// Resolves the size/color a line refers to.
pub fn resolve_selection(
    product: &ProductModel,
    requested_size: Option<&str>,
    requested_color: Option<&str>,
) -> Result<Selection, ServiceError> {
    let size = pick(
        &product.size_options(),
        requested_size,
        ServiceError::MissingSize,
        ServiceError::InvalidSize,
    )?;
    let color = pick(
        &product.color_options(),
        requested_color,
        ServiceError::MissingColor,
        ServiceError::InvalidColor,
    )?;
    let variant_key = variant_key(&size, &color);
    Ok(Selection {
        size,
        color,
        variant_key,
    })
}

/// Stock pool a selection draws from.
pub fn stock_pool(stock: &ProductStock, key: &str, selected_size: &str) -> StockPool {
    let product_id = stock.product.id;
    if stock.product.share_stock_across_colors
        && !selected_size.is_empty()
        && stock.size_pool(selected_size).next().is_some()
    {
        return StockPool::SharedSize {
            product_id,
            size: selected_size.to_string(),
        };
    }
    if stock.variant(key).is_some() {
        return StockPool::Variant {
            product_id,
            variant_key: key.to_string(),
        };
    }
    StockPool::Product { product_id }
}

/// Units available for a selection.
///
/// Shared pools report the minimum across the size's colors, whichever color
/// was chosen.
pub fn resolve_availability(stock: &ProductStock, key: &str, selected_size: &str) -> i32 {
    match stock_pool(stock, key, selected_size) {
        StockPool::SharedSize { size, .. } => stock
            .size_pool(&size)
            .map(|v| v.stock)
            .min()
            .unwrap_or(0)
            .max(0),
        StockPool::Variant { variant_key, .. } => stock
            .variant(&variant_key)
            .map(|v| v.stock.max(0))
            .unwrap_or(0),
        StockPool::Product { .. } => stock.product.stock.max(0),
    }
}

/// Variant override if present and non-negative, else the base price.
pub fn resolve_unit_price(stock: &ProductStock, key: &str) -> Decimal {
    stock
        .variant(key)
        .and_then(VariantModel::price_override)
        .unwrap_or(stock.product.price)
}

/// Loads products and their variants for a set of ids.
#[instrument(skip(conn, product_ids), fields(count = product_ids.len()))]
pub async fn load_products<C: ConnectionTrait>(
    conn: &C,
    product_ids: &[Uuid],
) -> Result<HashMap<Uuid, ProductStock>, ServiceError> {
    let products = ProductEntity::find()
        .filter(product::Column::Id.is_in(product_ids.iter().copied()))
        .all(conn)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to load products");
            ServiceError::db_error(e)
        })?;

    let variants = VariantEntity::find()
        .filter(product_variant::Column::ProductId.is_in(product_ids.iter().copied()))
        .all(conn)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to load product variants");
            ServiceError::db_error(e)
        })?;

    let mut by_product: HashMap<Uuid, Vec<VariantModel>> = HashMap::new();
    for v in variants {
        by_product.entry(v.product_id).or_default().push(v);
    }

    Ok(products
        .into_iter()
        .map(|p| {
            let variants = by_product.remove(&p.id).unwrap_or_default();
            (
                p.id,
                ProductStock {
                    product: p,
                    variants,
                },
            )
        })
        .collect())
}

/// Read-only catalog lookups for callers outside an order transaction.
#[derive(Clone)]
pub struct CatalogService {
    db: Arc<DbPool>,
}

impl CatalogService {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }

    /// Quote for one line: selection, unit price and current availability.
    #[instrument(skip(self), fields(product_id = %product_id))]
    pub async fn quote(
        &self,
        product_id: Uuid,
        size: Option<&str>,
        color: Option<&str>,
    ) -> Result<(Selection, Decimal, i32), ServiceError> {
        let mut loaded = load_products(&*self.db, &[product_id]).await?;
        let stock = loaded
            .remove(&product_id)
            .filter(|s| s.product.is_active)
            .ok_or(ServiceError::ProductUnavailable(product_id))?;
        let selection = resolve_selection(&stock.product, size, color)?;
        let price = resolve_unit_price(&stock, &selection.variant_key);
        let available = resolve_availability(&stock, &selection.variant_key, &selection.size);
        Ok((selection, price, available))
    }
}
