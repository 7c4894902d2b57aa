use async_trait::async_trait;
use rust_decimal::Decimal;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::entities::{product_variant, Product, ProductVariant};
use crate::errors::ServiceError;
use crate::services::inventory::InventoryService;

/// Current sale terms for a product or one of its variants.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogOffer {
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub artisan_id: Uuid,
    pub title: String,
    pub sku: Option<String>,
    pub unit_price: Decimal,
    pub currency: String,
    pub active: bool,
    /// Units that can still be sold; `None` when stock is not limited.
    pub available: Option<i32>,
    /// Frozen copy of the listing, stored on order items.
    pub snapshot: serde_json::Value,
}

impl CatalogOffer {
    pub fn can_supply(&self, quantity: i32) -> bool {
        self.available.map_or(true, |available| available >= quantity)
    }
}

/// Read side of the product catalog used to validate carts.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn offer(
        &self,
        product_id: Uuid,
        variant_id: Option<Uuid>,
    ) -> Result<Option<CatalogOffer>, ServiceError>;
}

/// Catalog backed by the products tables.
#[derive(Clone)]
pub struct DbCatalog {
    db: Arc<DatabaseConnection>,
    inventory: InventoryService,
}

impl DbCatalog {
    pub fn new(db: Arc<DatabaseConnection>, inventory: InventoryService) -> Self {
        Self { db, inventory }
    }
}

#[async_trait]
impl Catalog for DbCatalog {
    async fn offer(
        &self,
        product_id: Uuid,
        variant_id: Option<Uuid>,
    ) -> Result<Option<CatalogOffer>, ServiceError> {
        let db = &*self.db;
        let Some(product) = Product::find_by_id(product_id).one(db).await? else {
            return Ok(None);
        };

        let variant = match variant_id {
            Some(id) => match ProductVariant::find_by_id(id)
                .filter(product_variant::Column::ProductId.eq(product_id))
                .one(db)
                .await?
            {
                Some(v) => Some(v),
                None => return Ok(None),
            },
            None => None,
        };

        let level = self.inventory.availability(db, product_id, variant_id).await?;

        let unit_price = variant
            .as_ref()
            .and_then(|v| v.price)
            .unwrap_or(product.price);
        let active = product.is_active() && variant.as_ref().map_or(true, |v| v.is_active);
        let title = match &variant {
            Some(v) => format!("{} - {}", product.title, v.title),
            None => product.title.clone(),
        };
        let sku = variant
            .as_ref()
            .and_then(|v| v.sku.clone())
            .or_else(|| product.sku.clone());

        let snapshot = json!({
            "product_id": product.id,
            "variant_id": variant_id,
            "title": title,
            "sku": sku,
            "unit_price": unit_price,
            "currency": product.currency,
            "artisan_id": product.artisan_id,
            "variant": variant.as_ref().map(|v| json!({ "title": v.title, "sku": v.sku })),
        });

        Ok(Some(CatalogOffer {
            product_id,
            variant_id,
            artisan_id: product.artisan_id,
            title,
            sku,
            unit_price,
            currency: product.currency,
            active,
            available: level.sellable(),
            snapshot,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn offer(available: Option<i32>) -> CatalogOffer {
        CatalogOffer {
            product_id: Uuid::new_v4(),
            variant_id: None,
            artisan_id: Uuid::new_v4(),
            title: "Raffia basket".into(),
            sku: None,
            unit_price: dec!(1000),
            currency: "MGA".into(),
            active: true,
            available,
            snapshot: serde_json::Value::Null,
        }
    }

    #[test]
    fn unlimited_offer_supplies_any_quantity() {
        assert!(offer(None).can_supply(10_000));
        assert!(offer(Some(2)).can_supply(2));
        assert!(!offer(Some(2)).can_supply(3));
    }
}
