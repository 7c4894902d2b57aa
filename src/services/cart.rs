//! Carts, their totals, and the immutable order intent taken at checkout.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, ModelTrait, QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use super::catalog::{Catalog, CatalogOffer};
use super::commission::{self, Commission};
use super::round_money;
use crate::config::AppConfig;
use crate::db;
use crate::entities::{cart, cart_item, Cart, CartItem, CartStatus};
use crate::errors::{ServiceError, StaleItem, StaleReason};

/// Shipping and tax settings applied to every cart.
#[derive(Debug, Clone, PartialEq)]
pub struct PricingRules {
    pub tax_rate: Decimal,
    pub shipping_flat_amount: Decimal,
    pub free_shipping_threshold: Option<Decimal>,
}

impl PricingRules {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            tax_rate: config.tax_rate(),
            shipping_flat_amount: config.shipping_flat_amount,
            free_shipping_threshold: config.free_shipping_threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CartTotals {
    pub subtotal: Decimal,
    pub discount_amount: Decimal,
    pub shipping_amount: Decimal,
    pub tax_amount: Decimal,
    pub total_amount: Decimal,
}

/// Derives all order amounts from a subtotal and a requested discount.
///
/// Every component is rounded to cents before summing, so
/// `total = subtotal - discount + shipping + tax` holds exactly.
pub fn compute_totals(subtotal: Decimal, discount: Decimal, rules: &PricingRules) -> CartTotals {
    let subtotal = round_money(subtotal);
    let discount_amount = round_money(discount.max(Decimal::ZERO).min(subtotal));
    let discounted = subtotal - discount_amount;

    let free_shipping = rules
        .free_shipping_threshold
        .map_or(false, |threshold| discounted >= threshold);
    let shipping_amount = if free_shipping {
        Decimal::ZERO
    } else {
        round_money(rules.shipping_flat_amount)
    };
    let tax_amount = round_money(discounted * rules.tax_rate);

    CartTotals {
        subtotal,
        discount_amount,
        shipping_amount,
        tax_amount,
        total_amount: discounted + shipping_amount + tax_amount,
    }
}

/// One validated line of an [`OrderIntent`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntentLine {
    pub cart_item_id: Uuid,
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub artisan_id: Uuid,
    pub title: String,
    pub sku: Option<String>,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub commission: Commission,
    pub product_snapshot: serde_json::Value,
    pub customization_notes: Option<String>,
}

/// Cart contents validated against the catalog at one point in time.
/// Read-only once taken; checkout builds the order from it alone.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderIntent {
    cart_id: Uuid,
    cart_version: i32,
    currency: String,
    coupon_code: Option<String>,
    lines: Vec<IntentLine>,
    totals: CartTotals,
    taken_at: DateTime<Utc>,
}

impl OrderIntent {
    pub fn cart_id(&self) -> Uuid {
        self.cart_id
    }

    /// Cart version the lines were read at.
    pub fn cart_version(&self) -> i32 {
        self.cart_version
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn coupon_code(&self) -> Option<&str> {
        self.coupon_code.as_deref()
    }

    pub fn lines(&self) -> &[IntentLine] {
        &self.lines
    }

    pub fn totals(&self) -> CartTotals {
        self.totals
    }

    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CartView {
    #[schema(value_type = Object)]
    pub cart: cart::Model,
    #[schema(value_type = Vec<Object>)]
    pub items: Vec<cart_item::Model>,
    pub totals: CartTotals,
}

#[derive(Debug, Clone, Default, Deserialize, Validate, ToSchema)]
pub struct CreateCartRequest {
    #[validate(length(min = 1, max = 128))]
    pub session_id: Option<String>,
    #[validate(length(equal = 3))]
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct AddItemRequest {
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    #[validate(range(min = 1, max = 1000))]
    pub quantity: i32,
    #[validate(length(max = 2000))]
    pub customization_notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct UpdateItemRequest {
    #[validate(range(min = 0, max = 1000))]
    pub quantity: i32,
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct ApplyCouponRequest {
    #[validate(length(min = 1, max = 64))]
    pub code: String,
}

/// Cart mutations and validation against the live catalog.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    catalog: Arc<dyn Catalog>,
    config: Arc<AppConfig>,
}

impl CartService {
    pub fn new(db: Arc<DatabaseConnection>, catalog: Arc<dyn Catalog>, config: Arc<AppConfig>) -> Self {
        Self { db, catalog, config }
    }

    fn pricing(&self) -> PricingRules {
        PricingRules::from_config(&self.config)
    }

    #[instrument(skip(self, request))]
    pub async fn create_cart(
        &self,
        user_id: Option<Uuid>,
        request: CreateCartRequest,
    ) -> Result<CartView, ServiceError> {
        request.validate()?;
        if user_id.is_none() && request.session_id.is_none() {
            return Err(ServiceError::ValidationError(
                "Guest carts require a session_id".to_string(),
            ));
        }

        let now = Utc::now();
        let cart = cart::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            session_id: Set(request.session_id),
            currency: Set(request
                .currency
                .map(|c| c.to_uppercase())
                .unwrap_or_else(|| self.config.default_currency.clone())),
            applied_coupon_code: Set(None),
            discount_amount: Set(Decimal::ZERO),
            status: Set(CartStatus::Active),
            version: Set(1),
            expires_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await?;

        info!(cart_id = %cart.id, "cart created");
        self.view(cart).await
    }

    pub async fn get_cart(&self, cart_id: Uuid) -> Result<CartView, ServiceError> {
        let cart = load_cart(&*self.db, cart_id).await?;
        self.view(cart).await
    }

    /// Adds a product at its current price. A line for the same product and
    /// variant is merged and re-priced.
    #[instrument(skip(self, request), fields(cart_id = %cart_id, product_id = %request.product_id))]
    pub async fn add_item(
        &self,
        cart_id: Uuid,
        request: AddItemRequest,
    ) -> Result<CartView, ServiceError> {
        request.validate()?;
        let cart = load_active_cart(&*self.db, cart_id).await?;
        let offer = self.active_offer(request.product_id, request.variant_id).await?;
        if offer.currency != cart.currency {
            return Err(ServiceError::ValidationError(format!(
                "Product is sold in {}, cart uses {}",
                offer.currency, cart.currency
            )));
        }

        let started = Instant::now();
        let txn = db::begin(&self.db, "cart_update").await?;
        let conn = &txn;
        let cart = claim_active_cart(conn, cart_id).await?;

        let existing = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .filter(cart_item::Column::ProductId.eq(request.product_id))
            .filter(match request.variant_id {
                Some(variant_id) => cart_item::Column::VariantId.eq(variant_id),
                None => cart_item::Column::VariantId.is_null(),
            })
            .one(conn)
            .await?;

        let quantity = existing.as_ref().map_or(0, |item| item.quantity) + request.quantity;
        ensure_supply(&offer, quantity)?;

        let now = Utc::now();
        match existing {
            Some(item) => {
                let mut active: cart_item::ActiveModel = item.into();
                active.quantity = Set(quantity);
                active.unit_price = Set(offer.unit_price);
                active.total_price = Set(offer.unit_price * Decimal::from(quantity));
                if request.customization_notes.is_some() {
                    active.customization_notes = Set(request.customization_notes);
                }
                active.updated_at = Set(now);
                active.update(conn).await?;
            }
            None => {
                cart_item::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    cart_id: Set(cart_id),
                    product_id: Set(request.product_id),
                    variant_id: Set(request.variant_id),
                    quantity: Set(quantity),
                    unit_price: Set(offer.unit_price),
                    total_price: Set(offer.unit_price * Decimal::from(quantity)),
                    customization_notes: Set(request.customization_notes),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(conn)
                .await?;
            }
        }

        let view = self.after_change(conn, cart).await?;
        db::commit(txn, "cart_update", started).await?;
        Ok(view)
    }

    /// Sets a line's quantity; zero removes the line.
    #[instrument(skip(self))]
    pub async fn update_item_quantity(
        &self,
        cart_id: Uuid,
        item_id: Uuid,
        quantity: i32,
    ) -> Result<CartView, ServiceError> {
        if quantity < 0 {
            return Err(ServiceError::ValidationError(
                "Quantity cannot be negative".to_string(),
            ));
        }
        load_active_cart(&*self.db, cart_id).await?;
        let item = load_item(&*self.db, cart_id, item_id).await?;
        if quantity > 0 {
            let offer = self.active_offer(item.product_id, item.variant_id).await?;
            ensure_supply(&offer, quantity)?;
        }

        let started = Instant::now();
        let txn = db::begin(&self.db, "cart_update").await?;
        let conn = &txn;
        let cart = claim_active_cart(conn, cart_id).await?;
        let item = load_item(conn, cart_id, item_id).await?;

        if quantity == 0 {
            item.delete(conn).await?;
        } else {
            let unit_price = item.unit_price;
            let mut active: cart_item::ActiveModel = item.into();
            active.quantity = Set(quantity);
            active.total_price = Set(unit_price * Decimal::from(quantity));
            active.updated_at = Set(Utc::now());
            active.update(conn).await?;
        }

        let view = self.after_change(conn, cart).await?;
        db::commit(txn, "cart_update", started).await?;
        Ok(view)
    }

    #[instrument(skip(self))]
    pub async fn apply_coupon(&self, cart_id: Uuid, code: &str) -> Result<CartView, ServiceError> {
        let rule = self
            .config
            .find_coupon(code)
            .ok_or_else(|| ServiceError::ValidationError(format!("Unknown coupon '{}'", code)))?;

        let started = Instant::now();
        let txn = db::begin(&self.db, "cart_update").await?;
        let cart = claim_active_cart(&txn, cart_id).await?;
        let items = load_items(&txn, cart_id).await?;
        let discount = rule.discount_for(line_subtotal(&items));

        let mut active: cart::ActiveModel = cart.into();
        active.applied_coupon_code = Set(Some(rule.code.clone()));
        active.discount_amount = Set(discount);
        active.updated_at = Set(Utc::now());
        let cart = active.update(&txn).await?;
        db::commit(txn, "cart_update", started).await?;

        info!(cart_id = %cart_id, coupon = %rule.code, %discount, "coupon applied");
        self.view(cart).await
    }

    /// Validates every line against the catalog and freezes the result.
    ///
    /// Fails with `CartStale` listing each line whose price moved, whose product
    /// is no longer sold, or whose quantity can no longer be supplied.
    #[instrument(skip(self, conn))]
    pub async fn snapshot<C>(&self, conn: &C, cart_id: Uuid) -> Result<OrderIntent, ServiceError>
    where
        C: ConnectionTrait,
    {
        let cart = load_active_cart(conn, cart_id).await?;
        let items = load_items(conn, cart_id).await?;
        if items.is_empty() {
            return Err(ServiceError::ValidationError("Cart is empty".to_string()));
        }

        let rate = self.config.commission_rate();
        let mut stale = Vec::new();
        let mut lines = Vec::with_capacity(items.len());

        for item in items {
            let stale_item = |reason| StaleItem {
                item_id: item.id,
                product_id: item.product_id,
                variant_id: item.variant_id,
                reason,
            };

            let offer = match self.catalog.offer(item.product_id, item.variant_id).await? {
                Some(offer) if offer.active => offer,
                _ => {
                    stale.push(stale_item(StaleReason::ProductInactive));
                    continue;
                }
            };
            if round_money(offer.unit_price) != round_money(item.unit_price) {
                stale.push(stale_item(StaleReason::PriceChanged {
                    expected: item.unit_price,
                    current: offer.unit_price,
                }));
                continue;
            }
            if !offer.can_supply(item.quantity) {
                stale.push(stale_item(StaleReason::Unavailable {
                    requested: item.quantity,
                    available: offer.available.unwrap_or(0).max(0),
                }));
                continue;
            }

            lines.push(IntentLine {
                cart_item_id: item.id,
                product_id: item.product_id,
                variant_id: item.variant_id,
                artisan_id: offer.artisan_id,
                title: offer.title,
                sku: offer.sku,
                quantity: item.quantity,
                unit_price: item.unit_price,
                commission: commission::compute(item.unit_price, item.quantity, rate),
                product_snapshot: offer.snapshot,
                customization_notes: item.customization_notes,
            });
        }

        if !stale.is_empty() {
            warn!(cart_id = %cart_id, stale = stale.len(), "cart is stale");
            return Err(ServiceError::CartStale(stale));
        }

        let subtotal: Decimal = lines
            .iter()
            .map(|line| line.commission.total_price)
            .sum();
        let discount = self.coupon_discount(&cart, subtotal);
        let totals = compute_totals(subtotal, discount, &self.pricing());

        Ok(OrderIntent {
            cart_id: cart.id,
            cart_version: cart.version,
            currency: cart.currency,
            coupon_code: cart.applied_coupon_code,
            lines,
            totals,
            taken_at: Utc::now(),
        })
    }

    /// Brings a stale cart back in line with the catalog: re-prices lines,
    /// clamps quantities to what is available, and drops lines that cannot be sold.
    #[instrument(skip(self))]
    pub async fn refresh(&self, cart_id: Uuid) -> Result<CartView, ServiceError> {
        load_active_cart(&*self.db, cart_id).await?;
        let mut offers = Vec::new();
        for item in load_items(&*self.db, cart_id).await? {
            let offer = self.catalog.offer(item.product_id, item.variant_id).await?;
            offers.push((item, offer));
        }

        let started = Instant::now();
        let txn = db::begin(&self.db, "cart_refresh").await?;
        let conn = &txn;
        let cart = claim_active_cart(conn, cart_id).await?;
        let now = Utc::now();

        for (item, offer) in offers {
            let offer = match offer {
                Some(offer) if offer.active => offer,
                _ => {
                    info!(item_id = %item.id, "dropping unavailable cart item");
                    item.delete(conn).await?;
                    continue;
                }
            };

            let quantity = match offer.available {
                Some(available) => item.quantity.min(available),
                None => item.quantity,
            };
            if quantity <= 0 {
                info!(item_id = %item.id, "dropping out-of-stock cart item");
                item.delete(conn).await?;
                continue;
            }

            if quantity != item.quantity
                || round_money(offer.unit_price) != round_money(item.unit_price)
            {
                let mut active: cart_item::ActiveModel = item.into();
                active.quantity = Set(quantity);
                active.unit_price = Set(offer.unit_price);
                active.total_price = Set(offer.unit_price * Decimal::from(quantity));
                active.updated_at = Set(now);
                active.update(conn).await?;
            }
        }

        let view = self.after_change(conn, cart).await?;
        db::commit(txn, "cart_refresh", started).await?;
        Ok(view)
    }

    /// Marks the cart converted for `user_id`, provided it is still active at
    /// the version `intent` was taken from. Any line or coupon change since the
    /// snapshot fails with `ConcurrentModification`.
    pub async fn convert<C>(
        &self,
        conn: &C,
        intent: &OrderIntent,
        user_id: Uuid,
    ) -> Result<(), ServiceError>
    where
        C: ConnectionTrait,
    {
        let converted = Cart::update_many()
            .col_expr(cart::Column::Status, Expr::value(CartStatus::Converted))
            .col_expr(cart::Column::UserId, Expr::value(Some(user_id)))
            .col_expr(cart::Column::Version, Expr::col(cart::Column::Version).add(1))
            .col_expr(cart::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(cart::Column::Id.eq(intent.cart_id))
            .filter(cart::Column::Status.eq(CartStatus::Active))
            .filter(cart::Column::Version.eq(intent.cart_version))
            .exec(conn)
            .await?
            .rows_affected;
        if converted == 0 {
            warn!(cart_id = %intent.cart_id, version = intent.cart_version, "cart changed during checkout");
            return Err(ServiceError::ConcurrentModification(intent.cart_id));
        }
        Ok(())
    }

    async fn active_offer(
        &self,
        product_id: Uuid,
        variant_id: Option<Uuid>,
    ) -> Result<CatalogOffer, ServiceError> {
        let offer = self
            .catalog
            .offer(product_id, variant_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))?;
        if !offer.active {
            return Err(ServiceError::ValidationError(format!(
                "Product {} is not for sale",
                product_id
            )));
        }
        Ok(offer)
    }

    fn coupon_discount(&self, cart: &cart::Model, subtotal: Decimal) -> Decimal {
        match cart.applied_coupon_code.as_deref() {
            Some(code) => match self.config.find_coupon(code) {
                Some(rule) => rule.discount_for(subtotal),
                None => {
                    warn!(cart_id = %cart.id, coupon = code, "coupon no longer configured");
                    Decimal::ZERO
                }
            },
            None => Decimal::ZERO,
        }
    }

    /// Re-derives the stored coupon discount after the lines changed.
    async fn after_change<C>(&self, conn: &C, cart: cart::Model) -> Result<CartView, ServiceError>
    where
        C: ConnectionTrait,
    {
        let items = load_items(conn, cart.id).await?;
        let discount = self.coupon_discount(&cart, line_subtotal(&items));

        let mut active: cart::ActiveModel = cart.into();
        active.discount_amount = Set(discount);
        active.updated_at = Set(Utc::now());
        let cart = active.update(conn).await?;

        let totals = compute_totals(line_subtotal(&items), discount, &self.pricing());
        Ok(CartView {
            cart,
            items,
            totals,
        })
    }

    async fn view(&self, cart: cart::Model) -> Result<CartView, ServiceError> {
        let items = load_items(&*self.db, cart.id).await?;
        let totals = compute_totals(line_subtotal(&items), cart.discount_amount, &self.pricing());
        Ok(CartView {
            cart,
            items,
            totals,
        })
    }
}

fn ensure_supply(offer: &CatalogOffer, quantity: i32) -> Result<(), ServiceError> {
    if offer.can_supply(quantity) {
        Ok(())
    } else {
        Err(ServiceError::InsufficientStock(format!(
            "{} requested, {} available for product {}",
            quantity,
            offer.available.unwrap_or(0).max(0),
            offer.product_id
        )))
    }
}

fn line_subtotal(items: &[cart_item::Model]) -> Decimal {
    items.iter().map(|item| item.total_price).sum()
}

pub(crate) async fn load_cart<C>(conn: &C, cart_id: Uuid) -> Result<cart::Model, ServiceError>
where
    C: ConnectionTrait,
{
    Cart::find_by_id(cart_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))
}

async fn load_active_cart<C>(conn: &C, cart_id: Uuid) -> Result<cart::Model, ServiceError>
where
    C: ConnectionTrait,
{
    let cart = load_cart(conn, cart_id).await?;
    if cart.status != CartStatus::Active {
        return Err(ServiceError::ValidationError(format!(
            "Cart {} is no longer active",
            cart_id
        )));
    }
    Ok(cart)
}

/// Bumps the version of an active cart and returns it. Every line or coupon
/// change claims the cart first.
async fn claim_active_cart<C>(conn: &C, cart_id: Uuid) -> Result<cart::Model, ServiceError>
where
    C: ConnectionTrait,
{
    let rows = Cart::update_many()
        .col_expr(cart::Column::Version, Expr::col(cart::Column::Version).add(1))
        .col_expr(cart::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(cart::Column::Id.eq(cart_id))
        .filter(cart::Column::Status.eq(CartStatus::Active))
        .exec(conn)
        .await?
        .rows_affected;
    let cart = load_active_cart(conn, cart_id).await?;
    if rows == 0 {
        return Err(ServiceError::ConcurrentModification(cart_id));
    }
    Ok(cart)
}

async fn load_item<C>(conn: &C, cart_id: Uuid, item_id: Uuid) -> Result<cart_item::Model, ServiceError>
where
    C: ConnectionTrait,
{
    CartItem::find_by_id(item_id)
        .filter(cart_item::Column::CartId.eq(cart_id))
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Cart item {} not found", item_id)))
}

async fn load_items<C>(conn: &C, cart_id: Uuid) -> Result<Vec<cart_item::Model>, ServiceError>
where
    C: ConnectionTrait,
{
    Ok(CartItem::find()
        .filter(cart_item::Column::CartId.eq(cart_id))
        .order_by_asc(cart_item::Column::CreatedAt)
        .all(conn)
        .await?)
}
