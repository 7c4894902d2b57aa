use chrono::Utc;
use metrics::counter;
use rand::{distributions::Alphanumeric, Rng};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use super::cart::{load_cart, CartService, OrderIntent};
use super::inventory::{InventoryService, ReserveRequest};
use super::order_state::append_history;
use super::payments::PaymentService;
use crate::db;
use crate::entities::{
    order, order_item, payment, FulfillmentStatus, Order, OrderItem, OrderStatus, Payment,
    PaymentStatus,
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};

const ORDER_NUMBER_PREFIX: &str = "ART-";

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct CheckoutRequest {
    #[validate(length(min = 1, max = 64))]
    pub payment_method: String,
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub shipping_address: Option<serde_json::Value>,
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub billing_address: Option<serde_json::Value>,
    #[serde(default)]
    #[validate(length(max = 2000))]
    pub customer_notes: Option<String>,
}

/// An order with its lines and payments, each loaded by explicit query.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct OrderDetails {
    #[schema(value_type = Object)]
    pub order: order::Model,
    #[schema(value_type = Vec<Object>)]
    pub items: Vec<order_item::Model>,
    #[schema(value_type = Vec<Object>)]
    pub payments: Vec<payment::Model>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CheckoutResult {
    pub order: OrderDetails,
    #[schema(value_type = Object)]
    pub payment: payment::Model,
}

/// `ART-` followed by eight uppercase alphanumerics.
pub fn generate_order_number() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(|b| (b as char).to_ascii_uppercase())
        .collect();
    format!("{}{}", ORDER_NUMBER_PREFIX, suffix)
}

pub async fn load_order_details<C>(conn: &C, order_id: Uuid) -> Result<OrderDetails, ServiceError>
where
    C: ConnectionTrait,
{
    let order = Order::find_by_id(order_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
    let items = OrderItem::find()
        .filter(order_item::Column::OrderId.eq(order_id))
        .order_by_asc(order_item::Column::CreatedAt)
        .all(conn)
        .await?;
    let payments = Payment::find()
        .filter(payment::Column::OrderId.eq(order_id))
        .order_by_asc(payment::Column::CreatedAt)
        .all(conn)
        .await?;
    Ok(OrderDetails {
        order,
        items,
        payments,
    })
}

/// Turns a cart into a pending order in one transaction, then charges it.
#[derive(Clone)]
pub struct CheckoutService {
    db: Arc<DatabaseConnection>,
    carts: CartService,
    inventory: InventoryService,
    payments: PaymentService,
    event_sender: EventSender,
}

impl CheckoutService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        carts: CartService,
        inventory: InventoryService,
        payments: PaymentService,
        event_sender: EventSender,
    ) -> Self {
        Self {
            db,
            carts,
            inventory,
            payments,
            event_sender,
        }
    }

    pub async fn order_details(&self, order_id: Uuid) -> Result<OrderDetails, ServiceError> {
        load_order_details(&*self.db, order_id).await
    }

    /// Snapshot, reserve, create the order, convert the cart: all or nothing.
    /// The gateway is called only after the order is committed; a failed charge
    /// leaves the order `pending` with its reservations running out on their own.
    #[instrument(skip(self, request), fields(user_id = %user_id, cart_id = %cart_id))]
    pub async fn checkout(
        &self,
        user_id: Uuid,
        cart_id: Uuid,
        request: CheckoutRequest,
    ) -> Result<CheckoutResult, ServiceError> {
        request.validate()?;

        let cart = load_cart(&*self.db, cart_id).await?;
        if cart.user_id.is_some_and(|owner| owner != user_id) {
            return Err(ServiceError::Forbidden(
                "Cart belongs to another user".to_string(),
            ));
        }

        let order = match self.place_order(user_id, cart_id, &request).await {
            Err(ServiceError::InsufficientStock(reason)) => {
                warn!(%reason, "stock conflict during checkout, sweeping and retrying once");
                let swept = self.inventory.sweep().await?;
                info!(expired = swept.expired_count, "retrying checkout");
                self.place_order(user_id, cart_id, &request).await?
            }
            other => other?,
        };

        counter!("artizaho_checkout.orders_created", 1);
        self.event_sender
            .publish(Event::OrderCreated {
                order_id: order.id,
                order_number: order.order_number.clone(),
            })
            .await;

        let payment = self
            .payments
            .initiate(order.id, user_id, request.payment_method.clone())
            .await?;

        Ok(CheckoutResult {
            order: self.order_details(order.id).await?,
            payment,
        })
    }

    async fn place_order(
        &self,
        user_id: Uuid,
        cart_id: Uuid,
        request: &CheckoutRequest,
    ) -> Result<order::Model, ServiceError> {
        // Catalog reads go through the pool, so the snapshot is taken before the
        // transaction claims a connection. The conversion below fails if the
        // cart moved past the snapshot's version.
        let intent = self.carts.snapshot(&*self.db, cart_id).await?;

        let started = Instant::now();
        let txn = db::begin(&self.db, "checkout").await?;
        let order_id = Uuid::new_v4();

        for line in intent.lines() {
            self.inventory
                .reserve(
                    &txn,
                    ReserveRequest {
                        product_id: line.product_id,
                        variant_id: line.variant_id,
                        quantity: line.quantity,
                        cart_id: Some(cart_id),
                        order_id: Some(order_id),
                    },
                )
                .await?;
        }

        let order = insert_order(&txn, order_id, user_id, &intent, request).await?;
        append_history(
            &txn,
            order.id,
            None,
            OrderStatus::Pending,
            Some(user_id),
            Some("order placed".to_string()),
        )
        .await?;

        self.carts.convert(&txn, &intent, user_id).await?;

        db::commit(txn, "checkout", started).await?;
        info!(
            order_id = %order.id,
            order_number = %order.order_number,
            total = %order.total_amount,
            "order placed"
        );
        Ok(order)
    }
}

async fn insert_order<C>(
    conn: &C,
    order_id: Uuid,
    user_id: Uuid,
    intent: &OrderIntent,
    request: &CheckoutRequest,
) -> Result<order::Model, ServiceError>
where
    C: ConnectionTrait,
{
    let now = Utc::now();
    let totals = intent.totals();
    let order = order::ActiveModel {
        id: Set(order_id),
        order_number: Set(generate_order_number()),
        user_id: Set(user_id),
        cart_id: Set(Some(intent.cart_id())),
        status: Set(OrderStatus::Pending),
        payment_status: Set(PaymentStatus::Pending),
        fulfillment_status: Set(FulfillmentStatus::Unfulfilled),
        currency: Set(intent.currency().to_string()),
        subtotal: Set(totals.subtotal),
        discount_amount: Set(totals.discount_amount),
        shipping_amount: Set(totals.shipping_amount),
        tax_amount: Set(totals.tax_amount),
        total_amount: Set(totals.total_amount),
        coupon_code: Set(intent.coupon_code().map(str::to_string)),
        shipping_address: Set(request.shipping_address.clone()),
        billing_address: Set(request.billing_address.clone()),
        customer_notes: Set(request.customer_notes.clone()),
        tracking_number: Set(None),
        version: Set(1),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(conn)
    .await?;

    for line in intent.lines() {
        order_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            product_id: Set(line.product_id),
            variant_id: Set(line.variant_id),
            artisan_id: Set(line.artisan_id),
            title: Set(line.title.clone()),
            sku: Set(line.sku.clone()),
            quantity: Set(line.quantity),
            unit_price: Set(line.unit_price),
            total_price: Set(line.commission.total_price),
            commission_rate: Set(line.commission.rate),
            commission_amount: Set(line.commission.commission_amount),
            artisan_payout: Set(line.commission.artisan_payout),
            product_snapshot: Set(line.product_snapshot.clone()),
            customization_notes: Set(line.customization_notes.clone()),
            created_at: Set(now),
        }
        .insert(conn)
        .await?;
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_numbers_have_the_marketplace_shape() {
        for _ in 0..50 {
            let number = generate_order_number();
            assert_eq!(number.len(), 12);
            assert!(number.starts_with("ART-"));
            assert!(number[4..]
                .chars()
                .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
        }
    }

    #[test]
    fn checkout_request_requires_payment_method() {
        let request: CheckoutRequest =
            serde_json::from_str(r#"{"payment_method": ""}"#).unwrap();
        assert!(request.validate().is_err());
    }
}
