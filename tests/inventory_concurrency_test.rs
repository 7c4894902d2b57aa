//! Stock under contention and reservation expiry.

mod common;

use artizaho_api::entities::{
    inventory_reservation, InventoryReservation, Product, ReservationStatus,
};
use axum::http::Method;
use chrono::{Duration, Utc};
use common::{provider_id_for, response_json, uuid_at, TestApp};
use futures::future::join_all;
use rust_decimal_macros::dec;
use sea_orm::{sea_query::Expr, ColumnTrait, EntityTrait, QueryFilter};
use serde_json::json;
use uuid::Uuid;

async fn stock_of(app: &TestApp, product_id: Uuid) -> (i32, i32) {
    let product = Product::find_by_id(product_id)
        .one(app.db())
        .await
        .unwrap()
        .unwrap();
    (product.stock_quantity, product.reserved_quantity)
}

async fn reservations_of(app: &TestApp, order_id: Uuid) -> Vec<inventory_reservation::Model> {
    InventoryReservation::find()
        .filter(inventory_reservation::Column::OrderId.eq(order_id))
        .all(app.db())
        .await
        .unwrap()
}

async fn pay(app: &TestApp, payment_id: Uuid) -> serde_json::Value {
    response_json(
        app.send_webhook(json!({
            "provider_payment_id": provider_id_for(payment_id),
            "status": "succeeded",
        }))
        .await,
    )
    .await
}

async fn expire_reservations_of(app: &TestApp, order_id: Uuid) {
    let rows = InventoryReservation::update_many()
        .col_expr(
            inventory_reservation::Column::ExpiresAt,
            Expr::value(Utc::now() - Duration::hours(1)),
        )
        .filter(inventory_reservation::Column::OrderId.eq(order_id))
        .exec(app.db())
        .await
        .unwrap()
        .rows_affected;
    assert!(rows > 0, "order {order_id} holds no reservations");
}

#[tokio::test]
async fn concurrent_checkouts_never_oversell() {
    let app = TestApp::new().await;
    let product = app.seed_product(dec!(300), 3).await;

    let mut buyers = Vec::new();
    for _ in 0..5 {
        let token = app.token_for(Uuid::new_v4(), &[]);
        let cart_id = app.cart_with_item(&token, product.id, 1).await;
        buyers.push((token, cart_id));
    }

    let results = join_all(
        buyers
            .iter()
            .map(|(token, cart_id)| app.checkout(token, *cart_id)),
    )
    .await;

    let placed = results.iter().filter(|(status, _)| *status == 201).count();
    assert_eq!(placed, 3, "results: {results:?}");
    for (status, body) in results.iter().filter(|(status, _)| *status != 201) {
        assert!(
            *status == 409 || *status == 422,
            "unexpected rejection {status}: {body}"
        );
    }

    let product = Product::find_by_id(product.id)
        .one(app.db())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(product.stock_quantity, 3);
    assert_eq!(product.reserved_quantity, 3);

    let active: i32 = InventoryReservation::find()
        .filter(inventory_reservation::Column::ProductId.eq(product.id))
        .filter(inventory_reservation::Column::Status.eq(ReservationStatus::Active))
        .all(app.db())
        .await
        .unwrap()
        .iter()
        .map(|r| r.quantity)
        .sum();
    assert_eq!(active, product.reserved_quantity);
}

#[tokio::test]
async fn admin_sweep_reclaims_expired_reservations() {
    let app = TestApp::new().await;
    let token = app.token_for(Uuid::new_v4(), &[]);
    let product = app.seed_product(dec!(450), 2).await;
    let cart_id = app.cart_with_item(&token, product.id, 2).await;
    let (status, body) = app.checkout(&token, cart_id).await;
    assert_eq!(status, 201, "checkout failed: {body}");
    let order_id = uuid_at(&body["data"]["order"]["order"]["id"]);
    let payment_id = uuid_at(&body["data"]["payment"]["id"]);

    expire_reservations_of(&app, order_id).await;

    let response = app
        .request(Method::POST, "/api/v1/admin/reservations/sweep", None, Some(&token))
        .await;
    assert_eq!(response.status(), 403);

    let response = app
        .request(
            Method::POST,
            "/api/v1/admin/reservations/sweep",
            None,
            Some(&app.admin_token()),
        )
        .await;
    assert_eq!(response.status(), 200);
    let sweep = response_json(response).await;
    assert_eq!(sweep["data"]["expired_count"], 1);

    let reloaded = Product::find_by_id(product.id)
        .one(app.db())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reloaded.reserved_quantity, 0);
    assert_eq!(reloaded.stock_quantity, 2);

    // Nothing else is due, so a second sweep is a no-op.
    let response = app
        .request(
            Method::POST,
            "/api/v1/admin/reservations/sweep",
            None,
            Some(&app.admin_token()),
        )
        .await;
    assert_eq!(response_json(response).await["data"]["expired_count"], 0);

    // The stock is still there, so a late capture re-acquires it.
    let outcome = response_json(
        app.send_webhook(json!({
            "provider_payment_id": provider_id_for(payment_id),
            "status": "succeeded",
        }))
        .await,
    )
    .await;
    assert_eq!(outcome["order_status"], "paid");

    let reloaded = Product::find_by_id(product.id)
        .one(app.db())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reloaded.stock_quantity, 0);
    assert_eq!(reloaded.reserved_quantity, 0);

    let reservation = InventoryReservation::find()
        .filter(inventory_reservation::Column::OrderId.eq(order_id))
        .one(app.db())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reservation.status, ReservationStatus::Committed);
}

#[tokio::test]
async fn capture_after_the_stock_was_resold_requests_a_refund() {
    let app = TestApp::new().await;
    let product = app.seed_product(dec!(2000), 1).await;

    let first = app.token_for(Uuid::new_v4(), &[]);
    let cart_id = app.cart_with_item(&first, product.id, 1).await;
    let (status, body) = app.checkout(&first, cart_id).await;
    assert_eq!(status, 201);
    let first_order = uuid_at(&body["data"]["order"]["order"]["id"]);
    let first_payment = uuid_at(&body["data"]["payment"]["id"]);

    expire_reservations_of(&app, first_order).await;
    app.state.services.inventory.sweep().await.unwrap();

    let second = app.token_for(Uuid::new_v4(), &[]);
    let cart_id = app.cart_with_item(&second, product.id, 1).await;
    let (status, body) = app.checkout(&second, cart_id).await;
    assert_eq!(status, 201, "second buyer should get the reclaimed unit: {body}");

    let outcome = response_json(
        app.send_webhook(json!({
            "provider_payment_id": provider_id_for(first_payment),
            "status": "succeeded",
        }))
        .await,
    )
    .await;
    assert_eq!(outcome["status"], "applied");
    assert_eq!(outcome["order_status"], "refund_pending");
    assert_eq!(outcome["payment_status"], "paid");

    let details = app.order_json(&first, first_order).await;
    assert_eq!(details["order"]["status"], "refund_pending");
    assert_eq!(details["payments"][0]["status"], "succeeded");

    // The second buyer's hold is untouched.
    let reloaded = Product::find_by_id(product.id)
        .one(app.db())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reloaded.stock_quantity, 1);
    assert_eq!(reloaded.reserved_quantity, 1);
}

#[tokio::test]
async fn backordered_products_may_oversell_and_others_may_not() {
    let app = TestApp::new().await;
    let token = app.token_for(Uuid::new_v4(), &[]);

    let limited = app.seed_product(dec!(100), 1).await;
    let cart_id = app.cart_with_item(&token, limited.id, 1).await;
    let response = app
        .request(
            Method::POST,
            &format!("/api/v1/carts/{}/items", cart_id),
            Some(json!({ "product_id": limited.id, "quantity": 1 })),
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), 422, "two of a single unit without backorders");

    let backordered = app.seed_product(dec!(100), 1).await;
    app.set_stock_policy(backordered.id, true, true).await;
    let cart_id = app.cart_with_item(&token, backordered.id, 3).await;
    let (status, body) = app.checkout(&token, cart_id).await;
    assert_eq!(status, 201, "checkout failed: {body}");
    let order_id = uuid_at(&body["data"]["order"]["order"]["id"]);
    let payment_id = uuid_at(&body["data"]["payment"]["id"]);
    assert_eq!(stock_of(&app, backordered.id).await, (1, 3));

    assert_eq!(pay(&app, payment_id).await["order_status"], "paid");
    assert_eq!(stock_of(&app, backordered.id).await, (-2, 0));
    let reservations = reservations_of(&app, order_id).await;
    assert_eq!(reservations[0].status, ReservationStatus::Committed);
    assert!(reservations[0].tracked);

    // The product without backorders never went below zero.
    assert_eq!(stock_of(&app, limited.id).await, (1, 0));
}

#[tokio::test]
async fn untracked_products_leave_the_counters_alone() {
    let app = TestApp::new().await;
    let token = app.token_for(Uuid::new_v4(), &[]);
    let product = app.seed_product(dec!(250), 2).await;
    app.set_stock_policy(product.id, false, false).await;

    let cart_id = app.cart_with_item(&token, product.id, 5).await;
    let (status, body) = app.checkout(&token, cart_id).await;
    assert_eq!(status, 201, "checkout failed: {body}");
    let order_id = uuid_at(&body["data"]["order"]["order"]["id"]);
    let payment_id = uuid_at(&body["data"]["payment"]["id"]);

    let reservations = reservations_of(&app, order_id).await;
    assert_eq!(reservations.len(), 1);
    assert!(!reservations[0].tracked);
    assert_eq!(stock_of(&app, product.id).await, (2, 0));

    assert_eq!(pay(&app, payment_id).await["order_status"], "paid");
    assert_eq!(stock_of(&app, product.id).await, (2, 0));
    assert_eq!(
        reservations_of(&app, order_id).await[0].status,
        ReservationStatus::Committed
    );
}

#[tokio::test]
async fn lapsed_hold_is_reclaimed_by_the_next_reservation() {
    let app = TestApp::new().await;
    let product = app.seed_product(dec!(900), 1).await;

    let first = app.token_for(Uuid::new_v4(), &[]);
    let cart_id = app.cart_with_item(&first, product.id, 1).await;
    let (status, body) = app.checkout(&first, cart_id).await;
    assert_eq!(status, 201);
    let first_order = uuid_at(&body["data"]["order"]["order"]["id"]);
    expire_reservations_of(&app, first_order).await;

    // No sweep runs; the lapsed hold still sits in the counter.
    assert_eq!(stock_of(&app, product.id).await, (1, 1));

    let second = app.token_for(Uuid::new_v4(), &[]);
    let cart_id = app.cart_with_item(&second, product.id, 1).await;
    let (status, body) = app.checkout(&second, cart_id).await;
    assert_eq!(status, 201, "lapsed unit should be available: {body}");
    let second_order = uuid_at(&body["data"]["order"]["order"]["id"]);

    assert_eq!(
        reservations_of(&app, first_order).await[0].status,
        ReservationStatus::Expired
    );
    assert_eq!(
        reservations_of(&app, second_order).await[0].status,
        ReservationStatus::Active
    );
    assert_eq!(stock_of(&app, product.id).await, (1, 1));
}

#[tokio::test]
async fn holds_release_what_they_reserved_when_tracking_is_switched() {
    let app = TestApp::new().await;
    let token = app.token_for(Uuid::new_v4(), &[]);

    // Tracked when reserved, untracked when released.
    let product = app.seed_product(dec!(300), 3).await;
    let cart_id = app.cart_with_item(&token, product.id, 2).await;
    let (status, body) = app.checkout(&token, cart_id).await;
    assert_eq!(status, 201);
    let order_id = uuid_at(&body["data"]["order"]["order"]["id"]);
    assert_eq!(stock_of(&app, product.id).await, (3, 2));

    app.set_stock_policy(product.id, false, false).await;
    let response = app
        .request(
            Method::POST,
            &format!("/api/v1/orders/{}/cancel", order_id),
            None,
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), 200);
    assert_eq!(stock_of(&app, product.id).await, (3, 0));

    // Untracked when reserved, tracked when swept.
    let product = app.seed_product(dec!(300), 3).await;
    app.set_stock_policy(product.id, false, false).await;
    let cart_id = app.cart_with_item(&token, product.id, 2).await;
    let (status, body) = app.checkout(&token, cart_id).await;
    assert_eq!(status, 201);
    let order_id = uuid_at(&body["data"]["order"]["order"]["id"]);
    assert_eq!(stock_of(&app, product.id).await, (3, 0));

    app.set_stock_policy(product.id, true, false).await;
    expire_reservations_of(&app, order_id).await;
    let swept = app.state.services.inventory.sweep().await.unwrap();
    assert_eq!(swept.expired_count, 1);
    assert_eq!(stock_of(&app, product.id).await, (3, 0));
}
