use axum::{routing::get, Json, Router};
use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Artizaho API",
        version = "1.0.0",
        description = r#"
# Artizaho Marketplace API

Carts, checkout, orders and payments for a marketplace of handmade goods.

## Authentication

Cart endpoints accept guests. Checkout, orders and admin endpoints need a JWT:

```
Authorization: Bearer <your-jwt-token>
```

## Money

Amounts are decimal strings in the cart or order currency, rounded to two places.

## Payment callbacks

`POST /api/v1/payments/webhook` is signed with HMAC-SHA256 over `{timestamp}.{body}`,
sent in `X-Timestamp` and `X-Signature`.
        "#,
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development")
    ),
    tags(
        (name = "Carts", description = "Cart editing and pricing"),
        (name = "Checkout", description = "Cart to order conversion"),
        (name = "Orders", description = "Order lifecycle endpoints"),
        (name = "Payments", description = "Payment initiation and gateway callbacks"),
        (name = "Admin", description = "Administrative endpoints")
    ),
    paths(
        // Carts
        crate::handlers::carts::create_cart,
        crate::handlers::carts::get_cart,
        crate::handlers::carts::add_item,
        crate::handlers::carts::update_item,
        crate::handlers::carts::apply_coupon,
        crate::handlers::carts::refresh_cart,
        crate::handlers::carts::checkout,

        // Orders
        crate::handlers::orders::get_order,
        crate::handlers::orders::get_order_history,
        crate::handlers::orders::retry_payment,
        crate::handlers::orders::cancel_order,
        crate::handlers::orders::ship_order,
        crate::handlers::orders::complete_order,
        crate::handlers::orders::request_refund,
        crate::handlers::orders::confirm_refund,

        // Webhooks
        crate::handlers::payment_webhooks::payment_webhook,

        // Admin
        crate::handlers::admin::sweep_reservations,
    ),
    components(
        schemas(
            crate::ResponseMeta,

            // Cart types
            crate::services::cart::CartView,
            crate::services::cart::CartTotals,
            crate::services::cart::CreateCartRequest,
            crate::services::cart::AddItemRequest,
            crate::services::cart::UpdateItemRequest,
            crate::services::cart::ApplyCouponRequest,

            // Checkout and order types
            crate::services::checkout::CheckoutRequest,
            crate::services::checkout::CheckoutResult,
            crate::services::checkout::OrderDetails,
            crate::services::order_state::OrderTransition,
            crate::handlers::orders::TransitionRequest,
            crate::handlers::orders::ShipOrderRequest,
            crate::handlers::orders::RetryPaymentRequest,

            // Payment callback types
            crate::services::payments::PaymentCallback,
            crate::services::payments::CallbackStatus,

            // Error types
            crate::errors::ErrorResponse
        )
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDocV1;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "Bearer",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

/// Serves the generated document at `/api-docs/openapi.json`.
pub fn openapi_routes<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new().route(
        "/api-docs/openapi.json",
        get(|| async { Json(ApiDocV1::openapi()) }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_document_lists_marketplace_paths() {
        let openapi = ApiDocV1::openapi();
        let json = serde_json::to_string_pretty(&openapi).unwrap();
        assert!(json.contains("Artizaho API"));
        assert!(json.contains("/api/v1/carts/{id}/checkout"));
        assert!(json.contains("/api/v1/payments/webhook"));
        assert!(json.contains("Bearer"));
    }
}
