use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use uuid::Uuid;
use validator::Validate;

use crate::auth::AuthUser;
use crate::errors::ServiceError;
use crate::services::cart::{
    AddItemRequest, ApplyCouponRequest, CartView, CreateCartRequest, UpdateItemRequest,
};
use crate::services::checkout::{CheckoutRequest, CheckoutResult};
use crate::{ApiResponse, ApiResult, AppState};

/// Cart routes that accept guests (optional auth).
pub fn cart_routes() -> Router<AppState> {
    Router::new()
        .route("/carts", post(create_cart))
        .route("/carts/:id", get(get_cart))
        .route("/carts/:id/items", post(add_item))
        .route("/carts/:id/items/:item_id", put(update_item))
        .route("/carts/:id/coupon", post(apply_coupon))
        .route("/carts/:id/refresh", post(refresh_cart))
}

/// Checkout requires an authenticated buyer.
pub fn checkout_routes() -> Router<AppState> {
    Router::new().route("/carts/:id/checkout", post(checkout))
}

/// Guest carts are reachable by id; owned carts only by their owner or an admin.
fn ensure_cart_access(view: &CartView, user: Option<&AuthUser>) -> Result<(), ServiceError> {
    match (view.cart.user_id, user) {
        (None, _) => Ok(()),
        (Some(owner), Some(user)) if user.can_access(owner) => Ok(()),
        (Some(_), Some(_)) => Err(ServiceError::Forbidden(
            "Cart belongs to another user".to_string(),
        )),
        (Some(_), None) => Err(ServiceError::Unauthorized(
            "Authentication required for this cart".to_string(),
        )),
    }
}

async fn authorized_cart(
    state: &AppState,
    cart_id: Uuid,
    user: Option<&AuthUser>,
) -> Result<CartView, ServiceError> {
    let view = state.services.carts.get_cart(cart_id).await?;
    ensure_cart_access(&view, user)?;
    Ok(view)
}

#[utoipa::path(
    post,
    path = "/api/v1/carts",
    request_body = CreateCartRequest,
    responses(
        (status = 201, description = "Cart created", body = ApiResponse<CartView>),
        (status = 400, description = "Invalid request", body = crate::errors::ErrorResponse),
    ),
    tag = "Carts"
)]
pub async fn create_cart(
    State(state): State<AppState>,
    user: Option<AuthUser>,
    Json(request): Json<CreateCartRequest>,
) -> Result<(StatusCode, Json<ApiResponse<CartView>>), ServiceError> {
    let view = state
        .services
        .carts
        .create_cart(user.map(|u| u.user_id), request)
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(view))))
}

#[utoipa::path(
    get,
    path = "/api/v1/carts/{id}",
    params(("id" = Uuid, Path, description = "Cart ID")),
    responses(
        (status = 200, description = "Cart with totals", body = ApiResponse<CartView>),
        (status = 404, description = "Cart not found", body = crate::errors::ErrorResponse),
    ),
    tag = "Carts"
)]
pub async fn get_cart(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    user: Option<AuthUser>,
) -> ApiResult<CartView> {
    let view = authorized_cart(&state, id, user.as_ref()).await?;
    Ok(Json(ApiResponse::success(view)))
}

#[utoipa::path(
    post,
    path = "/api/v1/carts/{id}/items",
    params(("id" = Uuid, Path, description = "Cart ID")),
    request_body = AddItemRequest,
    responses(
        (status = 200, description = "Item added", body = ApiResponse<CartView>),
        (status = 422, description = "Insufficient stock", body = crate::errors::ErrorResponse),
    ),
    tag = "Carts"
)]
pub async fn add_item(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    user: Option<AuthUser>,
    Json(request): Json<AddItemRequest>,
) -> ApiResult<CartView> {
    request.validate()?;
    authorized_cart(&state, id, user.as_ref()).await?;
    let view = state.services.carts.add_item(id, request).await?;
    Ok(Json(ApiResponse::success(view)))
}

#[utoipa::path(
    put,
    path = "/api/v1/carts/{id}/items/{item_id}",
    params(
        ("id" = Uuid, Path, description = "Cart ID"),
        ("item_id" = Uuid, Path, description = "Cart item ID"),
    ),
    request_body = UpdateItemRequest,
    responses(
        (status = 200, description = "Quantity updated, zero removes the line", body = ApiResponse<CartView>),
    ),
    tag = "Carts"
)]
pub async fn update_item(
    State(state): State<AppState>,
    Path((id, item_id)): Path<(Uuid, Uuid)>,
    user: Option<AuthUser>,
    Json(request): Json<UpdateItemRequest>,
) -> ApiResult<CartView> {
    request.validate()?;
    authorized_cart(&state, id, user.as_ref()).await?;
    let view = state
        .services
        .carts
        .update_item_quantity(id, item_id, request.quantity)
        .await?;
    Ok(Json(ApiResponse::success(view)))
}

#[utoipa::path(
    post,
    path = "/api/v1/carts/{id}/coupon",
    params(("id" = Uuid, Path, description = "Cart ID")),
    request_body = ApplyCouponRequest,
    responses(
        (status = 200, description = "Coupon applied", body = ApiResponse<CartView>),
        (status = 400, description = "Unknown coupon", body = crate::errors::ErrorResponse),
    ),
    tag = "Carts"
)]
pub async fn apply_coupon(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    user: Option<AuthUser>,
    Json(request): Json<ApplyCouponRequest>,
) -> ApiResult<CartView> {
    request.validate()?;
    authorized_cart(&state, id, user.as_ref()).await?;
    let view = state.services.carts.apply_coupon(id, &request.code).await?;
    Ok(Json(ApiResponse::success(view)))
}

#[utoipa::path(
    post,
    path = "/api/v1/carts/{id}/refresh",
    params(("id" = Uuid, Path, description = "Cart ID")),
    responses(
        (status = 200, description = "Cart re-priced against the catalog", body = ApiResponse<CartView>),
    ),
    tag = "Carts"
)]
pub async fn refresh_cart(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    user: Option<AuthUser>,
) -> ApiResult<CartView> {
    authorized_cart(&state, id, user.as_ref()).await?;
    let view = state.services.carts.refresh(id).await?;
    Ok(Json(ApiResponse::success(view)))
}

#[utoipa::path(
    post,
    path = "/api/v1/carts/{id}/checkout",
    params(("id" = Uuid, Path, description = "Cart ID")),
    request_body = CheckoutRequest,
    responses(
        (status = 201, description = "Order placed and payment initiated", body = ApiResponse<CheckoutResult>),
        (status = 402, description = "Payment failed", body = crate::errors::ErrorResponse),
        (status = 409, description = "Cart is stale", body = crate::errors::ErrorResponse),
        (status = 422, description = "Insufficient stock", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Checkout"
)]
pub async fn checkout(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    user: AuthUser,
    Json(request): Json<CheckoutRequest>,
) -> Result<(StatusCode, Json<ApiResponse<CheckoutResult>>), ServiceError> {
    let result = state
        .services
        .checkout
        .checkout(user.user_id, id, request)
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(result))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{cart, CartStatus};
    use crate::services::cart::CartTotals;
    use rust_decimal::Decimal;

    fn view(owner: Option<Uuid>) -> CartView {
        let now = chrono::Utc::now();
        CartView {
            cart: cart::Model {
                id: Uuid::new_v4(),
                user_id: owner,
                session_id: None,
                currency: "MGA".into(),
                applied_coupon_code: None,
                discount_amount: Decimal::ZERO,
                status: CartStatus::Active,
                version: 1,
                expires_at: None,
                created_at: now,
                updated_at: now,
            },
            items: vec![],
            totals: CartTotals {
                subtotal: Decimal::ZERO,
                discount_amount: Decimal::ZERO,
                shipping_amount: Decimal::ZERO,
                tax_amount: Decimal::ZERO,
                total_amount: Decimal::ZERO,
            },
        }
    }

    #[test]
    fn cart_access_rules() {
        let owner = AuthUser {
            user_id: Uuid::new_v4(),
            roles: vec![],
        };
        let stranger = AuthUser {
            user_id: Uuid::new_v4(),
            roles: vec![],
        };

        assert!(ensure_cart_access(&view(None), None).is_ok());
        assert!(ensure_cart_access(&view(Some(owner.user_id)), Some(&owner)).is_ok());
        assert!(matches!(
            ensure_cart_access(&view(Some(owner.user_id)), Some(&stranger)),
            Err(ServiceError::Forbidden(_))
        ));
        assert!(matches!(
            ensure_cart_access(&view(Some(owner.user_id)), None),
            Err(ServiceError::Unauthorized(_))
        ));
    }
}
