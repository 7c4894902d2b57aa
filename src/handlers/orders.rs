use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::auth::AuthUser;
use crate::entities::{order, order_status_history, payment};
use crate::errors::ServiceError;
use crate::services::checkout::OrderDetails;
use crate::services::order_state::OrderTransition;
use crate::{ApiResponse, ApiResult, AppState};

pub fn order_routes() -> Router<AppState> {
    Router::new()
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/history", get(get_order_history))
        .route("/orders/:id/payments", post(retry_payment))
        .route("/orders/:id/cancel", post(cancel_order))
        .route("/orders/:id/ship", post(ship_order))
        .route("/orders/:id/complete", post(complete_order))
        .route("/orders/:id/refund", post(request_refund))
        .route("/orders/:id/refund/confirm", post(confirm_refund))
}

#[derive(Debug, Default, Deserialize, Validate, ToSchema)]
pub struct TransitionRequest {
    #[validate(length(max = 1000))]
    pub comment: Option<String>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct ShipOrderRequest {
    #[validate(length(min = 1, max = 100))]
    pub tracking_number: String,
    #[validate(length(max = 1000))]
    pub comment: Option<String>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct RetryPaymentRequest {
    #[validate(length(min = 1, max = 64))]
    pub payment_method: String,
}

/// Loads an order the caller owns, or any order for admins. Other callers get
/// `NotFound` so order ids do not leak.
async fn owned_order(
    state: &AppState,
    order_id: Uuid,
    user: &AuthUser,
) -> Result<OrderDetails, ServiceError> {
    let details = state.services.checkout.order_details(order_id).await?;
    if !user.can_access(details.order.user_id) {
        return Err(ServiceError::NotFound(format!("Order {} not found", order_id)));
    }
    Ok(details)
}

async fn run_transition(
    state: &AppState,
    order_id: Uuid,
    user: &AuthUser,
    transition: OrderTransition,
    comment: Option<String>,
) -> ApiResult<order::Model> {
    let order = state
        .services
        .orders
        .transition(order_id, transition, Some(user.user_id), comment)
        .await?;
    Ok(Json(ApiResponse::success(order)))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Order with items and payments", body = ApiResponse<OrderDetails>),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    user: AuthUser,
) -> ApiResult<OrderDetails> {
    let details = owned_order(&state, id, &user).await?;
    Ok(Json(ApiResponse::success(details)))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}/history",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Status changes in the order they happened"),
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn get_order_history(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    user: AuthUser,
) -> ApiResult<Vec<order_status_history::Model>> {
    owned_order(&state, id, &user).await?;
    let history = state.services.orders.history(id).await?;
    Ok(Json(ApiResponse::success(history)))
}

#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/payments",
    params(("id" = Uuid, Path, description = "Order ID")),
    request_body = RetryPaymentRequest,
    responses(
        (status = 201, description = "Payment initiated for the outstanding amount"),
        (status = 402, description = "Payment failed", body = crate::errors::ErrorResponse),
        (status = 409, description = "Order not pending or payment in flight", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Payments"
)]
pub async fn retry_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    user: AuthUser,
    Json(request): Json<RetryPaymentRequest>,
) -> Result<(StatusCode, Json<ApiResponse<payment::Model>>), ServiceError> {
    request.validate()?;
    let details = owned_order(&state, id, &user).await?;
    let payment = state
        .services
        .payments
        .initiate(id, details.order.user_id, request.payment_method)
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(payment))))
}

#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/cancel",
    params(("id" = Uuid, Path, description = "Order ID")),
    request_body = TransitionRequest,
    responses(
        (status = 200, description = "Order cancelled, reservations released"),
        (status = 409, description = "Invalid state transition", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn cancel_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    user: AuthUser,
    request: Option<Json<TransitionRequest>>,
) -> ApiResult<order::Model> {
    let Json(request) = request.unwrap_or_default();
    request.validate()?;
    owned_order(&state, id, &user).await?;
    run_transition(&state, id, &user, OrderTransition::Cancel, request.comment).await
}

#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/ship",
    params(("id" = Uuid, Path, description = "Order ID")),
    request_body = ShipOrderRequest,
    responses(
        (status = 200, description = "Order fulfilled"),
        (status = 403, description = "Admin only", body = crate::errors::ErrorResponse),
        (status = 409, description = "Invalid state transition", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn ship_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    user: AuthUser,
    Json(request): Json<ShipOrderRequest>,
) -> ApiResult<order::Model> {
    user.require_admin()?;
    request.validate()?;
    run_transition(
        &state,
        id,
        &user,
        OrderTransition::Ship {
            tracking_number: request.tracking_number,
        },
        request.comment,
    )
    .await
}

#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/complete",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Order completed"),
        (status = 409, description = "Invalid state transition", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn complete_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    user: AuthUser,
) -> ApiResult<order::Model> {
    user.require_admin()?;
    run_transition(&state, id, &user, OrderTransition::Complete, None).await
}

#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/refund",
    params(("id" = Uuid, Path, description = "Order ID")),
    request_body = TransitionRequest,
    responses(
        (status = 200, description = "Refund requested"),
        (status = 409, description = "Invalid state transition", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn request_refund(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    user: AuthUser,
    request: Option<Json<TransitionRequest>>,
) -> ApiResult<order::Model> {
    let Json(request) = request.unwrap_or_default();
    request.validate()?;
    owned_order(&state, id, &user).await?;
    run_transition(&state, id, &user, OrderTransition::RequestRefund, request.comment).await
}

#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/refund/confirm",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Refund confirmed, payments marked refunded"),
        (status = 409, description = "Invalid state transition", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Orders"
)]
pub async fn confirm_refund(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    user: AuthUser,
) -> ApiResult<order::Model> {
    user.require_admin()?;
    run_transition(&state, id, &user, OrderTransition::ConfirmRefund, None).await
}
