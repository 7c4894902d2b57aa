use axum::{extract::State, routing::post, Json, Router};

use crate::auth::AuthUser;
use crate::events::Event;
use crate::services::inventory::SweepResult;
use crate::{ApiResponse, ApiResult, AppState};

pub fn admin_routes() -> Router<AppState> {
    Router::new().route("/admin/reservations/sweep", post(sweep_reservations))
}

#[utoipa::path(
    post,
    path = "/api/v1/admin/reservations/sweep",
    responses(
        (status = 200, description = "Expired reservations reclaimed"),
        (status = 403, description = "Admin only", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Admin"
)]
pub async fn sweep_reservations(
    State(state): State<AppState>,
    user: AuthUser,
) -> ApiResult<SweepResult> {
    user.require_admin()?;
    let result = state.services.inventory.sweep().await?;
    if result.expired_count > 0 {
        state
            .event_sender
            .publish(Event::ReservationsExpired {
                count: result.expired_count,
            })
            .await;
    }
    Ok(Json(ApiResponse::success(result)))
}
