use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    routing::post,
    Json, Router,
};
use tracing::warn;

use crate::errors::ServiceError;
use crate::services::payments::{verify_webhook_signature, PaymentCallback, ReconcileOutcome};
use crate::AppState;

pub const TIMESTAMP_HEADER: &str = "x-timestamp";
pub const SIGNATURE_HEADER: &str = "x-signature";

pub fn webhook_routes() -> Router<AppState> {
    Router::new().route("/payments/webhook", post(payment_webhook))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, ServiceError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ServiceError::Unauthorized(format!("Missing {} header", name)))
}

// POST /api/v1/payments/webhook
#[utoipa::path(
    post,
    path = "/api/v1/payments/webhook",
    request_body = PaymentCallback,
    responses(
        (status = 200, description = "Callback applied or recognised as a duplicate"),
        (status = 401, description = "Invalid signature", body = crate::errors::ErrorResponse),
        (status = 400, description = "Invalid payload", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ReconcileOutcome>, ServiceError> {
    let payments = &state.services.payments;
    match payments.webhook_secret() {
        Some(secret) => {
            let timestamp = header_str(&headers, TIMESTAMP_HEADER)?;
            let signature = header_str(&headers, SIGNATURE_HEADER)?;
            verify_webhook_signature(
                secret,
                timestamp,
                &body,
                signature,
                payments.webhook_tolerance_secs(),
            )
            .map_err(|e| {
                warn!(error = %e, "payment webhook rejected");
                e
            })?;
        }
        None => warn!("payment webhook secret not configured, accepting unsigned callback"),
    }

    let callback: PaymentCallback = serde_json::from_slice(&body)
        .map_err(|e| ServiceError::ValidationError(format!("invalid webhook payload: {}", e)))?;

    let outcome = payments.reconcile(callback).await?;
    Ok(Json(outcome))
}
