use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::middleware_helpers::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChargeRequest {
    pub payment_id: Uuid,
    pub order_id: Uuid,
    pub order_number: String,
    pub amount: Decimal,
    pub currency: String,
    pub payment_method: String,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeStatus {
    /// Accepted; the outcome arrives later through the webhook.
    Pending,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeResponse {
    pub provider_payment_id: String,
    #[serde(default)]
    pub provider_transaction_id: Option<String>,
    pub status: ChargeStatus,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("payment gateway timed out")]
    Timeout,
    #[error("charge declined: {0}")]
    Declined(String),
    #[error("payment gateway unavailable: {0}")]
    Unavailable(String),
    #[error("invalid gateway response: {0}")]
    InvalidResponse(String),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Timeout | GatewayError::Unavailable(_))
    }
}

/// Retries timeouts and unavailability; declines and malformed replies are final.
pub struct GatewayRetryPolicy;

impl RetryPolicy<GatewayError> for GatewayRetryPolicy {
    fn is_retryable(&self, error: &GatewayError) -> bool {
        error.is_retryable()
    }
}

/// External payment processor.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_charge(&self, request: ChargeRequest) -> Result<ChargeResponse, GatewayError>;
}

/// JSON-over-HTTP gateway client.
///
/// `POST {base_url}/charges` with a bearer key; the payment id doubles as the
/// idempotency key so a retried request cannot charge twice.
#[derive(Clone)]
pub struct HttpPaymentGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpPaymentGateway {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    #[instrument(skip(self, request), fields(payment_id = %request.payment_id, amount = %request.amount))]
    async fn create_charge(&self, request: ChargeRequest) -> Result<ChargeResponse, GatewayError> {
        let url = format!("{}/charges", self.base_url);
        let mut builder = self
            .client
            .post(&url)
            .header("Idempotency-Key", request.payment_id.to_string())
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout
            } else {
                GatewayError::Unavailable(e.to_string())
            }
        })?;

        let status = response.status();
        debug!(%status, "gateway responded");
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(GatewayError::Unavailable(format!("gateway returned {}", status)));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
        if status == reqwest::StatusCode::PAYMENT_REQUIRED {
            let reason = body
                .get("failure_reason")
                .or_else(|| body.get("message"))
                .and_then(|v| v.as_str())
                .unwrap_or("declined")
                .to_string();
            warn!(%reason, "charge declined");
            return Err(GatewayError::Declined(reason));
        }
        if !status.is_success() {
            return Err(GatewayError::InvalidResponse(format!(
                "unexpected status {}",
                status
            )));
        }

        let mut charge: ChargeResponse = serde_json::from_value(body.clone())
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
        charge.raw = body;
        Ok(charge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retried() {
        let policy = GatewayRetryPolicy;
        assert!(policy.is_retryable(&GatewayError::Timeout));
        assert!(policy.is_retryable(&GatewayError::Unavailable("503".into())));
        assert!(!policy.is_retryable(&GatewayError::Declined("card".into())));
        assert!(!policy.is_retryable(&GatewayError::InvalidResponse("{}".into())));
    }

    #[test]
    fn charge_response_defaults_optional_fields() {
        let charge: ChargeResponse =
            serde_json::from_str(r#"{"provider_payment_id":"pi_1","status":"pending"}"#).unwrap();
        assert_eq!(charge.status, ChargeStatus::Pending);
        assert!(charge.provider_transaction_id.is_none());
    }
}
