//! HTTP gateway client against a stub processor.

use std::time::Duration;

use artizaho_api::services::gateway::{
    ChargeRequest, ChargeStatus, GatewayError, HttpPaymentGateway, PaymentGateway,
};
use assert_matches::assert_matches;
use rust_decimal_macros::dec;
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn charge_request() -> ChargeRequest {
    ChargeRequest {
        payment_id: Uuid::new_v4(),
        order_id: Uuid::new_v4(),
        order_number: "ART-20261019-0001".to_string(),
        amount: dec!(1250),
        currency: "MGA".to_string(),
        payment_method: "mobile_money".to_string(),
        description: "Order ART-20261019-0001".to_string(),
    }
}

fn gateway(server: &MockServer, timeout: Duration) -> HttpPaymentGateway {
    HttpPaymentGateway::new(server.uri(), Some("sk_test_key".to_string()), timeout).unwrap()
}

#[tokio::test]
async fn accepted_charge_keeps_the_raw_reply() {
    let server = MockServer::start().await;
    let request = charge_request();
    let reply = json!({
        "provider_payment_id": "pi_abc",
        "status": "pending",
        "extra": { "channel": "mvola" },
    });

    Mock::given(method("POST"))
        .and(path("/charges"))
        .and(header("Idempotency-Key", request.payment_id.to_string().as_str()))
        .and(header("Authorization", "Bearer sk_test_key"))
        .and(body_partial_json(json!({ "currency": "MGA", "payment_method": "mobile_money" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(&reply))
        .expect(1)
        .mount(&server)
        .await;

    let charge = gateway(&server, Duration::from_secs(5))
        .create_charge(request)
        .await
        .unwrap();
    assert_eq!(charge.provider_payment_id, "pi_abc");
    assert_eq!(charge.status, ChargeStatus::Pending);
    assert_eq!(charge.raw, reply);
}

#[tokio::test]
async fn payment_required_is_a_decline() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/charges"))
        .respond_with(
            ResponseTemplate::new(402).set_body_json(json!({ "failure_reason": "card_declined" })),
        )
        .mount(&server)
        .await;

    let err = gateway(&server, Duration::from_secs(5))
        .create_charge(charge_request())
        .await
        .unwrap_err();
    assert_eq!(err, GatewayError::Declined("card_declined".to_string()));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn server_errors_are_retryable_even_without_a_json_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/charges"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream overloaded"))
        .mount(&server)
        .await;

    let err = gateway(&server, Duration::from_secs(5))
        .create_charge(charge_request())
        .await
        .unwrap_err();
    assert_matches!(err, GatewayError::Unavailable(_));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn unexpected_replies_are_invalid() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/charges"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({ "message": "bad amount" })))
        .mount(&server)
        .await;

    let err = gateway(&server, Duration::from_secs(5))
        .create_charge(charge_request())
        .await
        .unwrap_err();
    assert_matches!(err, GatewayError::InvalidResponse(_));

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/charges"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "pi_missing_fields" })))
        .mount(&server)
        .await;

    let err = gateway(&server, Duration::from_secs(5))
        .create_charge(charge_request())
        .await
        .unwrap_err();
    assert_matches!(err, GatewayError::InvalidResponse(_));
}

#[tokio::test]
async fn slow_gateway_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/charges"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "provider_payment_id": "pi_late", "status": "pending" }))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let err = gateway(&server, Duration::from_millis(100))
        .create_charge(charge_request())
        .await
        .unwrap_err();
    assert_eq!(err, GatewayError::Timeout);
}
