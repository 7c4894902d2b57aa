#![allow(dead_code)]

use std::sync::Arc;

use artizaho_api::{
    auth::{AuthService, Claims, ADMIN_ROLE},
    build_router,
    config::AppConfig,
    db,
    entities::{product, product_variant, ProductStatus},
    events::{self, EventSender, LogNotifier},
    handlers::AppServices,
    services::gateway::{ChargeRequest, ChargeResponse, ChargeStatus, GatewayError, PaymentGateway},
    services::payments::sign_webhook_payload,
    AppState,
};
use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{Method, Request},
    response::Response,
    Router,
};
use chrono::Utc;
use mockall::mock;
use rust_decimal::Decimal;
use sea_orm::{sea_query::Expr, ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};
use serde_json::{json, Value};
use std::str::FromStr;
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const JWT_SECRET: &str = "test_secret_key_for_testing_purposes_only_32chars";
pub const WEBHOOK_SECRET: &str = "whsec_integration_tests";

mock! {
    pub Gateway {}

    #[async_trait]
    impl PaymentGateway for Gateway {
        async fn create_charge(&self, request: ChargeRequest) -> Result<ChargeResponse, GatewayError>;
    }
}

/// Provider id the default gateway assigns to a payment.
pub fn provider_id_for(payment_id: Uuid) -> String {
    format!("pi_{}", payment_id.simple())
}

/// Gateway that accepts every charge and leaves the outcome to a webhook.
pub fn pending_gateway() -> MockGateway {
    let mut gateway = MockGateway::new();
    gateway.expect_create_charge().returning(|request| {
        Ok(ChargeResponse {
            provider_payment_id: provider_id_for(request.payment_id),
            provider_transaction_id: None,
            status: ChargeStatus::Pending,
            failure_reason: None,
            raw: json!({ "id": provider_id_for(request.payment_id), "status": "pending" }),
        })
    });
    gateway
}

/// Application backed by an in-memory SQLite database and a mocked gateway.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_gateway(pending_gateway()).await
    }

    pub async fn with_gateway(gateway: MockGateway) -> Self {
        Self::configured(gateway, |_| {}).await
    }

    /// Like [`with_gateway`](Self::with_gateway), with a hook to adjust pricing or
    /// payment settings before the services are built.
    pub async fn configured(gateway: MockGateway, configure: impl FnOnce(&mut AppConfig)) -> Self {
        Self::build(Arc::new(gateway), configure).await
    }

    /// Application over a hand-written gateway implementation.
    pub async fn with_payment_gateway(gateway: Arc<dyn PaymentGateway>) -> Self {
        Self::build(gateway, |_| {}).await
    }

    async fn build(
        gateway: Arc<dyn PaymentGateway>,
        configure: impl FnOnce(&mut AppConfig),
    ) -> Self {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            JWT_SECRET.to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        cfg.payment_webhook_secret = Some(WEBHOOK_SECRET.to_string());
        cfg.payment_retry_initial_delay_ms = 1;
        cfg.reservation_sweep_interval_secs = 0;
        configure(&mut cfg);

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let db_arc = Arc::new(pool);
        let cfg = Arc::new(cfg);
        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = EventSender::new(event_tx);
        let event_task = tokio::spawn(events::process_events(event_rx, Arc::new(LogNotifier)));

        let services = AppServices::new(db_arc.clone(), cfg.clone(), event_sender.clone(), gateway);

        let state = AppState {
            db: db_arc,
            config: cfg.clone(),
            event_sender,
            auth: AuthService::new(&cfg.jwt_secret),
            services,
        };

        Self {
            router: build_router(state.clone()),
            state,
            _event_task: event_task,
        }
    }

    pub fn db(&self) -> &sea_orm::DatabaseConnection {
        &self.state.db
    }

    /// Signs a token for `user_id` with the given roles.
    pub fn token_for(&self, user_id: Uuid, roles: &[&str]) -> String {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            exp: (now + chrono::Duration::hours(1)).timestamp(),
            iat: Some(now.timestamp()),
            roles: roles.iter().map(|r| r.to_string()).collect(),
        };
        jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(JWT_SECRET.as_bytes()),
        )
        .expect("encode access token")
    }

    pub fn admin_token(&self) -> String {
        self.token_for(Uuid::new_v4(), &[ADMIN_ROLE])
    }

    /// Send a request against the router with an optional bearer token.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);

        if let Some(tok) = token {
            builder = builder.header("authorization", format!("Bearer {}", tok));
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    /// Posts a callback to the payment webhook, signed with the test secret.
    pub async fn send_webhook(&self, payload: Value) -> Response {
        let body = serde_json::to_vec(&payload).expect("serialize webhook payload");
        let timestamp = Utc::now().timestamp().to_string();
        let signature =
            sign_webhook_payload(WEBHOOK_SECRET, &timestamp, &body).expect("sign webhook payload");
        self.send_raw_webhook(body, &timestamp, &signature).await
    }

    pub async fn send_raw_webhook(&self, body: Vec<u8>, timestamp: &str, signature: &str) -> Response {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/payments/webhook")
            .header("content-type", "application/json")
            .header("x-timestamp", timestamp)
            .header("x-signature", signature)
            .body(Body::from(body))
            .expect("failed to build webhook request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during webhook request")
    }

    pub async fn seed_product(&self, price: Decimal, stock: i32) -> product::Model {
        let now = Utc::now();
        let id = Uuid::new_v4();
        product::ActiveModel {
            id: Set(id),
            artisan_id: Set(Uuid::new_v4()),
            title: Set(format!("Handwoven basket {}", &id.simple().to_string()[..6])),
            sku: Set(Some(format!("SKU-{}", &id.simple().to_string()[..8]))),
            price: Set(price),
            currency: Set("MGA".to_string()),
            status: Set(ProductStatus::Active),
            stock_quantity: Set(stock),
            reserved_quantity: Set(0),
            track_inventory: Set(true),
            allow_backorders: Set(false),
            low_stock_threshold: Set(1),
            sales_count: Set(0),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(self.db())
        .await
        .expect("seed product for tests")
    }

    /// Switches stock tracking and backorders for an existing product.
    pub async fn set_stock_policy(&self, product_id: Uuid, track_inventory: bool, allow_backorders: bool) {
        product::Entity::update_many()
            .col_expr(product::Column::TrackInventory, Expr::value(track_inventory))
            .col_expr(product::Column::AllowBackorders, Expr::value(allow_backorders))
            .filter(product::Column::Id.eq(product_id))
            .exec(self.db())
            .await
            .expect("update product stock policy");
    }

    pub async fn seed_variant(
        &self,
        product_id: Uuid,
        price: Option<Decimal>,
        stock: i32,
    ) -> product_variant::Model {
        let now = Utc::now();
        product_variant::ActiveModel {
            id: Set(Uuid::new_v4()),
            product_id: Set(product_id),
            sku: Set(None),
            title: Set("Large".to_string()),
            price: Set(price),
            stock_quantity: Set(stock),
            reserved_quantity: Set(0),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(self.db())
        .await
        .expect("seed product variant for tests")
    }

    /// Creates a cart owned by the token's user holding `quantity` of `product_id`.
    pub async fn cart_with_item(&self, token: &str, product_id: Uuid, quantity: i32) -> Uuid {
        let response = self
            .request(Method::POST, "/api/v1/carts", Some(json!({})), Some(token))
            .await;
        assert_eq!(response.status(), 201, "cart creation failed");
        let cart_id = uuid_at(&response_json(response).await["data"]["cart"]["id"]);

        let response = self
            .request(
                Method::POST,
                &format!("/api/v1/carts/{}/items", cart_id),
                Some(json!({ "product_id": product_id, "quantity": quantity })),
                Some(token),
            )
            .await;
        assert_eq!(response.status(), 200, "adding cart item failed");
        cart_id
    }

    /// Checks out a cart and returns the response body.
    pub async fn checkout(&self, token: &str, cart_id: Uuid) -> (u16, Value) {
        let response = self
            .request(
                Method::POST,
                &format!("/api/v1/carts/{}/checkout", cart_id),
                Some(json!({ "payment_method": "card" })),
                Some(token),
            )
            .await;
        let status = response.status().as_u16();
        (status, response_json(response).await)
    }

    pub async fn order_json(&self, token: &str, order_id: Uuid) -> Value {
        let response = self
            .request(
                Method::GET,
                &format!("/api/v1/orders/{}", order_id),
                None,
                Some(token),
            )
            .await;
        assert_eq!(response.status(), 200);
        response_json(response).await["data"].clone()
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}

pub async fn response_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}

pub fn uuid_at(value: &Value) -> Uuid {
    Uuid::from_str(value.as_str().expect("uuid string")).expect("valid uuid")
}

pub fn decimal_at(value: &Value) -> Decimal {
    match value {
        Value::String(s) => Decimal::from_str(s).expect("decimal string"),
        Value::Number(n) => Decimal::from_str(&n.to_string()).expect("decimal number"),
        other => panic!("expected a decimal, got {}", other),
    }
}
