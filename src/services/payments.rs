//! Payment initiation against the gateway and idempotent reconciliation of
//! gateway callbacks.

use chrono::Utc;
use hmac::{Hmac, Mac};
use metrics::{counter, histogram};
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use super::gateway::{ChargeRequest, ChargeStatus, GatewayRetryPolicy, PaymentGateway};
use super::inventory::InventoryService;
use super::order_state::{OrderStateMachine, OrderTransition};
use crate::config::AppConfig;
use crate::db;
use crate::entities::{order, payment, Order, OrderStatus, Payment, PaymentState, PaymentStatus};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::middleware_helpers::with_retry;

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_WEBHOOK_TOLERANCE_SECS: u64 = 300;

/// Outcome reported by the gateway for a charge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CallbackStatus {
    Succeeded,
    Failed,
}

/// Gateway callback body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PaymentCallback {
    pub provider_payment_id: String,
    pub status: CallbackStatus,
    #[serde(default)]
    pub provider_transaction_id: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Applied {
        order_status: OrderStatus,
        payment_status: PaymentStatus,
    },
    /// The capture landed on an order that no longer takes payments; the
    /// payment is parked as `refund_required`.
    RefundRequired {
        order_status: OrderStatus,
        payment_status: PaymentStatus,
    },
    /// The payment already left `pending`; nothing changed.
    Duplicate,
}

/// Checks an `x-signature` header: hex HMAC-SHA256 of `"{timestamp}.{body}"`.
pub fn verify_webhook_signature(
    secret: &str,
    timestamp: &str,
    body: &[u8],
    signature_hex: &str,
    tolerance_secs: u64,
) -> Result<(), ServiceError> {
    let sent_at: i64 = timestamp
        .trim()
        .parse()
        .map_err(|_| ServiceError::Unauthorized("Invalid webhook timestamp".to_string()))?;
    let skew = (Utc::now().timestamp() - sent_at).unsigned_abs();
    if skew > tolerance_secs {
        return Err(ServiceError::Unauthorized(
            "Webhook timestamp outside tolerance".to_string(),
        ));
    }

    let signature = hex::decode(signature_hex.trim())
        .map_err(|_| ServiceError::Unauthorized("Malformed webhook signature".to_string()))?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ServiceError::InternalError(e.to_string()))?;
    mac.update(timestamp.trim().as_bytes());
    mac.update(b".");
    mac.update(body);
    mac.verify_slice(&signature)
        .map_err(|_| ServiceError::Unauthorized("Invalid webhook signature".to_string()))
}

/// Produces the signature [`verify_webhook_signature`] expects.
pub fn sign_webhook_payload(secret: &str, timestamp: &str, body: &[u8]) -> Result<String, ServiceError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ServiceError::InternalError(e.to_string()))?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[derive(Clone)]
pub struct PaymentService {
    db: Arc<DatabaseConnection>,
    gateway: Arc<dyn PaymentGateway>,
    orders: OrderStateMachine,
    inventory: InventoryService,
    config: Arc<AppConfig>,
    event_sender: EventSender,
}

impl PaymentService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        gateway: Arc<dyn PaymentGateway>,
        orders: OrderStateMachine,
        inventory: InventoryService,
        config: Arc<AppConfig>,
        event_sender: EventSender,
    ) -> Self {
        Self {
            db,
            gateway,
            orders,
            inventory,
            config,
            event_sender,
        }
    }

    pub fn webhook_tolerance_secs(&self) -> u64 {
        self.config
            .payment_webhook_tolerance_secs
            .unwrap_or(DEFAULT_WEBHOOK_TOLERANCE_SECS)
    }

    pub fn webhook_secret(&self) -> Option<&str> {
        self.config.payment_webhook_secret.as_deref()
    }

    pub async fn payments_for_order(&self, order_id: Uuid) -> Result<Vec<payment::Model>, ServiceError> {
        Ok(Payment::find()
            .filter(payment::Column::OrderId.eq(order_id))
            .order_by_asc(payment::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }

    /// Charges the outstanding amount of a pending order.
    ///
    /// Only one charge may be in flight per order: the payment row is created in
    /// a transaction that claims the order's version, and any `pending` payment
    /// blocks a new one with `ConcurrentModification`.
    ///
    /// Transient gateway errors are retried with backoff. A final failure marks
    /// the payment `failed` and returns `PaymentFailed`; reservations are left to
    /// expire on their own.
    #[instrument(skip(self, payment_method), fields(order_id = %order_id))]
    pub async fn initiate(
        &self,
        order_id: Uuid,
        user_id: Uuid,
        payment_method: String,
    ) -> Result<payment::Model, ServiceError> {
        let claimed_at = Instant::now();
        let txn = db::begin(&self.db, "payment_initiate").await?;
        let (order, payment) = self
            .open_payment(&txn, order_id, user_id, &payment_method)
            .await?;
        db::commit(txn, "payment_initiate", claimed_at).await?;
        let outstanding = payment.amount;

        let request = ChargeRequest {
            payment_id: payment.id,
            order_id: order.id,
            order_number: order.order_number.clone(),
            amount: outstanding,
            currency: order.currency.clone(),
            payment_method,
            description: format!("Order {}", order.order_number),
        };

        let attempts = AtomicI32::new(0);
        let started = Instant::now();
        let result = with_retry(
            &self.config.payment_retry_config(),
            GatewayRetryPolicy,
            || {
                attempts.fetch_add(1, Ordering::Relaxed);
                let gateway = self.gateway.clone();
                let request = request.clone();
                async move { gateway.create_charge(request).await }
            },
        )
        .await;
        let attempts = attempts.load(Ordering::Relaxed);
        histogram!("artizaho_payments.gateway.duration", started.elapsed());

        let charge = match result {
            Ok(charge) => charge,
            Err(e) => {
                counter!("artizaho_payments.initiated", 1, "outcome" => "failed");
                self.mark_failed(&payment, &e.to_string(), attempts).await?;
                return Err(ServiceError::PaymentFailed(e.to_string()));
            }
        };

        let mut active: payment::ActiveModel = payment.into();
        active.provider_payment_id = Set(Some(charge.provider_payment_id.clone()));
        active.provider_transaction_id = Set(charge.provider_transaction_id.clone());
        active.provider_response = Set(Some(charge.raw.clone()));
        active.attempts = Set(attempts);
        active.updated_at = Set(Utc::now());
        let payment = active.update(&*self.db).await?;

        info!(
            payment_id = %payment.id,
            provider_payment_id = %charge.provider_payment_id,
            status = ?charge.status,
            attempts,
            "gateway accepted charge"
        );

        let status = match charge.status {
            ChargeStatus::Pending => {
                counter!("artizaho_payments.initiated", 1, "outcome" => "pending");
                return Ok(payment);
            }
            ChargeStatus::Succeeded => CallbackStatus::Succeeded,
            ChargeStatus::Failed => CallbackStatus::Failed,
        };

        self.reconcile(PaymentCallback {
            provider_payment_id: charge.provider_payment_id,
            status,
            provider_transaction_id: charge.provider_transaction_id,
            failure_reason: charge.failure_reason.clone(),
            raw: charge.raw,
        })
        .await?;

        if status == CallbackStatus::Failed {
            counter!("artizaho_payments.initiated", 1, "outcome" => "failed");
            return Err(ServiceError::PaymentFailed(
                charge
                    .failure_reason
                    .unwrap_or_else(|| "charge failed".to_string()),
            ));
        }

        counter!("artizaho_payments.initiated", 1, "outcome" => "succeeded");
        Payment::find_by_id(payment.id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Payment {} not found", payment.id)))
    }

    /// Claims a pending order and records a new `pending` payment for what is
    /// still owed. Runs inside the caller's transaction.
    async fn open_payment<C>(
        &self,
        conn: &C,
        order_id: Uuid,
        user_id: Uuid,
        payment_method: &str,
    ) -> Result<(order::Model, payment::Model), ServiceError>
    where
        C: ConnectionTrait,
    {
        let order = Order::find_by_id(order_id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
        if order.status != OrderStatus::Pending {
            return Err(ServiceError::invalid_transition(order.status, OrderStatus::Paid));
        }

        let now = Utc::now();
        let claimed = Order::update_many()
            .col_expr(
                order::Column::Version,
                Expr::col(order::Column::Version).add(1),
            )
            .col_expr(order::Column::UpdatedAt, Expr::value(now))
            .filter(order::Column::Id.eq(order.id))
            .filter(order::Column::Version.eq(order.version))
            .filter(order::Column::Status.eq(OrderStatus::Pending))
            .exec(conn)
            .await?
            .rows_affected;
        if claimed == 0 {
            return Err(ServiceError::ConcurrentModification(order.id));
        }

        let existing = Payment::find()
            .filter(payment::Column::OrderId.eq(order.id))
            .all(conn)
            .await?;
        if let Some(in_flight) = existing.iter().find(|p| p.status == PaymentState::Pending) {
            info!(payment_id = %in_flight.id, "charge already in flight");
            return Err(ServiceError::ConcurrentModification(order.id));
        }

        let outstanding = order.total_amount - succeeded_total(&existing);
        if outstanding <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(format!(
                "Order {} has no outstanding amount",
                order.order_number
            )));
        }

        let payment = payment::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            user_id: Set(user_id),
            payment_method: Set(payment_method.to_string()),
            payment_provider: Set(self.config.payment_provider.clone()),
            provider_payment_id: Set(None),
            provider_transaction_id: Set(None),
            amount: Set(outstanding),
            currency: Set(order.currency.clone()),
            status: Set(PaymentState::Pending),
            provider_response: Set(None),
            failure_reason: Set(None),
            attempts: Set(0),
            processed_at: Set(None),
            failed_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(conn)
        .await?;

        Ok((order, payment))
    }

    async fn mark_failed(
        &self,
        payment: &payment::Model,
        reason: &str,
        attempts: i32,
    ) -> Result<(), ServiceError> {
        let now = Utc::now();
        Payment::update_many()
            .col_expr(payment::Column::Status, Expr::value(PaymentState::Failed))
            .col_expr(payment::Column::FailureReason, Expr::value(reason.to_string()))
            .col_expr(payment::Column::Attempts, Expr::value(attempts))
            .col_expr(payment::Column::FailedAt, Expr::value(now))
            .col_expr(payment::Column::UpdatedAt, Expr::value(now))
            .filter(payment::Column::Id.eq(payment.id))
            .filter(payment::Column::Status.eq(PaymentState::Pending))
            .exec(&*self.db)
            .await?;

        error!(payment_id = %payment.id, attempts, %reason, "payment failed");
        self.event_sender
            .publish(Event::PaymentFailed {
                order_id: payment.order_id,
                payment_id: payment.id,
                reason: reason.to_string(),
            })
            .await;
        Ok(())
    }

    /// Applies a gateway callback exactly once.
    ///
    /// The `pending -> succeeded|failed` move is conditional on the stored status,
    /// so replays and concurrent duplicates change nothing and report `Duplicate`.
    #[instrument(skip(self, callback), fields(provider_payment_id = %callback.provider_payment_id, status = ?callback.status))]
    pub async fn reconcile(&self, callback: PaymentCallback) -> Result<ReconcileOutcome, ServiceError> {
        let payment = Payment::find()
            .filter(payment::Column::ProviderPaymentId.eq(callback.provider_payment_id.as_str()))
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "Payment {} not found",
                    callback.provider_payment_id
                ))
            })?;

        let started = Instant::now();
        let txn = db::begin(&self.db, "payment_reconcile").await?;
        let (outcome, events) = match self.settle(&txn, &payment, &callback, true).await {
            Err(ServiceError::InsufficientStock(reason)) => {
                drop(txn);
                warn!(
                    order_id = %payment.order_id,
                    %reason,
                    "paid order can no longer be fulfilled, requesting refund"
                );
                let txn = db::begin(&self.db, "payment_reconcile").await?;
                let settled = self.settle(&txn, &payment, &callback, false).await?;
                db::commit(txn, "payment_reconcile", started).await?;
                settled
            }
            Err(e) => return Err(e),
            Ok(settled) => {
                db::commit(txn, "payment_reconcile", started).await?;
                settled
            }
        };

        let label = match outcome {
            ReconcileOutcome::Applied { .. } => "applied",
            ReconcileOutcome::RefundRequired { .. } => "refund_required",
            ReconcileOutcome::Duplicate => "duplicate",
        };
        counter!("artizaho_payments.reconciled", 1, "outcome" => label);

        for event in events {
            self.event_sender.publish(event).await;
        }
        Ok(outcome)
    }

    /// Records the callback and moves the order. With `stock_available == false`
    /// the captured order goes straight to `refund_pending` and its remaining
    /// reservations are released.
    async fn settle<C>(
        &self,
        conn: &C,
        payment: &payment::Model,
        callback: &PaymentCallback,
        stock_available: bool,
    ) -> Result<(ReconcileOutcome, Vec<Event>), ServiceError>
    where
        C: ConnectionTrait,
    {
        let now = Utc::now();
        let mut update = Payment::update_many()
            .col_expr(payment::Column::UpdatedAt, Expr::value(now))
            .col_expr(
                payment::Column::ProviderResponse,
                Expr::value(Some(callback.raw.clone())),
            );
        if let Some(transaction_id) = &callback.provider_transaction_id {
            update = update.col_expr(
                payment::Column::ProviderTransactionId,
                Expr::value(Some(transaction_id.clone())),
            );
        }
        update = match callback.status {
            CallbackStatus::Succeeded => update
                .col_expr(payment::Column::Status, Expr::value(PaymentState::Succeeded))
                .col_expr(payment::Column::ProcessedAt, Expr::value(Some(now))),
            CallbackStatus::Failed => update
                .col_expr(payment::Column::Status, Expr::value(PaymentState::Failed))
                .col_expr(payment::Column::FailedAt, Expr::value(Some(now)))
                .col_expr(
                    payment::Column::FailureReason,
                    Expr::value(Some(
                        callback
                            .failure_reason
                            .clone()
                            .unwrap_or_else(|| "declined".to_string()),
                    )),
                ),
        };

        let rows = update
            .filter(payment::Column::Id.eq(payment.id))
            .filter(payment::Column::Status.eq(PaymentState::Pending))
            .exec(conn)
            .await?
            .rows_affected;
        if rows == 0 {
            info!(payment_id = %payment.id, "duplicate payment callback ignored");
            return Ok((ReconcileOutcome::Duplicate, Vec::new()));
        }

        let order = Order::find_by_id(payment.order_id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", payment.order_id)))?;

        if callback.status == CallbackStatus::Failed {
            let event = Event::PaymentFailed {
                order_id: order.id,
                payment_id: payment.id,
                reason: callback
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "declined".to_string()),
            };
            return Ok((applied(&order), vec![event]));
        }

        let mut events = vec![Event::PaymentSucceeded {
            order_id: order.id,
            payment_id: payment.id,
        }];

        if order.status != OrderStatus::Pending {
            Payment::update_many()
                .col_expr(
                    payment::Column::Status,
                    Expr::value(PaymentState::RefundRequired),
                )
                .filter(payment::Column::Id.eq(payment.id))
                .exec(conn)
                .await?;
            warn!(
                order_id = %order.id,
                payment_id = %payment.id,
                status = %order.status,
                amount = %payment.amount,
                "payment captured for an order that is no longer pending, refund required"
            );
            events.push(Event::RefundRequired {
                order_id: order.id,
                payment_id: payment.id,
                amount: payment.amount,
            });
            return Ok((
                ReconcileOutcome::RefundRequired {
                    order_status: order.status,
                    payment_status: order.payment_status,
                },
                events,
            ));
        }

        let payments = Payment::find()
            .filter(payment::Column::OrderId.eq(order.id))
            .all(conn)
            .await?;
        let paid = succeeded_total(&payments);

        if paid < order.total_amount {
            let rows = Order::update_many()
                .col_expr(
                    order::Column::PaymentStatus,
                    Expr::value(PaymentStatus::PartiallyPaid),
                )
                .col_expr(
                    order::Column::Version,
                    Expr::col(order::Column::Version).add(1),
                )
                .col_expr(order::Column::UpdatedAt, Expr::value(now))
                .filter(order::Column::Id.eq(order.id))
                .filter(order::Column::Version.eq(order.version))
                .exec(conn)
                .await?
                .rows_affected;
            if rows == 0 {
                return Err(ServiceError::ConcurrentModification(order.id));
            }
            info!(order_id = %order.id, %paid, total = %order.total_amount, "order partially paid");
            return Ok((
                ReconcileOutcome::Applied {
                    order_status: OrderStatus::Pending,
                    payment_status: PaymentStatus::PartiallyPaid,
                },
                events,
            ));
        }

        let capture_comment = Some(format!("payment {} captured", payment.id));
        if stock_available {
            let committed = self.inventory.commit_for_order(conn, order.id).await?;
            let (order, change) = self
                .orders
                .apply(conn, order.id, OrderTransition::PaymentCaptured, None, capture_comment)
                .await?;
            events.push(change.event());
            events.extend(self.inventory.low_stock_events(conn, &committed).await?);
            return Ok((applied(&order), events));
        }

        let (_, captured) = self
            .orders
            .apply(conn, order.id, OrderTransition::PaymentCaptured, None, capture_comment)
            .await?;
        let (order, refund) = self
            .orders
            .apply(
                conn,
                order.id,
                OrderTransition::RequestRefund,
                None,
                Some("stock no longer available".to_string()),
            )
            .await?;
        self.inventory.release_for_order(conn, order.id).await?;
        events.push(captured.event());
        events.push(refund.event());
        Ok((applied(&order), events))
    }
}

fn applied(order: &order::Model) -> ReconcileOutcome {
    ReconcileOutcome::Applied {
        order_status: order.status,
        payment_status: order.payment_status,
    }
}

fn succeeded_total(payments: &[payment::Model]) -> Decimal {
    payments
        .iter()
        .filter(|p| p.status == PaymentState::Succeeded)
        .map(|p| p.amount)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";

    #[test]
    fn signature_round_trip_verifies() {
        let ts = Utc::now().timestamp().to_string();
        let body = br#"{"provider_payment_id":"pi_1","status":"succeeded"}"#;
        let sig = sign_webhook_payload(SECRET, &ts, body).unwrap();
        assert!(verify_webhook_signature(SECRET, &ts, body, &sig, 300).is_ok());
    }

    #[test]
    fn tampered_body_is_rejected() {
        let ts = Utc::now().timestamp().to_string();
        let sig = sign_webhook_payload(SECRET, &ts, b"{}").unwrap();
        let err = verify_webhook_signature(SECRET, &ts, b"{ }", &sig, 300).unwrap_err();
        assert!(matches!(err, ServiceError::Unauthorized(_)));
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let ts = (Utc::now().timestamp() - 3600).to_string();
        let sig = sign_webhook_payload(SECRET, &ts, b"{}").unwrap();
        assert!(verify_webhook_signature(SECRET, &ts, b"{}", &sig, 300).is_err());
    }

    #[test]
    fn duplicate_outcome_serialises_as_status() {
        let json = serde_json::to_value(ReconcileOutcome::Duplicate).unwrap();
        assert_eq!(json, serde_json::json!({"status": "duplicate"}));

        let json = serde_json::to_value(ReconcileOutcome::Applied {
            order_status: OrderStatus::Paid,
            payment_status: PaymentStatus::Paid,
        })
        .unwrap();
        assert_eq!(json["status"], "applied");
        assert_eq!(json["order_status"], "paid");

        let json = serde_json::to_value(ReconcileOutcome::RefundRequired {
            order_status: OrderStatus::Cancelled,
            payment_status: PaymentStatus::Pending,
        })
        .unwrap();
        assert_eq!(json["status"], "refund_required");
        assert_eq!(json["order_status"], "cancelled");
    }

    #[test]
    fn succeeded_total_ignores_other_states() {
        use rust_decimal_macros::dec;
        let base = payment::Model {
            id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            payment_method: "card".into(),
            payment_provider: "stripe".into(),
            provider_payment_id: None,
            provider_transaction_id: None,
            amount: dec!(500),
            currency: "MGA".into(),
            status: PaymentState::Succeeded,
            provider_response: None,
            failure_reason: None,
            attempts: 1,
            processed_at: None,
            failed_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let failed = payment::Model {
            status: PaymentState::Failed,
            ..base.clone()
        };
        let parked = payment::Model {
            status: PaymentState::RefundRequired,
            ..base.clone()
        };
        assert_eq!(succeeded_total(&[base.clone(), base, failed, parked]), dec!(1000));
    }
}
