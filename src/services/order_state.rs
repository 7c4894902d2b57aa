//! Order lifecycle.
//!
//! ```text
//! pending ──> paid ──> fulfilled ──> completed
//!    │          └────> refund_pending ──> refunded
//!    └──> cancelled
//! ```
//!
//! Every status change bumps `orders.version` under a `WHERE version = ?` guard
//! and appends exactly one row to `order_status_history`.

use chrono::Utc;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

use super::inventory::InventoryService;
use crate::db;
use crate::entities::{
    order, order_status_history, payment, FulfillmentStatus, Order, OrderStatus,
    OrderStatusHistory, Payment, PaymentState, PaymentStatus,
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};

impl OrderStatus {
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        self.allowed_transitions().contains(&next)
    }

    pub fn allowed_transitions(&self) -> &'static [OrderStatus] {
        match self {
            OrderStatus::Pending => &[OrderStatus::Paid, OrderStatus::Cancelled],
            OrderStatus::Paid => &[OrderStatus::Fulfilled, OrderStatus::RefundPending],
            OrderStatus::Fulfilled => &[OrderStatus::Completed],
            OrderStatus::RefundPending => &[OrderStatus::Refunded],
            OrderStatus::Completed | OrderStatus::Cancelled | OrderStatus::Refunded => &[],
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.allowed_transitions().is_empty()
    }
}

/// Payment statuses an order may carry while in `status`.
pub fn allowed_payment_statuses(status: OrderStatus) -> &'static [PaymentStatus] {
    match status {
        OrderStatus::Pending | OrderStatus::Cancelled => {
            &[PaymentStatus::Pending, PaymentStatus::PartiallyPaid]
        }
        OrderStatus::Paid
        | OrderStatus::Fulfilled
        | OrderStatus::Completed
        | OrderStatus::RefundPending => &[PaymentStatus::Paid],
        OrderStatus::Refunded => &[PaymentStatus::Refunded],
    }
}

pub fn check_joint_consistency(status: OrderStatus, payment_status: PaymentStatus) -> bool {
    allowed_payment_statuses(status).contains(&payment_status)
}

/// Lifecycle events. Each maps to one target status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrderTransition {
    PaymentCaptured,
    Cancel,
    Ship { tracking_number: String },
    Complete,
    RequestRefund,
    ConfirmRefund,
}

impl OrderTransition {
    pub fn target(&self) -> OrderStatus {
        match self {
            OrderTransition::PaymentCaptured => OrderStatus::Paid,
            OrderTransition::Cancel => OrderStatus::Cancelled,
            OrderTransition::Ship { .. } => OrderStatus::Fulfilled,
            OrderTransition::Complete => OrderStatus::Completed,
            OrderTransition::RequestRefund => OrderStatus::RefundPending,
            OrderTransition::ConfirmRefund => OrderStatus::Refunded,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusChange {
    pub order_id: Uuid,
    pub from: OrderStatus,
    pub to: OrderStatus,
    pub history_id: Uuid,
}

impl StatusChange {
    pub fn event(&self) -> Event {
        Event::OrderStatusChanged {
            order_id: self.order_id,
            from: self.from,
            to: self.to,
        }
    }
}

/// Appends an audit row. Callers write exactly one per status change.
pub async fn append_history<C>(
    conn: &C,
    order_id: Uuid,
    from: Option<OrderStatus>,
    to: OrderStatus,
    actor: Option<Uuid>,
    comment: Option<String>,
) -> Result<order_status_history::Model, ServiceError>
where
    C: ConnectionTrait,
{
    Ok(order_status_history::ActiveModel {
        id: Set(Uuid::new_v4()),
        order_id: Set(order_id),
        from_status: Set(from),
        status: Set(to),
        comment: Set(comment),
        changed_by_user_id: Set(actor),
        created_at: Set(Utc::now()),
    }
    .insert(conn)
    .await?)
}

#[derive(Clone)]
pub struct OrderStateMachine {
    db: Arc<DatabaseConnection>,
    inventory: InventoryService,
    event_sender: EventSender,
}

impl OrderStateMachine {
    pub fn new(
        db: Arc<DatabaseConnection>,
        inventory: InventoryService,
        event_sender: EventSender,
    ) -> Self {
        Self {
            db,
            inventory,
            event_sender,
        }
    }

    /// Applies `transition` on the caller's connection. Invalid transitions leave
    /// the order untouched; a concurrent writer surfaces as `ConcurrentModification`.
    #[instrument(skip(self, conn, comment), fields(order_id = %order_id, to = %transition.target()))]
    pub async fn apply<C>(
        &self,
        conn: &C,
        order_id: Uuid,
        transition: OrderTransition,
        actor: Option<Uuid>,
        comment: Option<String>,
    ) -> Result<(order::Model, StatusChange), ServiceError>
    where
        C: ConnectionTrait,
    {
        let mut order = Order::find_by_id(order_id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let from = order.status;
        let to = transition.target();
        if !from.can_transition_to(to) {
            return Err(ServiceError::invalid_transition(from, to));
        }

        let mut payment_status = order.payment_status;
        let mut fulfillment_status = order.fulfillment_status;
        let mut tracking_number = order.tracking_number.clone();
        match &transition {
            OrderTransition::PaymentCaptured => payment_status = PaymentStatus::Paid,
            OrderTransition::Ship {
                tracking_number: number,
            } => {
                if number.trim().is_empty() {
                    return Err(ServiceError::ValidationError(
                        "tracking_number is required to ship".to_string(),
                    ));
                }
                fulfillment_status = FulfillmentStatus::Shipped;
                tracking_number = Some(number.trim().to_string());
            }
            OrderTransition::Complete => fulfillment_status = FulfillmentStatus::Delivered,
            OrderTransition::ConfirmRefund => payment_status = PaymentStatus::Refunded,
            OrderTransition::Cancel | OrderTransition::RequestRefund => {}
        }

        if !check_joint_consistency(to, payment_status) {
            return Err(ServiceError::invalid_transition(from, to));
        }

        let now = Utc::now();
        let rows = Order::update_many()
            .col_expr(order::Column::Status, Expr::value(to))
            .col_expr(order::Column::PaymentStatus, Expr::value(payment_status))
            .col_expr(
                order::Column::FulfillmentStatus,
                Expr::value(fulfillment_status),
            )
            .col_expr(
                order::Column::TrackingNumber,
                Expr::value(tracking_number.clone()),
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

        match transition {
            OrderTransition::ConfirmRefund => {
                Payment::update_many()
                    .col_expr(payment::Column::Status, Expr::value(PaymentState::Refunded))
                    .col_expr(payment::Column::UpdatedAt, Expr::value(now))
                    .filter(payment::Column::OrderId.eq(order.id))
                    .filter(payment::Column::Status.eq(PaymentState::Succeeded))
                    .exec(conn)
                    .await?;
            }
            OrderTransition::Cancel if from == OrderStatus::Pending => {
                self.inventory.release_for_order(conn, order.id).await?;
            }
            _ => {}
        }

        let history = append_history(conn, order.id, Some(from), to, actor, comment).await?;

        order.status = to;
        order.payment_status = payment_status;
        order.fulfillment_status = fulfillment_status;
        order.tracking_number = tracking_number;
        order.version += 1;
        order.updated_at = now;

        info!(from = %from, to = %to, "order status changed");
        Ok((
            order,
            StatusChange {
                order_id,
                from,
                to,
                history_id: history.id,
            },
        ))
    }

    /// Applies a transition in its own transaction and notifies after commit.
    pub async fn transition(
        &self,
        order_id: Uuid,
        transition: OrderTransition,
        actor: Option<Uuid>,
        comment: Option<String>,
    ) -> Result<order::Model, ServiceError> {
        let started = Instant::now();
        let txn = db::begin(&self.db, "order_transition").await?;
        let (order, change) = self
            .apply(&txn, order_id, transition, actor, comment)
            .await?;
        db::commit(txn, "order_transition", started).await?;

        self.event_sender.publish(change.event()).await;
        Ok(order)
    }

    pub async fn history(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<order_status_history::Model>, ServiceError> {
        Ok(OrderStatusHistory::find()
            .filter(order_status_history::Column::OrderId.eq(order_id))
            .order_by_asc(order_status_history::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::Iterable;

    #[test]
    fn lifecycle_edges() {
        use OrderStatus::*;
        assert!(Pending.can_transition_to(Paid));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Paid.can_transition_to(Fulfilled));
        assert!(Paid.can_transition_to(RefundPending));
        assert!(Fulfilled.can_transition_to(Completed));
        assert!(RefundPending.can_transition_to(Refunded));

        assert!(!Pending.can_transition_to(Fulfilled));
        assert!(!Paid.can_transition_to(Cancelled));
        assert!(!Completed.can_transition_to(Paid));
        assert!(!Cancelled.can_transition_to(Pending));
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for status in OrderStatus::iter() {
            assert_eq!(
                status.is_terminal(),
                matches!(
                    status,
                    OrderStatus::Completed | OrderStatus::Cancelled | OrderStatus::Refunded
                ),
                "{status}"
            );
        }
    }

    #[test]
    fn every_transition_target_keeps_payment_status_consistent() {
        let cases = [
            (OrderTransition::PaymentCaptured, PaymentStatus::Paid),
            (OrderTransition::Cancel, PaymentStatus::Pending),
            (
                OrderTransition::Ship {
                    tracking_number: "TRK1".into(),
                },
                PaymentStatus::Paid,
            ),
            (OrderTransition::Complete, PaymentStatus::Paid),
            (OrderTransition::RequestRefund, PaymentStatus::Paid),
            (OrderTransition::ConfirmRefund, PaymentStatus::Refunded),
        ];
        for (transition, payment_status) in cases {
            assert!(
                check_joint_consistency(transition.target(), payment_status),
                "{:?}",
                transition
            );
        }
        assert!(!check_joint_consistency(
            OrderStatus::Paid,
            PaymentStatus::PartiallyPaid
        ));
        assert!(!check_joint_consistency(
            OrderStatus::Refunded,
            PaymentStatus::Paid
        ));
    }
}
