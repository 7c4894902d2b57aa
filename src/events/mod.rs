use async_trait::async_trait;
use metrics::counter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::entities::OrderStatus;
use crate::errors::ServiceError;

/// Domain events published after the owning transaction commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, strum::IntoStaticStr)]
#[serde(tag = "type", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Event {
    OrderCreated {
        order_id: Uuid,
        order_number: String,
    },
    OrderStatusChanged {
        order_id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
    },
    PaymentSucceeded {
        order_id: Uuid,
        payment_id: Uuid,
    },
    PaymentFailed {
        order_id: Uuid,
        payment_id: Uuid,
        reason: String,
    },
    /// Money was captured that the order cannot keep.
    RefundRequired {
        order_id: Uuid,
        payment_id: Uuid,
        amount: Decimal,
    },
    ReservationsExpired {
        count: u64,
    },
    LowStock {
        product_id: Uuid,
        variant_id: Option<Uuid>,
        remaining: i32,
    },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        self.into()
    }
}

#[derive(Clone, Debug)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Queues an event without waiting for channel capacity.
    pub fn send(&self, event: Event) -> Result<(), ServiceError> {
        self.sender.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) => ServiceError::EventError("event channel full".to_string()),
            TrySendError::Closed(_) => {
                ServiceError::EventError("event channel closed".to_string())
            }
        })
    }

    /// Fire-and-forget publish. A full or closed channel drops the event with a
    /// warning; the caller never waits on the notifier.
    pub async fn publish(&self, event: Event) {
        let kind = event.kind();
        if let Err(e) = self.send(event) {
            counter!("artizaho_events.dropped", 1, "event" => kind);
            warn!(event = kind, error = %e, "dropping event");
        }
    }
}

/// Receives events for delivery to users (email, SMS, push). Delivery itself lives
/// outside this service.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &Event) -> Result<(), ServiceError>;
}

/// Default notifier: writes each event to the log.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &Event) -> Result<(), ServiceError> {
        match event {
            Event::OrderStatusChanged { order_id, from, to } => {
                info!(order_id = %order_id, from = %from, to = %to, "order status changed")
            }
            Event::LowStock {
                product_id,
                variant_id,
                remaining,
            } => warn!(product_id = %product_id, ?variant_id, remaining, "low stock"),
            Event::RefundRequired {
                order_id,
                payment_id,
                amount,
            } => warn!(order_id = %order_id, payment_id = %payment_id, %amount, "refund required"),
            other => info!(event = other.kind(), payload = ?other, "event"),
        }
        Ok(())
    }
}

/// Drains the event channel until every sender is dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>, notifier: Arc<dyn Notifier>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        let kind = event.kind();
        counter!("artizaho_events.processed", 1, "event" => kind);

        if let Err(e) = notifier.notify(&event).await {
            error!(event = kind, error = %e, "notifier failed");
        }
    }

    info!("Event processing loop stopped");
}
