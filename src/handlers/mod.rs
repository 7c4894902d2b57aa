pub mod admin;
pub mod carts;
pub mod orders;
pub mod payment_webhooks;

use sea_orm::DatabaseConnection;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::events::EventSender;
use crate::services::{
    cart::CartService,
    catalog::{Catalog, DbCatalog},
    checkout::CheckoutService,
    gateway::PaymentGateway,
    inventory::InventoryService,
    order_state::OrderStateMachine,
    payments::PaymentService,
};

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub inventory: InventoryService,
    pub carts: CartService,
    pub orders: OrderStateMachine,
    pub payments: PaymentService,
    pub checkout: CheckoutService,
}

impl AppServices {
    /// Wires every service over one pool, using the products tables as the catalog.
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: Arc<AppConfig>,
        event_sender: EventSender,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        let inventory = InventoryService::new(db.clone(), config.reservation_ttl());
        let catalog: Arc<dyn Catalog> = Arc::new(DbCatalog::new(db.clone(), inventory.clone()));
        Self::with_catalog(db, config, event_sender, gateway, catalog)
    }

    pub fn with_catalog(
        db: Arc<DatabaseConnection>,
        config: Arc<AppConfig>,
        event_sender: EventSender,
        gateway: Arc<dyn PaymentGateway>,
        catalog: Arc<dyn Catalog>,
    ) -> Self {
        let inventory = InventoryService::new(db.clone(), config.reservation_ttl());
        let carts = CartService::new(db.clone(), catalog, config.clone());
        let orders = OrderStateMachine::new(db.clone(), inventory.clone(), event_sender.clone());
        let payments = PaymentService::new(
            db.clone(),
            gateway,
            orders.clone(),
            inventory.clone(),
            config,
            event_sender.clone(),
        );
        let checkout = CheckoutService::new(
            db,
            carts.clone(),
            inventory.clone(),
            payments.clone(),
            event_sender,
        );

        Self {
            inventory,
            carts,
            orders,
            payments,
            checkout,
        }
    }
}
