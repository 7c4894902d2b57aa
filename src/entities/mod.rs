pub mod cart;
pub mod cart_item;
pub mod inventory_reservation;
pub mod order;
pub mod order_item;
pub mod order_status_history;
pub mod payment;
pub mod product;
pub mod product_variant;

pub use cart::{CartStatus, Entity as Cart};
pub use cart_item::Entity as CartItem;
pub use inventory_reservation::{Entity as InventoryReservation, ReservationStatus};
pub use order::{Entity as Order, FulfillmentStatus, OrderStatus, PaymentStatus};
pub use order_item::Entity as OrderItem;
pub use order_status_history::Entity as OrderStatusHistory;
pub use payment::{Entity as Payment, PaymentState};
pub use product::{Entity as Product, ProductStatus};
pub use product_variant::Entity as ProductVariant;
