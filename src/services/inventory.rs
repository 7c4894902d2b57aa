//! Inventory ledger: available stock per product or variant and the time-boxed
//! reservations held against it.
//!
//! Each stock row carries a `reserved_quantity` counter next to `stock_quantity`.
//! Reserving increments the counter with a single conditional `UPDATE`, so two
//! concurrent reservations on the same row can never both pass the availability
//! check. Expired reservations are reclaimed lazily before every reservation on
//! the same stock unit and in bulk by [`InventoryService::sweep`].

use chrono::{DateTime, Duration, Utc};
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr,
    EntityTrait, QueryFilter, Set,
};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::db;
use crate::entities::inventory_reservation::{self, ReservationStatus};
use crate::entities::{product, product_variant, InventoryReservation, Product, ProductVariant};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};

pub type Reservation = inventory_reservation::Model;

/// The row whose stock is counted: the variant when one is referenced, else the product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StockUnit {
    Product(Uuid),
    Variant { product_id: Uuid, variant_id: Uuid },
}

impl StockUnit {
    pub fn new(product_id: Uuid, variant_id: Option<Uuid>) -> Self {
        match variant_id {
            Some(variant_id) => StockUnit::Variant {
                product_id,
                variant_id,
            },
            None => StockUnit::Product(product_id),
        }
    }

    pub fn product_id(&self) -> Uuid {
        match *self {
            StockUnit::Product(id) => id,
            StockUnit::Variant { product_id, .. } => product_id,
        }
    }

    pub fn variant_id(&self) -> Option<Uuid> {
        match *self {
            StockUnit::Product(_) => None,
            StockUnit::Variant { variant_id, .. } => Some(variant_id),
        }
    }

    /// Applies deltas to the unit's stock and reserved counters in one statement.
    /// With `required_available`, the update only happens while
    /// `stock_quantity - reserved_quantity >= required_available`.
    async fn update_counters<C>(
        &self,
        conn: &C,
        stock_delta: i32,
        reserved_delta: i32,
        required_available: Option<i32>,
    ) -> Result<bool, ServiceError>
    where
        C: ConnectionTrait,
    {
        let rows = match *self {
            StockUnit::Product(id) => {
                conditional_stock_update::<_, Product>(
                    conn,
                    product::Column::Id,
                    id,
                    product::Column::StockQuantity,
                    product::Column::ReservedQuantity,
                    product::Column::UpdatedAt,
                    (stock_delta, reserved_delta),
                    required_available,
                )
                .await
            }
            StockUnit::Variant { variant_id, .. } => {
                conditional_stock_update::<_, ProductVariant>(
                    conn,
                    product_variant::Column::Id,
                    variant_id,
                    product_variant::Column::StockQuantity,
                    product_variant::Column::ReservedQuantity,
                    product_variant::Column::UpdatedAt,
                    (stock_delta, reserved_delta),
                    required_available,
                )
                .await
            }
        }
        .map_err(ServiceError::db_error)?;

        Ok(rows > 0)
    }
}

impl fmt::Display for StockUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StockUnit::Product(id) => write!(f, "product {}", id),
            StockUnit::Variant { variant_id, .. } => write!(f, "variant {}", variant_id),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn conditional_stock_update<C, E>(
    conn: &C,
    id_col: E::Column,
    id: Uuid,
    stock_col: E::Column,
    reserved_col: E::Column,
    updated_col: E::Column,
    (stock_delta, reserved_delta): (i32, i32),
    required_available: Option<i32>,
) -> Result<u64, DbErr>
where
    C: ConnectionTrait,
    E: EntityTrait,
{
    let mut update = E::update_many()
        .col_expr(updated_col, Expr::value(Utc::now()))
        .filter(id_col.eq(id));

    if stock_delta != 0 {
        update = update.col_expr(stock_col, Expr::col(stock_col).add(stock_delta));
    }
    if reserved_delta != 0 {
        update = update.col_expr(reserved_col, Expr::col(reserved_col).add(reserved_delta));
    }
    if let Some(required) = required_available {
        update = update
            .filter(Expr::expr(Expr::col(stock_col).sub(Expr::col(reserved_col))).gte(required));
    }

    Ok(update.exec(conn).await?.rows_affected)
}

#[derive(Debug, Clone)]
pub struct ReserveRequest {
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub quantity: i32,
    pub cart_id: Option<Uuid>,
    pub order_id: Option<Uuid>,
}

/// Point-in-time stock for a product or variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StockLevel {
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub on_hand: i32,
    pub reserved: i32,
    pub available: i32,
    pub track_inventory: bool,
    pub allow_backorders: bool,
}

impl StockLevel {
    pub fn can_supply(&self, quantity: i32) -> bool {
        !self.track_inventory || self.allow_backorders || self.available >= quantity
    }

    /// Units that can still be promised, `None` when unlimited.
    pub fn sellable(&self) -> Option<i32> {
        if !self.track_inventory || self.allow_backorders {
            None
        } else {
            Some(self.available.max(0))
        }
    }
}

/// Result of reclaiming expired reservations.
#[derive(Debug, Clone, Serialize)]
pub struct SweepResult {
    pub expired_count: u64,
    pub swept_at: DateTime<Utc>,
}

async fn load_stock_unit<C>(
    conn: &C,
    unit: StockUnit,
) -> Result<(product::Model, Option<product_variant::Model>), ServiceError>
where
    C: ConnectionTrait,
{
    let product = Product::find_by_id(unit.product_id())
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", unit.product_id())))?;

    let variant = match unit.variant_id() {
        Some(variant_id) => Some(
            ProductVariant::find_by_id(variant_id)
                .filter(product_variant::Column::ProductId.eq(product.id))
                .one(conn)
                .await?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!("Variant {} not found", variant_id))
                })?,
        ),
        None => None,
    };

    Ok((product, variant))
}

fn unit_filter(unit: StockUnit) -> sea_orm::Condition {
    let mut condition = sea_orm::Condition::all()
        .add(inventory_reservation::Column::ProductId.eq(unit.product_id()));
    condition = match unit.variant_id() {
        Some(variant_id) => condition.add(inventory_reservation::Column::VariantId.eq(variant_id)),
        None => condition.add(inventory_reservation::Column::VariantId.is_null()),
    };
    condition
}

/// Inventory ledger operations. Every mutating method runs on the caller's
/// connection so it can join a larger transaction.
#[derive(Clone)]
pub struct InventoryService {
    db: Arc<DatabaseConnection>,
    reservation_ttl: Duration,
}

impl InventoryService {
    pub fn new(db: Arc<DatabaseConnection>, reservation_ttl: Duration) -> Self {
        Self {
            db,
            reservation_ttl,
        }
    }

    pub fn reservation_ttl(&self) -> Duration {
        self.reservation_ttl
    }

    /// Holds `quantity` units for a cart or order until the reservation window ends.
    #[instrument(skip(self, conn), fields(product_id = %request.product_id, quantity = request.quantity))]
    pub async fn reserve<C>(&self, conn: &C, request: ReserveRequest) -> Result<Reservation, ServiceError>
    where
        C: ConnectionTrait,
    {
        if request.quantity <= 0 {
            return Err(ServiceError::ValidationError(
                "Reservation quantity must be positive".to_string(),
            ));
        }

        let unit = StockUnit::new(request.product_id, request.variant_id);
        let (product, _) = load_stock_unit(conn, unit).await?;
        let now = Utc::now();

        self.reclaim_expired_for_unit(conn, unit, now).await?;

        if product.track_inventory {
            let required = (!product.allow_backorders).then_some(request.quantity);
            if !unit
                .update_counters(conn, 0, request.quantity, required)
                .await?
            {
                let level = self.availability(conn, unit.product_id(), unit.variant_id()).await?;
                return Err(ServiceError::InsufficientStock(format!(
                    "{} requested, {} available for {}",
                    request.quantity, level.available, unit
                )));
            }
        }

        let reservation = inventory_reservation::ActiveModel {
            id: Set(Uuid::new_v4()),
            product_id: Set(request.product_id),
            variant_id: Set(request.variant_id),
            cart_id: Set(request.cart_id),
            order_id: Set(request.order_id),
            quantity: Set(request.quantity),
            status: Set(ReservationStatus::Active),
            tracked: Set(product.track_inventory),
            expires_at: Set(now + self.reservation_ttl),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(conn)
        .await?;

        debug!(reservation_id = %reservation.id, %unit, "stock reserved");
        Ok(reservation)
    }

    /// Turns a reservation into a sale: decrements stock and the reserved counter.
    ///
    /// A reservation that already lapsed is re-acquired from available stock and
    /// fails with `InsufficientStock` when that stock is gone. On error the caller
    /// must roll back its transaction.
    #[instrument(skip(self, conn))]
    pub async fn commit<C>(&self, conn: &C, reservation_id: Uuid) -> Result<Reservation, ServiceError>
    where
        C: ConnectionTrait,
    {
        let mut reservation = InventoryReservation::find_by_id(reservation_id)
            .one(conn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Reservation {} not found", reservation_id))
            })?;

        if reservation.status == ReservationStatus::Committed {
            return Ok(reservation);
        }

        let unit = StockUnit::new(reservation.product_id, reservation.variant_id);
        let (product, _) = load_stock_unit(conn, unit).await?;
        let now = Utc::now();
        let quantity = reservation.quantity;

        let mut observed = reservation.status;
        if observed == ReservationStatus::Active && reservation.is_expired_at(now) {
            close_reservation(conn, &reservation, ReservationStatus::Expired, now).await?;
            observed = ReservationStatus::Expired;
        }
        let held = observed == ReservationStatus::Active;

        let rows = InventoryReservation::update_many()
            .col_expr(
                inventory_reservation::Column::Status,
                Expr::value(ReservationStatus::Committed),
            )
            .col_expr(inventory_reservation::Column::UpdatedAt, Expr::value(now))
            .filter(inventory_reservation::Column::Id.eq(reservation.id))
            .filter(inventory_reservation::Column::Status.eq(observed))
            .exec(conn)
            .await?
            .rows_affected;
        if rows == 0 {
            return Err(ServiceError::ConcurrentModification(reservation.id));
        }

        // Only a live tracked hold already counts against stock; anything else is
        // re-acquired from what is available.
        let covered = held && reservation.tracked;
        let reserved_delta = if covered { -quantity } else { 0 };
        let (stock_delta, required) = if product.track_inventory {
            let required = (!covered && !product.allow_backorders).then_some(quantity);
            (-quantity, required)
        } else {
            (0, None)
        };
        if stock_delta != 0 || reserved_delta != 0 {
            let applied = unit
                .update_counters(conn, stock_delta, reserved_delta, required)
                .await?;
            if !applied {
                return Err(ServiceError::InsufficientStock(format!(
                    "reservation {} could not be re-acquired, {} no longer has {} available",
                    reservation.id, unit, quantity
                )));
            }
        }

        Product::update_many()
            .col_expr(
                product::Column::SalesCount,
                Expr::col(product::Column::SalesCount).add(quantity),
            )
            .filter(product::Column::Id.eq(product.id))
            .exec(conn)
            .await?;

        if product.track_inventory {
            let level = self.availability(conn, unit.product_id(), unit.variant_id()).await?;
            if level.on_hand <= product.low_stock_threshold {
                warn!(
                    %unit,
                    on_hand = level.on_hand,
                    threshold = product.low_stock_threshold,
                    "stock below low-stock threshold"
                );
            }
        }

        reservation.status = ReservationStatus::Committed;
        reservation.updated_at = now;
        Ok(reservation)
    }

    /// Returns the held quantity to available stock. Idempotent: releasing a
    /// reservation that is no longer active does nothing and returns `false`.
    #[instrument(skip(self, conn))]
    pub async fn release<C>(&self, conn: &C, reservation_id: Uuid) -> Result<bool, ServiceError>
    where
        C: ConnectionTrait,
    {
        let Some(reservation) = InventoryReservation::find_by_id(reservation_id)
            .one(conn)
            .await?
        else {
            return Err(ServiceError::NotFound(format!(
                "Reservation {} not found",
                reservation_id
            )));
        };

        if reservation.status != ReservationStatus::Active {
            return Ok(false);
        }

        close_reservation(conn, &reservation, ReservationStatus::Released, Utc::now()).await
    }

    /// Releases every active reservation held for an order.
    #[instrument(skip(self, conn))]
    pub async fn release_for_order<C>(&self, conn: &C, order_id: Uuid) -> Result<u64, ServiceError>
    where
        C: ConnectionTrait,
    {
        let reservations = InventoryReservation::find()
            .filter(inventory_reservation::Column::OrderId.eq(order_id))
            .filter(inventory_reservation::Column::Status.eq(ReservationStatus::Active))
            .all(conn)
            .await?;

        let mut released = 0;
        for reservation in reservations {
            if self.release(conn, reservation.id).await? {
                released += 1;
            }
        }

        info!(order_id = %order_id, released, "released order reservations");
        Ok(released)
    }

    /// Commits every outstanding reservation of an order, re-acquiring lapsed ones.
    #[instrument(skip(self, conn))]
    pub async fn commit_for_order<C>(
        &self,
        conn: &C,
        order_id: Uuid,
    ) -> Result<Vec<Reservation>, ServiceError>
    where
        C: ConnectionTrait,
    {
        let reservations = InventoryReservation::find()
            .filter(inventory_reservation::Column::OrderId.eq(order_id))
            .filter(
                inventory_reservation::Column::Status
                    .is_in([ReservationStatus::Active, ReservationStatus::Expired]),
            )
            .all(conn)
            .await?;

        let mut committed = Vec::with_capacity(reservations.len());
        for reservation in reservations {
            committed.push(self.commit(conn, reservation.id).await?);
        }
        Ok(committed)
    }

    /// Reclaims every active reservation whose window has closed.
    #[instrument(skip(self, conn))]
    pub async fn sweep_expired<C>(&self, conn: &C) -> Result<SweepResult, ServiceError>
    where
        C: ConnectionTrait,
    {
        let now = Utc::now();
        let expired = InventoryReservation::find()
            .filter(inventory_reservation::Column::Status.eq(ReservationStatus::Active))
            .filter(inventory_reservation::Column::ExpiresAt.lte(now))
            .all(conn)
            .await?;

        let mut expired_count = 0;
        for reservation in expired {
            if close_reservation(conn, &reservation, ReservationStatus::Expired, now).await?
            {
                expired_count += 1;
            }
        }

        if expired_count > 0 {
            info!(expired_count, "reclaimed expired reservations");
        }

        Ok(SweepResult {
            expired_count,
            swept_at: now,
        })
    }

    /// Current stock for a product or variant. Active reservations past their
    /// window are already counted as available.
    pub async fn availability<C>(
        &self,
        conn: &C,
        product_id: Uuid,
        variant_id: Option<Uuid>,
    ) -> Result<StockLevel, ServiceError>
    where
        C: ConnectionTrait,
    {
        let unit = StockUnit::new(product_id, variant_id);
        let (product, variant) = load_stock_unit(conn, unit).await?;

        let (on_hand, reserved_counter) = match &variant {
            Some(v) => (v.stock_quantity, v.reserved_quantity),
            None => (product.stock_quantity, product.reserved_quantity),
        };

        let lapsed: i32 = InventoryReservation::find()
            .filter(unit_filter(unit))
            .filter(inventory_reservation::Column::Status.eq(ReservationStatus::Active))
            .filter(inventory_reservation::Column::ExpiresAt.lte(Utc::now()))
            .all(conn)
            .await?
            .iter()
            .map(|r| r.quantity)
            .sum();

        let reserved = (reserved_counter - lapsed).max(0);
        Ok(StockLevel {
            product_id,
            variant_id,
            on_hand,
            reserved,
            available: on_hand - reserved,
            track_inventory: product.track_inventory,
            allow_backorders: product.allow_backorders,
        })
    }

    /// `LowStock` events for the stock units touched by `reservations` that sit
    /// at or under their product's threshold.
    pub async fn low_stock_events<C>(
        &self,
        conn: &C,
        reservations: &[Reservation],
    ) -> Result<Vec<Event>, ServiceError>
    where
        C: ConnectionTrait,
    {
        let mut seen = std::collections::HashSet::new();
        let mut events = Vec::new();
        for reservation in reservations {
            let unit = StockUnit::new(reservation.product_id, reservation.variant_id);
            if !seen.insert(unit) {
                continue;
            }
            let (product, _) = load_stock_unit(conn, unit).await?;
            if !product.track_inventory {
                continue;
            }
            let level = self.availability(conn, unit.product_id(), unit.variant_id()).await?;
            if level.on_hand <= product.low_stock_threshold {
                events.push(Event::LowStock {
                    product_id: unit.product_id(),
                    variant_id: unit.variant_id(),
                    remaining: level.on_hand,
                });
            }
        }
        Ok(events)
    }

    async fn reclaim_expired_for_unit<C>(
        &self,
        conn: &C,
        unit: StockUnit,
        now: DateTime<Utc>,
    ) -> Result<u64, ServiceError>
    where
        C: ConnectionTrait,
    {
        let expired = InventoryReservation::find()
            .filter(unit_filter(unit))
            .filter(inventory_reservation::Column::Status.eq(ReservationStatus::Active))
            .filter(inventory_reservation::Column::ExpiresAt.lte(now))
            .all(conn)
            .await?;

        let mut reclaimed = 0;
        for reservation in expired {
            if close_reservation(conn, &reservation, ReservationStatus::Expired, now).await? {
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            debug!(%unit, reclaimed, "lazily expired reservations");
        }
        Ok(reclaimed)
    }

    /// Sweeps expired reservations in a transaction of its own.
    pub async fn sweep(&self) -> Result<SweepResult, ServiceError> {
        let started = std::time::Instant::now();
        let txn = db::begin(&self.db, "reservation_sweep").await?;
        let result = self.sweep_expired(&txn).await?;
        db::commit(txn, "reservation_sweep", started).await?;
        Ok(result)
    }
}

/// Moves an active reservation to a closed status and gives its units back when
/// the hold was counted. Returns `false` when another caller closed it first.
async fn close_reservation<C>(
    conn: &C,
    reservation: &Reservation,
    to: ReservationStatus,
    now: DateTime<Utc>,
) -> Result<bool, ServiceError>
where
    C: ConnectionTrait,
{
    let rows = InventoryReservation::update_many()
        .col_expr(inventory_reservation::Column::Status, Expr::value(to))
        .col_expr(inventory_reservation::Column::UpdatedAt, Expr::value(now))
        .filter(inventory_reservation::Column::Id.eq(reservation.id))
        .filter(inventory_reservation::Column::Status.eq(ReservationStatus::Active))
        .exec(conn)
        .await?
        .rows_affected;

    if rows == 0 {
        return Ok(false);
    }

    if reservation.tracked {
        let unit = StockUnit::new(reservation.product_id, reservation.variant_id);
        unit.update_counters(conn, 0, -reservation.quantity, None)
            .await?;
    }
    Ok(true)
}

/// Periodically reclaims expired reservations. An interval of zero disables the task.
pub fn spawn_reservation_sweeper(
    inventory: InventoryService,
    interval: std::time::Duration,
    events: EventSender,
) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        info!("Reservation sweeper disabled");
        return None;
    }

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match inventory.sweep().await {
                Ok(result) if result.expired_count > 0 => {
                    events
                        .publish(Event::ReservationsExpired {
                            count: result.expired_count,
                        })
                        .await;
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "reservation sweep failed"),
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stock_unit_prefers_variant() {
        let product_id = Uuid::new_v4();
        let variant_id = Uuid::new_v4();
        let unit = StockUnit::new(product_id, Some(variant_id));
        assert_eq!(unit.product_id(), product_id);
        assert_eq!(unit.variant_id(), Some(variant_id));
        assert_eq!(StockUnit::new(product_id, None), StockUnit::Product(product_id));
    }

    #[test]
    fn backorders_and_untracked_stock_are_unlimited() {
        let mut level = StockLevel {
            product_id: Uuid::new_v4(),
            variant_id: None,
            on_hand: 1,
            reserved: 1,
            available: 0,
            track_inventory: true,
            allow_backorders: false,
        };
        assert!(!level.can_supply(1));
        assert_eq!(level.sellable(), Some(0));

        level.allow_backorders = true;
        assert!(level.can_supply(5));
        assert_eq!(level.sellable(), None);

        level.allow_backorders = false;
        level.track_inventory = false;
        assert!(level.can_supply(5));
    }
}
