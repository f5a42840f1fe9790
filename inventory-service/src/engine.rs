use chrono::{Duration, Utc};
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use tracing::info;
use uuid::Uuid;

use crate::error::{EngineResult, ReservationError};
use crate::models::*;
use crate::schema::*;

pub type DbPool = Pool<AsyncPgConnection>;

const LIST_PAGE_SIZE: i64 = 10;

#[derive(Debug, Clone)]
pub struct ReserveRequest {
    pub product_id: Uuid,
    pub quantity: i32,
    pub warehouse: Option<String>,
    pub idempotency_key: String,
    pub order_id: Uuid,
}

/// Arbitrates all stock mutations. Every mutating operation runs inside a
/// single transaction with `FOR UPDATE` row locks on the contended rows, so
/// the database serializes callers racing for the same stock.
#[derive(Clone)]
pub struct ReservationEngine {
    pool: DbPool,
    ttl: Duration,
}

impl ReservationEngine {
    pub fn new(pool: DbPool, ttl_minutes: i64) -> Self {
        Self {
            pool,
            ttl: Duration::minutes(ttl_minutes),
        }
    }

    /// Reserve stock under a time-bounded hold. Returns the reservation and
    /// whether it was an idempotent replay of an earlier request.
    pub async fn reserve(&self, req: ReserveRequest) -> EngineResult<(Reservation, bool)> {
        validate_reserve(&req)?;

        let mut conn = self.pool.get().await?;

        if let Some(existing) = find_by_key(&mut conn, &req.idempotency_key).await? {
            info!(
                "Returning existing reservation {} for idempotency key {}",
                existing.id, existing.idempotency_key
            );
            return Ok((existing, true));
        }

        let key = req.idempotency_key.clone();
        let ttl = self.ttl;

        let result = conn
            .transaction::<Reservation, ReservationError, _>(|conn| {
                Box::pin(async move {
                    // Lock every candidate row up front, in a deterministic
                    // order, before inspecting availability.
                    let candidates: Vec<StockRecord> = match req.warehouse.as_deref() {
                        Some(warehouse) => {
                            stock_records::table
                                .filter(stock_records::product_id.eq(req.product_id))
                                .filter(stock_records::warehouse.eq(warehouse))
                                .order((
                                    stock_records::warehouse.asc(),
                                    stock_records::on_hand.desc(),
                                ))
                                .for_update()
                                .load(conn)
                                .await?
                        }
                        None => {
                            stock_records::table
                                .filter(stock_records::product_id.eq(req.product_id))
                                .order((
                                    stock_records::warehouse.asc(),
                                    stock_records::on_hand.desc(),
                                ))
                                .for_update()
                                .load(conn)
                                .await?
                        }
                    };

                    let chosen = match pick_candidate(&candidates, req.quantity) {
                        Some(record) => record.clone(),
                        None => {
                            return Err(ReservationError::InsufficientInventory {
                                product_id: req.product_id,
                                requested: req.quantity,
                            })
                        }
                    };

                    let now = Utc::now();

                    diesel::update(stock_records::table.filter(stock_records::id.eq(chosen.id)))
                        .set((
                            stock_records::reserved.eq(stock_records::reserved + req.quantity),
                            stock_records::updated_at.eq(now),
                        ))
                        .execute(conn)
                        .await?;

                    let new_reservation = NewReservation {
                        id: Uuid::new_v4(),
                        product_id: req.product_id,
                        warehouse: chosen.warehouse.clone(),
                        quantity: req.quantity,
                        order_id: req.order_id,
                        idempotency_key: req.idempotency_key.clone(),
                        status: ReservationStatus::Reserved.as_str().to_string(),
                        reserved_at: now,
                        expires_at: now + ttl,
                        updated_at: now,
                    };

                    let reservation = diesel::insert_into(reservations::table)
                        .values(&new_reservation)
                        .get_result::<Reservation>(conn)
                        .await?;

                    Ok(reservation)
                })
            })
            .await;

        let reservation = match result {
            Ok(reservation) => reservation,
            Err(err) if err.is_unique_violation() => {
                // Lost an insert race on the idempotency key; the whole
                // transaction rolled back, so echo the winner's row.
                match find_by_key(&mut conn, &key).await? {
                    Some(existing) => return Ok((existing, true)),
                    None => return Err(err),
                }
            }
            Err(err) => return Err(err),
        };

        info!(
            "Reserved {} units of product {} in warehouse {} (reservation {})",
            reservation.quantity, reservation.product_id, reservation.warehouse, reservation.id
        );

        Ok((reservation, false))
    }

    /// Cancel a hold: frees the reserved units without touching on-hand.
    pub async fn release(
        &self,
        idempotency_key: String,
        order_id: Uuid,
    ) -> EngineResult<Reservation> {
        self.settle(idempotency_key, order_id, ReservationStatus::Released)
            .await
    }

    /// Finalize a hold: consumes physical stock (on-hand and reserved both
    /// drop by the reserved quantity).
    pub async fn ship(&self, idempotency_key: String, order_id: Uuid) -> EngineResult<Reservation> {
        self.settle(idempotency_key, order_id, ReservationStatus::Shipped)
            .await
    }

    async fn settle(
        &self,
        idempotency_key: String,
        order_id: Uuid,
        target: ReservationStatus,
    ) -> EngineResult<Reservation> {
        if idempotency_key.trim().is_empty() {
            return Err(ReservationError::validation(
                "idempotency_key must not be empty",
            ));
        }

        let mut conn = self.pool.get().await?;

        let updated = conn
            .transaction::<Reservation, ReservationError, _>(|conn| {
                Box::pin(async move {
                    let reservation = reservations::table
                        .filter(reservations::idempotency_key.eq(&idempotency_key))
                        .filter(reservations::order_id.eq(order_id))
                        .for_update()
                        .first::<Reservation>(conn)
                        .await
                        .optional()?
                        .ok_or(ReservationError::ReservationNotFound)?;

                    ensure_reserved(&reservation)?;

                    let stock = stock_records::table
                        .filter(stock_records::product_id.eq(reservation.product_id))
                        .filter(stock_records::warehouse.eq(&reservation.warehouse))
                        .for_update()
                        .first::<StockRecord>(conn)
                        .await
                        .optional()?
                        .ok_or_else(|| {
                            ReservationError::integrity(format!(
                                "no stock record for product {} in warehouse {}",
                                reservation.product_id, reservation.warehouse
                            ))
                        })?;

                    let now = Utc::now();

                    if target == ReservationStatus::Shipped {
                        diesel::update(
                            stock_records::table.filter(stock_records::id.eq(stock.id)),
                        )
                        .set((
                            stock_records::on_hand
                                .eq(stock_records::on_hand - reservation.quantity),
                            stock_records::reserved
                                .eq(stock_records::reserved - reservation.quantity),
                            stock_records::updated_at.eq(now),
                        ))
                        .execute(conn)
                        .await?;
                    } else {
                        diesel::update(
                            stock_records::table.filter(stock_records::id.eq(stock.id)),
                        )
                        .set((
                            stock_records::reserved
                                .eq(stock_records::reserved - reservation.quantity),
                            stock_records::updated_at.eq(now),
                        ))
                        .execute(conn)
                        .await?;
                    }

                    let updated = diesel::update(
                        reservations::table.filter(reservations::id.eq(reservation.id)),
                    )
                    .set((
                        reservations::status.eq(target.as_str()),
                        reservations::updated_at.eq(now),
                    ))
                    .get_result::<Reservation>(conn)
                    .await?;

                    Ok(updated)
                })
            })
            .await?;

        info!(
            "Reservation {} moved to {} for order {}",
            updated.id, updated.status, updated.order_id
        );

        Ok(updated)
    }

    /// Consistent read of per-warehouse and aggregate stock for a product.
    pub async fn check_availability(&self, product_id: Uuid) -> EngineResult<AvailabilityReport> {
        let mut conn = self.pool.get().await?;

        let records: Vec<StockRecord> = stock_records::table
            .filter(stock_records::product_id.eq(product_id))
            .order(stock_records::warehouse.asc())
            .load(&mut conn)
            .await?;

        Ok(AvailabilityReport::from_records(product_id, &records))
    }

    /// Counts of reservations by status plus the number of open holds
    /// expiring within the next hour.
    pub async fn reservation_status(&self) -> EngineResult<ReservationStatusReport> {
        let mut conn = self.pool.get().await?;

        let counts: Vec<(String, i64)> = reservations::table
            .group_by(reservations::status)
            .select((reservations::status, diesel::dsl::count_star()))
            .load(&mut conn)
            .await?;

        let now = Utc::now();
        let expiring_in_1_hour: i64 = reservations::table
            .filter(reservations::status.eq(ReservationStatus::Reserved.as_str()))
            .filter(reservations::expires_at.gt(now))
            .filter(reservations::expires_at.lt(now + Duration::hours(1)))
            .count()
            .get_result(&mut conn)
            .await?;

        Ok(ReservationStatusReport::from_counts(
            &counts,
            expiring_in_1_hour,
        ))
    }

    /// Create a stock ledger row. The composite unique constraint on
    /// (product_id, warehouse) rejects a second row for the same pair.
    pub async fn add_stock(
        &self,
        product_id: Uuid,
        warehouse: String,
        on_hand: i32,
    ) -> EngineResult<StockRecord> {
        if warehouse.trim().is_empty() {
            return Err(ReservationError::validation("warehouse must not be empty"));
        }
        if on_hand < 0 {
            return Err(ReservationError::validation(format!(
                "on_hand must not be negative, got {}",
                on_hand
            )));
        }

        let mut conn = self.pool.get().await?;

        let new_record = NewStockRecord {
            id: Uuid::new_v4(),
            product_id,
            warehouse: warehouse.clone(),
            on_hand,
            reserved: 0,
            updated_at: Utc::now(),
        };

        let result = diesel::insert_into(stock_records::table)
            .values(&new_record)
            .get_result::<StockRecord>(&mut conn)
            .await;

        match result {
            Ok(record) => Ok(record),
            Err(err) => {
                let err = ReservationError::from(err);
                if err.is_unique_violation() {
                    Err(ReservationError::DuplicateStockRecord {
                        product_id,
                        warehouse,
                    })
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Adjust the physical count on an existing stock row (restocking or an
    /// inventory correction). The new count may never drop below the units
    /// currently held by open reservations.
    pub async fn update_stock(&self, id: Uuid, on_hand: i32) -> EngineResult<StockRecord> {
        if on_hand < 0 {
            return Err(ReservationError::validation(format!(
                "on_hand must not be negative, got {}",
                on_hand
            )));
        }

        let mut conn = self.pool.get().await?;

        conn.transaction::<StockRecord, ReservationError, _>(|conn| {
            Box::pin(async move {
                let stock = stock_records::table
                    .filter(stock_records::id.eq(id))
                    .for_update()
                    .first::<StockRecord>(conn)
                    .await
                    .optional()?
                    .ok_or(ReservationError::StockRecordNotFound)?;

                check_on_hand_covers_reserved(on_hand, stock.reserved)?;

                let updated = diesel::update(
                    stock_records::table.filter(stock_records::id.eq(stock.id)),
                )
                .set((
                    stock_records::on_hand.eq(on_hand),
                    stock_records::updated_at.eq(Utc::now()),
                ))
                .get_result::<StockRecord>(conn)
                .await?;

                Ok(updated)
            })
        })
        .await
    }

    pub async fn get_stock(&self, id: Uuid) -> EngineResult<StockRecord> {
        let mut conn = self.pool.get().await?;

        stock_records::table
            .filter(stock_records::id.eq(id))
            .first::<StockRecord>(&mut conn)
            .await
            .optional()?
            .ok_or(ReservationError::StockRecordNotFound)
    }

    pub async fn list_stock(&self, page: i64) -> EngineResult<Vec<StockRecord>> {
        let mut conn = self.pool.get().await?;

        let records = stock_records::table
            .order((stock_records::product_id.asc(), stock_records::warehouse.asc()))
            .offset(page_offset(page))
            .limit(LIST_PAGE_SIZE)
            .load::<StockRecord>(&mut conn)
            .await?;

        Ok(records)
    }

    pub async fn delete_stock(&self, id: Uuid) -> EngineResult<()> {
        let mut conn = self.pool.get().await?;

        let deleted = diesel::delete(stock_records::table.filter(stock_records::id.eq(id)))
            .execute(&mut conn)
            .await?;

        if deleted == 0 {
            return Err(ReservationError::StockRecordNotFound);
        }

        Ok(())
    }
}

async fn find_by_key(
    conn: &mut AsyncPgConnection,
    idempotency_key: &str,
) -> EngineResult<Option<Reservation>> {
    let existing = reservations::table
        .filter(reservations::idempotency_key.eq(idempotency_key))
        .first::<Reservation>(conn)
        .await
        .optional()?;

    Ok(existing)
}

fn validate_reserve(req: &ReserveRequest) -> EngineResult<()> {
    if req.quantity < 1 {
        return Err(ReservationError::validation(format!(
            "quantity must be a positive integer, got {}",
            req.quantity
        )));
    }
    if req.idempotency_key.trim().is_empty() {
        return Err(ReservationError::validation(
            "idempotency_key must not be empty",
        ));
    }
    if let Some(warehouse) = &req.warehouse {
        if warehouse.trim().is_empty() {
            return Err(ReservationError::validation(
                "warehouse, when given, must not be empty",
            ));
        }
    }
    Ok(())
}

/// Pick the first candidate that can serve the whole quantity. Candidates
/// arrive ordered by warehouse then descending on-hand; a reservation is
/// never split across warehouses.
fn pick_candidate(candidates: &[StockRecord], quantity: i32) -> Option<&StockRecord> {
    candidates.iter().find(|record| record.available() >= quantity)
}

/// Settlement gate: Release and Ship act on open reservations only. A
/// terminal row surfaces its status so the caller can tell a benign
/// duplicate from an unknown key; an unparseable status is a data fault.
fn ensure_reserved(reservation: &Reservation) -> EngineResult<()> {
    match ReservationStatus::parse(&reservation.status) {
        Some(ReservationStatus::Reserved) => Ok(()),
        Some(_) => Err(ReservationError::AlreadyProcessed {
            status: reservation.status.clone(),
        }),
        None => Err(ReservationError::integrity(format!(
            "reservation {} has unknown status {}",
            reservation.id, reservation.status
        ))),
    }
}

fn check_on_hand_covers_reserved(on_hand: i32, reserved: i32) -> EngineResult<()> {
    if on_hand < reserved {
        return Err(ReservationError::validation(format!(
            "on_hand {} would drop below the {} units currently reserved",
            on_hand, reserved
        )));
    }
    Ok(())
}

fn page_offset(page: i64) -> i64 {
    (page.max(1) - 1).saturating_mul(LIST_PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn request(quantity: i32, key: &str) -> ReserveRequest {
        ReserveRequest {
            product_id: Uuid::new_v4(),
            quantity,
            warehouse: None,
            idempotency_key: key.to_string(),
            order_id: Uuid::new_v4(),
        }
    }

    fn record(warehouse: &str, on_hand: i32, reserved: i32) -> StockRecord {
        StockRecord {
            id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            warehouse: warehouse.to_string(),
            on_hand,
            reserved,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn rejects_zero_and_negative_quantities() {
        assert!(matches!(
            validate_reserve(&request(0, "key-1")),
            Err(ReservationError::Validation(_))
        ));
        assert!(matches!(
            validate_reserve(&request(-3, "key-1")),
            Err(ReservationError::Validation(_))
        ));
        assert!(validate_reserve(&request(1, "key-1")).is_ok());
    }

    #[test]
    fn rejects_blank_idempotency_key() {
        assert!(matches!(
            validate_reserve(&request(1, "")),
            Err(ReservationError::Validation(_))
        ));
        assert!(matches!(
            validate_reserve(&request(1, "   ")),
            Err(ReservationError::Validation(_))
        ));
    }

    #[test]
    fn rejects_blank_explicit_warehouse() {
        let mut req = request(1, "key-1");
        req.warehouse = Some("  ".to_string());
        assert!(matches!(
            validate_reserve(&req),
            Err(ReservationError::Validation(_))
        ));
    }

    #[test]
    fn picks_first_warehouse_that_fits_whole_quantity() {
        // Ordered as the candidate query orders: warehouse asc, on_hand desc.
        let candidates = vec![record("EAST", 5, 5), record("WEST", 3, 0)];

        let chosen = pick_candidate(&candidates, 1).expect("WEST fits");
        assert_eq!(chosen.warehouse, "WEST");
    }

    #[test]
    fn never_splits_across_warehouses() {
        // 4 units exist in total but no single warehouse holds 4.
        let candidates = vec![record("EAST", 2, 0), record("WEST", 2, 0)];
        assert!(pick_candidate(&candidates, 4).is_none());
    }

    #[test]
    fn fully_held_stock_is_not_available() {
        let candidates = vec![record("EAST", 5, 5)];
        assert!(pick_candidate(&candidates, 1).is_none());
    }

    #[test]
    fn reserved_capacity_counts_against_availability() {
        let candidates = vec![record("EAST", 10, 7)];
        assert!(pick_candidate(&candidates, 3).is_some());
        assert!(pick_candidate(&candidates, 4).is_none());
    }

    #[test]
    fn empty_candidate_set_yields_no_pick() {
        assert!(pick_candidate(&[], 1).is_none());
    }

    fn reservation_with_status(status: &str) -> Reservation {
        let now = Utc::now();
        Reservation {
            id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            warehouse: "EAST".to_string(),
            quantity: 2,
            order_id: Uuid::new_v4(),
            idempotency_key: "key-1".to_string(),
            status: status.to_string(),
            reserved_at: now,
            expires_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn open_reservation_passes_settlement_gate() {
        assert!(ensure_reserved(&reservation_with_status("RESERVED")).is_ok());
    }

    #[test]
    fn settled_reservation_reports_its_status() {
        // Ship then Release: the second verb sees the moved status.
        for terminal in ["SHIPPED", "RELEASED", "EXPIRED"] {
            match ensure_reserved(&reservation_with_status(terminal)) {
                Err(ReservationError::AlreadyProcessed { status }) => {
                    assert_eq!(status, terminal);
                }
                other => panic!("expected AlreadyProcessed, got {:?}", other),
            }
        }
    }

    #[test]
    fn unknown_status_is_a_data_fault_not_a_duplicate() {
        assert!(matches!(
            ensure_reserved(&reservation_with_status("CANCELLED")),
            Err(ReservationError::DataIntegrity(_))
        ));
    }

    #[test]
    fn on_hand_may_not_drop_below_reserved() {
        assert!(matches!(
            check_on_hand_covers_reserved(3, 4),
            Err(ReservationError::Validation(_))
        ));
        assert!(check_on_hand_covers_reserved(4, 4).is_ok());
        assert!(check_on_hand_covers_reserved(10, 0).is_ok());
    }

    #[test]
    fn page_offset_clamps_bad_pages() {
        assert_eq!(page_offset(1), 0);
        assert_eq!(page_offset(0), 0);
        assert_eq!(page_offset(-5), 0);
        assert_eq!(page_offset(3), 20);
        assert_eq!(page_offset(i64::MAX), i64::MAX);
    }
}
