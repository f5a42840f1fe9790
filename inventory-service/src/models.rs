use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One row per product x warehouse. `reserved` counts units held by open
/// reservations; `on_hand - reserved` is what a new reservation may draw.
#[derive(Debug, Clone, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::stock_records)]
pub struct StockRecord {
    pub id: Uuid,
    pub product_id: Uuid,
    pub warehouse: String,
    pub on_hand: i32,
    pub reserved: i32,
    pub updated_at: DateTime<Utc>,
}

impl StockRecord {
    pub fn available(&self) -> i32 {
        self.on_hand - self.reserved
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::stock_records)]
pub struct NewStockRecord {
    pub id: Uuid,
    pub product_id: Uuid,
    pub warehouse: String,
    pub on_hand: i32,
    pub reserved: i32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::reservations)]
pub struct Reservation {
    pub id: Uuid,
    pub product_id: Uuid,
    pub warehouse: String,
    pub quantity: i32,
    pub order_id: Uuid,
    pub idempotency_key: String,
    pub status: String,
    pub reserved_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::reservations)]
pub struct NewReservation {
    pub id: Uuid,
    pub product_id: Uuid,
    pub warehouse: String,
    pub quantity: i32,
    pub order_id: Uuid,
    pub idempotency_key: String,
    pub status: String,
    pub reserved_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Reservation lifecycle. `Reserved` is the only state that Release, Ship,
/// or expiry may act on; the other three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationStatus {
    Reserved,
    Shipped,
    Released,
    Expired,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Reserved => "RESERVED",
            ReservationStatus::Shipped => "SHIPPED",
            ReservationStatus::Released => "RELEASED",
            ReservationStatus::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RESERVED" => Some(ReservationStatus::Reserved),
            "SHIPPED" => Some(ReservationStatus::Shipped),
            "RELEASED" => Some(ReservationStatus::Released),
            "EXPIRED" => Some(ReservationStatus::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReservationStatus::Reserved)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReservationStatusReport {
    pub active: i64,
    pub shipped: i64,
    pub released: i64,
    pub expired: i64,
    pub expiring_in_1_hour: i64,
    /// The sweeper runs for the life of the process.
    pub cleanup_active: bool,
}

impl ReservationStatusReport {
    pub fn from_counts(counts: &[(String, i64)], expiring_in_1_hour: i64) -> Self {
        let mut report = Self {
            active: 0,
            shipped: 0,
            released: 0,
            expired: 0,
            expiring_in_1_hour,
            cleanup_active: true,
        };
        for (status, count) in counts {
            match ReservationStatus::parse(status) {
                Some(ReservationStatus::Reserved) => report.active = *count,
                Some(ReservationStatus::Shipped) => report.shipped = *count,
                Some(ReservationStatus::Released) => report.released = *count,
                Some(ReservationStatus::Expired) => report.expired = *count,
                None => {}
            }
        }
        report
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WarehouseAvailability {
    pub warehouse: String,
    pub on_hand: i32,
    pub reserved: i32,
    pub available: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct AvailabilityReport {
    pub product_id: Uuid,
    pub total_on_hand: i32,
    pub total_reserved: i32,
    pub total_available: i32,
    pub warehouses: Vec<WarehouseAvailability>,
}

impl AvailabilityReport {
    pub fn from_records(product_id: Uuid, records: &[StockRecord]) -> Self {
        let warehouses: Vec<WarehouseAvailability> = records
            .iter()
            .map(|r| WarehouseAvailability {
                warehouse: r.warehouse.clone(),
                on_hand: r.on_hand,
                reserved: r.reserved,
                available: r.available(),
            })
            .collect();

        Self {
            product_id,
            total_on_hand: records.iter().map(|r| r.on_hand).sum(),
            total_reserved: records.iter().map(|r| r.reserved).sum(),
            total_available: warehouses.iter().map(|w| w.available).sum(),
            warehouses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn status_round_trips_through_storage_form() {
        for status in [
            ReservationStatus::Reserved,
            ReservationStatus::Shipped,
            ReservationStatus::Released,
            ReservationStatus::Expired,
        ] {
            assert_eq!(ReservationStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ReservationStatus::parse("CANCELLED"), None);
    }

    #[test]
    fn only_reserved_is_non_terminal() {
        assert!(!ReservationStatus::Reserved.is_terminal());
        assert!(ReservationStatus::Shipped.is_terminal());
        assert!(ReservationStatus::Released.is_terminal());
        assert!(ReservationStatus::Expired.is_terminal());
    }

    #[test]
    fn availability_aggregates_across_warehouses() {
        let product_id = Uuid::new_v4();
        let records = vec![record("EAST", 10, 4), record("WEST", 5, 5)];

        let report = AvailabilityReport::from_records(product_id, &records);

        assert_eq!(report.total_on_hand, 15);
        assert_eq!(report.total_reserved, 9);
        assert_eq!(report.total_available, 6);
        assert_eq!(report.warehouses.len(), 2);
        assert_eq!(report.warehouses[0].available, 6);
        assert_eq!(report.warehouses[1].available, 0);
    }

    #[test]
    fn status_report_maps_counts_by_status() {
        let counts = vec![
            ("RESERVED".to_string(), 3),
            ("SHIPPED".to_string(), 2),
            ("EXPIRED".to_string(), 1),
            ("BOGUS".to_string(), 9),
        ];

        let report = ReservationStatusReport::from_counts(&counts, 2);

        assert_eq!(report.active, 3);
        assert_eq!(report.shipped, 2);
        assert_eq!(report.released, 0);
        assert_eq!(report.expired, 1);
        assert_eq!(report.expiring_in_1_hour, 2);
        assert!(report.cleanup_active);
    }

    #[test]
    fn availability_of_unknown_product_is_empty() {
        let report = AvailabilityReport::from_records(Uuid::new_v4(), &[]);
        assert_eq!(report.total_available, 0);
        assert!(report.warehouses.is_empty());
    }
}
