use anyhow::Result;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{
    pooled_connection::bb8::Pool, AsyncConnection, AsyncPgConnection, RunQueryDsl,
};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time;
use tracing::{error, info};
use uuid::Uuid;

use crate::models::*;
use crate::schema::*;

type DbPool = Pool<AsyncPgConnection>;

/// Reclaims timed-out holds: the only component allowed to move a
/// reservation from RESERVED to EXPIRED. Owned by the service lifecycle and
/// stopped through the shutdown channel.
pub struct ExpirySweeper {
    pool: DbPool,
    interval: Duration,
}

impl ExpirySweeper {
    pub fn new(pool: DbPool, interval: Duration) -> Self {
        Self { pool, interval }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Expiry sweeper started, sweeping every {:?}",
            self.interval
        );
        let mut ticker = time::interval(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep_expired().await {
                        Ok(0) => {}
                        Ok(reclaimed) => info!("Reclaimed {} expired reservations", reclaimed),
                        Err(e) => error!("Expiry sweep failed, will retry next cycle: {}", e),
                    }
                }
                _ = shutdown.changed() => {
                    info!("Expiry sweeper shutting down");
                    return;
                }
            }
        }
    }

    /// One sweep cycle. A failure on one record is logged and skipped so it
    /// never blocks reclamation of the rest.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let mut conn = self.pool.get().await?;

        let expired: Vec<Reservation> = reservations::table
            .filter(reservations::status.eq(ReservationStatus::Reserved.as_str()))
            .filter(reservations::expires_at.lt(Utc::now()))
            .order(reservations::expires_at.asc())
            .load(&mut conn)
            .await?;

        if expired.is_empty() {
            return Ok(0);
        }

        info!("Found {} expired reservations to reclaim", expired.len());

        let mut reclaimed = 0;
        for reservation in expired {
            match expire_one(&mut conn, reservation.id).await {
                Ok(true) => {
                    info!(
                        "Released expired reservation {}: product {}, quantity {}, warehouse {}",
                        reservation.id,
                        reservation.product_id,
                        reservation.quantity,
                        reservation.warehouse
                    );
                    reclaimed += 1;
                }
                Ok(false) => {} // settled by Ship/Release (or an earlier sweep) in the meantime
                Err(e) => {
                    error!("Failed to expire reservation {}: {}", reservation.id, e);
                }
            }
        }

        Ok(reclaimed)
    }
}

/// Expire a single reservation in its own transaction. Returns false when
/// the row is no longer RESERVED under lock, making repeated sweeps of the
/// same record a no-op.
async fn expire_one(conn: &mut AsyncPgConnection, reservation_id: Uuid) -> Result<bool> {
    conn.transaction::<bool, anyhow::Error, _>(|conn| {
        Box::pin(async move {
            let reservation = reservations::table
                .filter(reservations::id.eq(reservation_id))
                .for_update()
                .first::<Reservation>(conn)
                .await
                .optional()?;

            let reservation = match reservation {
                Some(r) => r,
                None => return Ok(false),
            };

            if ReservationStatus::parse(&reservation.status) != Some(ReservationStatus::Reserved)
            {
                return Ok(false);
            }

            let stock = stock_records::table
                .filter(stock_records::product_id.eq(reservation.product_id))
                .filter(stock_records::warehouse.eq(&reservation.warehouse))
                .for_update()
                .first::<StockRecord>(conn)
                .await
                .optional()?;

            let stock = match stock {
                Some(s) => s,
                None => anyhow::bail!(
                    "no stock record for product {} in warehouse {}",
                    reservation.product_id,
                    reservation.warehouse
                ),
            };

            let now = Utc::now();

            diesel::update(stock_records::table.filter(stock_records::id.eq(stock.id)))
                .set((
                    stock_records::reserved.eq(stock_records::reserved - reservation.quantity),
                    stock_records::updated_at.eq(now),
                ))
                .execute(conn)
                .await?;

            diesel::update(reservations::table.filter(reservations::id.eq(reservation.id)))
                .set((
                    reservations::status.eq(ReservationStatus::Expired.as_str()),
                    reservations::updated_at.eq(now),
                ))
                .execute(conn)
                .await?;

            Ok(true)
        })
    })
    .await
}
