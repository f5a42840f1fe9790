use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::engine::{ReservationEngine, ReserveRequest};
use crate::error::ReservationError;
use crate::models::{AvailabilityReport, Reservation, ReservationStatusReport, StockRecord};

#[derive(Clone)]
pub struct AppState {
    pub engine: ReservationEngine,
}

#[derive(Debug, Deserialize)]
pub struct ReserveBody {
    pub product_id: Uuid,
    pub quantity: i32,
    pub warehouse: Option<String>,
    pub idempotency_key: String,
    pub order_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct SettleBody {
    pub idempotency_key: String,
    pub order_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct ReserveResponse {
    /// True when this request replayed an idempotency key and the returned
    /// reservation is an echo of the original, with no new stock held.
    pub idempotent: bool,
    pub reservation: Reservation,
}

#[derive(Debug, Deserialize)]
pub struct AddStockBody {
    pub product_id: Uuid,
    pub warehouse: String,
    #[serde(default)]
    pub on_hand: i32,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStockBody {
    pub on_hand: i32,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub page: Option<i64>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/v1/inventory", post(add_stock).get(list_stock))
        .route("/v1/inventory/reserve", post(reserve))
        .route("/v1/inventory/release", post(release))
        .route("/v1/inventory/ship", post(ship))
        .route(
            "/v1/inventory/availability/:product_id",
            get(check_availability),
        )
        .route("/v1/inventory/reservations/status", get(reservation_status))
        .route(
            "/v1/inventory/:id",
            get(get_stock).patch(update_stock).delete(delete_stock),
        )
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

async fn reserve(
    State(state): State<AppState>,
    Json(body): Json<ReserveBody>,
) -> Result<Json<ReserveResponse>, ReservationError> {
    let (reservation, idempotent) = state
        .engine
        .reserve(ReserveRequest {
            product_id: body.product_id,
            quantity: body.quantity,
            warehouse: body.warehouse,
            idempotency_key: body.idempotency_key,
            order_id: body.order_id,
        })
        .await?;

    Ok(Json(ReserveResponse {
        idempotent,
        reservation,
    }))
}

async fn release(
    State(state): State<AppState>,
    Json(body): Json<SettleBody>,
) -> Result<Json<Reservation>, ReservationError> {
    let reservation = state
        .engine
        .release(body.idempotency_key, body.order_id)
        .await?;
    Ok(Json(reservation))
}

async fn ship(
    State(state): State<AppState>,
    Json(body): Json<SettleBody>,
) -> Result<Json<Reservation>, ReservationError> {
    let reservation = state.engine.ship(body.idempotency_key, body.order_id).await?;
    Ok(Json(reservation))
}

async fn check_availability(
    State(state): State<AppState>,
    Path(product_id): Path<Uuid>,
) -> Result<Json<AvailabilityReport>, ReservationError> {
    let report = state.engine.check_availability(product_id).await?;
    Ok(Json(report))
}

async fn reservation_status(
    State(state): State<AppState>,
) -> Result<Json<ReservationStatusReport>, ReservationError> {
    let report = state.engine.reservation_status().await?;
    Ok(Json(report))
}

async fn add_stock(
    State(state): State<AppState>,
    Json(body): Json<AddStockBody>,
) -> Result<(StatusCode, Json<StockRecord>), ReservationError> {
    let record = state
        .engine
        .add_stock(body.product_id, body.warehouse, body.on_hand)
        .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn update_stock(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateStockBody>,
) -> Result<Json<StockRecord>, ReservationError> {
    let record = state.engine.update_stock(id, body.on_hand).await?;
    Ok(Json(record))
}

async fn get_stock(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<StockRecord>, ReservationError> {
    let record = state.engine.get_stock(id).await?;
    Ok(Json(record))
}

async fn list_stock(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<StockRecord>>, ReservationError> {
    let records = state.engine.list_stock(params.page.unwrap_or(1)).await?;
    Ok(Json(records))
}

async fn delete_stock(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ReservationError> {
    state.engine.delete_stock(id).await?;
    Ok(Json(json!({"message": "stock record deleted"})))
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({"status": "healthy", "service": "inventory"}))
}

impl IntoResponse for ReservationError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ReservationError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            ReservationError::InsufficientInventory { .. } => {
                (StatusCode::CONFLICT, "insufficient_inventory")
            }
            ReservationError::DuplicateStockRecord { .. } => {
                (StatusCode::CONFLICT, "duplicate_stock_record")
            }
            ReservationError::ReservationNotFound => {
                (StatusCode::NOT_FOUND, "reservation_not_found")
            }
            ReservationError::AlreadyProcessed { .. } => {
                (StatusCode::NOT_FOUND, "already_processed")
            }
            ReservationError::StockRecordNotFound => {
                (StatusCode::NOT_FOUND, "stock_record_not_found")
            }
            ReservationError::DataIntegrity(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "data_integrity")
            }
            ReservationError::Store(_) | ReservationError::Pool(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "store_error")
            }
        };

        if status.is_server_error() {
            tracing::error!("{}", self);
        }

        (
            status,
            Json(json!({
                "error": code,
                "message": self.to_string(),
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_maps_to_bad_request() {
        let response = ReservationError::validation("quantity must be a positive integer")
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn insufficient_inventory_maps_to_conflict() {
        let response = ReservationError::InsufficientInventory {
            product_id: Uuid::new_v4(),
            requested: 4,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn missing_and_settled_reservations_map_to_not_found() {
        let not_found = ReservationError::ReservationNotFound.into_response();
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let already = ReservationError::AlreadyProcessed {
            status: "SHIPPED".to_string(),
        }
        .into_response();
        assert_eq!(already.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn store_failures_map_to_internal_error() {
        let response = ReservationError::Store(diesel::result::Error::NotFound).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let response = ReservationError::integrity("orphaned reservation").into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn duplicate_stock_record_maps_to_conflict() {
        let response = ReservationError::DuplicateStockRecord {
            product_id: Uuid::new_v4(),
            warehouse: "EAST".to_string(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
