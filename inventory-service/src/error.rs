use thiserror::Error;
use uuid::Uuid;

pub type EngineResult<T> = Result<T, ReservationError>;

/// Failure taxonomy for the reservation engine. Validation fires before any
/// read; Store/Pool are transient and roll back cleanly, so retrying is safe
/// (Reserve is idempotent on key, Release/Ship until their first success).
#[derive(Debug, Error)]
pub enum ReservationError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("insufficient inventory for product {product_id}: requested {requested}")]
    InsufficientInventory { product_id: Uuid, requested: i32 },

    #[error("reservation not found")]
    ReservationNotFound,

    #[error("reservation already processed: status is {status}")]
    AlreadyProcessed { status: String },

    #[error("stock record not found")]
    StockRecordNotFound,

    #[error("stock record already exists for product {product_id} in warehouse {warehouse}")]
    DuplicateStockRecord { product_id: Uuid, warehouse: String },

    #[error("data integrity violation: {0}")]
    DataIntegrity(String),

    #[error("datastore error: {0}")]
    Store(#[from] diesel::result::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] bb8::RunError<diesel_async::pooled_connection::PoolError>),
}

impl ReservationError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::DataIntegrity(msg.into())
    }

    /// True when the underlying datastore reported a unique-constraint hit,
    /// e.g. two concurrent Reserves racing on one idempotency key.
    pub fn is_unique_violation(&self) -> bool {
        matches!(
            self,
            ReservationError::Store(diesel::result::Error::DatabaseError(
                diesel::result::DatabaseErrorKind::UniqueViolation,
                _,
            ))
        )
    }
}
