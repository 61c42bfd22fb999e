use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::ReservationStatus;

pub type Result<T, E = InventoryError> = std::result::Result<T, E>;

/// Failures of the store of record.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("command {0} already recorded")]
    DuplicateCommand(String),

    #[error("store lock poisoned")]
    Poisoned,
}

/// Failures of a cache backend. Never surfaced to callers of the service.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),

    #[error("cache operation timed out")]
    Timeout,

    #[error("cache payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::Backend(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("item {0} not found")]
    ItemNotFound(Uuid),

    #[error("reservation {0} not found")]
    ReservationNotFound(String),

    #[error(
        "insufficient stock for item {item_id}: requested {requested}, \
         available {available}, reserved {reserved}, pending {pending}"
    )]
    InsufficientStock {
        item_id: Uuid,
        requested: i32,
        available: i32,
        reserved: i32,
        pending: i32,
    },

    #[error("version conflict on item {item_id} after {attempts} attempts")]
    VersionConflict { item_id: Uuid, attempts: u32 },

    #[error("cannot {action} reservation {reservation_id} in status {status}")]
    InvalidStateTransition {
        reservation_id: String,
        status: ReservationStatus,
        action: &'static str,
    },

    #[error("reservation {reservation_id} expired at {expires_at}")]
    AlreadyExpired {
        reservation_id: String,
        expires_at: DateTime<Utc>,
    },

    #[error("item {item_id} is not reservable (active: {is_active}, rental available: {is_rental_available})")]
    ItemUnavailable {
        item_id: Uuid,
        is_active: bool,
        is_rental_available: bool,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("event processing failed: {0}")]
    EventProcessing(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl InventoryError {
    pub fn kind(&self) -> &'static str {
        match self {
            InventoryError::ItemNotFound(_) | InventoryError::ReservationNotFound(_) => "NotFound",
            InventoryError::InsufficientStock { .. } => "InsufficientStock",
            InventoryError::VersionConflict { .. } => "VersionConflict",
            InventoryError::InvalidStateTransition { .. } => "InvalidStateTransition",
            InventoryError::AlreadyExpired { .. } => "AlreadyExpired",
            InventoryError::ItemUnavailable { .. } => "ItemUnavailable",
            InventoryError::InvalidRequest(_) => "InvalidRequest",
            InventoryError::EventProcessing(_) => "EventProcessingError",
            InventoryError::Store(_) => "StoreError",
        }
    }

    /// Errors that describe the request or the current state rather than an
    /// infrastructure failure.
    pub fn is_domain(&self) -> bool {
        !matches!(
            self,
            InventoryError::Store(_) | InventoryError::EventProcessing(_)
        )
    }
}
