use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use shared::CommandReply;
use std::fmt;
use uuid::Uuid;

use crate::error::StoreError;
use crate::ledger::StockLevels;

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::stock_ledger)]
pub struct StockItem {
    pub id: Uuid,
    pub item_id: Uuid,
    pub sku: Option<String>,
    pub name: String,
    pub category: Option<String>,
    pub brand: Option<String>,
    pub item_type: Option<String>,
    pub base_price: Option<BigDecimal>,
    pub daily_rate: Option<BigDecimal>,
    pub description: Option<String>,
    pub available_quantity: i32,
    pub reserved_quantity: i32,
    pub pending_reservations: i32,
    pub version: i64,
    pub is_active: bool,
    pub is_rental_available: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Set by the first catalog delete. Rentals stay off from then on.
    pub retired_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StockItem {
    /// A row created by a stock add before the catalog has described the item.
    pub fn placeholder(item_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            item_id,
            sku: None,
            name: String::new(),
            category: None,
            brand: None,
            item_type: None,
            base_price: None,
            daily_rate: None,
            description: None,
            available_quantity: 0,
            reserved_quantity: 0,
            pending_reservations: 0,
            version: 0,
            is_active: true,
            is_rental_available: true,
            last_synced_at: None,
            retired_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn levels(&self) -> StockLevels {
        StockLevels {
            available: self.available_quantity,
            reserved: self.reserved_quantity,
            pending: self.pending_reservations,
        }
    }

    pub fn total_quantity(&self) -> i32 {
        self.available_quantity + self.reserved_quantity
    }

    pub fn is_reservable(&self) -> bool {
        self.is_active && self.is_rental_available
    }

    pub fn apply_catalog_fields(&mut self, fields: &CatalogFields) {
        self.sku = fields.sku.clone();
        self.name = fields.name.clone();
        self.category = fields.category.clone();
        self.brand = fields.brand.clone();
        self.item_type = fields.item_type.clone();
        self.base_price = fields.base_price.clone();
        self.daily_rate = fields.daily_rate.clone();
        self.description = fields.description.clone();
        self.is_rental_available = fields.is_rental_available && self.retired_at.is_none();
        self.last_synced_at = Some(fields.last_synced_at);
    }
}

/// The upstream-owned columns of a stock ledger row.
#[derive(Debug, Clone, PartialEq, AsChangeset)]
#[diesel(table_name = crate::schema::stock_ledger, treat_none_as_null = true)]
pub struct CatalogFields {
    pub sku: Option<String>,
    pub name: String,
    pub category: Option<String>,
    pub brand: Option<String>,
    pub item_type: Option<String>,
    pub base_price: Option<BigDecimal>,
    pub daily_rate: Option<BigDecimal>,
    pub description: Option<String>,
    pub is_rental_available: bool,
    pub last_synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireOutcome {
    Deactivated,
    RentalSuspended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Cancelled,
    Expired,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "PENDING",
            ReservationStatus::Confirmed => "CONFIRMED",
            ReservationStatus::Cancelled => "CANCELLED",
            ReservationStatus::Expired => "EXPIRED",
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for ReservationStatus {
    type Error = StoreError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "PENDING" => Ok(ReservationStatus::Pending),
            "CONFIRMED" => Ok(ReservationStatus::Confirmed),
            "CANCELLED" => Ok(ReservationStatus::Cancelled),
            "EXPIRED" => Ok(ReservationStatus::Expired),
            other => Err(StoreError::Corrupt(format!("unknown reservation status {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub id: Uuid,
    pub reservation_id: String,
    pub item_id: Uuid,
    pub customer_id: Uuid,
    pub quantity: i32,
    pub status: ReservationStatus,
    pub planned_start: Option<DateTime<Utc>>,
    pub planned_end: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub notes: Option<String>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn append_note(&mut self, note: &str) {
        self.notes = Some(match self.notes.take() {
            Some(existing) if !existing.is_empty() => format!("{existing}\n{note}"),
            _ => note.to_string(),
        });
    }
}

pub fn new_reservation_id() -> String {
    let raw = Uuid::new_v4().simple().to_string();
    format!("RSV-{}", raw[..12].to_uppercase())
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = crate::schema::reservations, treat_none_as_null = true)]
pub struct ReservationRow {
    pub id: Uuid,
    pub reservation_id: String,
    pub item_id: Uuid,
    pub customer_id: Uuid,
    pub quantity: i32,
    pub status: String,
    pub planned_start: Option<DateTime<Utc>>,
    pub planned_end: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub notes: Option<String>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Reservation> for ReservationRow {
    fn from(reservation: &Reservation) -> Self {
        Self {
            id: reservation.id,
            reservation_id: reservation.reservation_id.clone(),
            item_id: reservation.item_id,
            customer_id: reservation.customer_id,
            quantity: reservation.quantity,
            status: reservation.status.as_str().to_string(),
            planned_start: reservation.planned_start,
            planned_end: reservation.planned_end,
            expires_at: reservation.expires_at,
            notes: reservation.notes.clone(),
            confirmed_at: reservation.confirmed_at,
            cancelled_at: reservation.cancelled_at,
            expired_at: reservation.expired_at,
            created_at: reservation.created_at,
            updated_at: reservation.updated_at,
        }
    }
}

impl TryFrom<ReservationRow> for Reservation {
    type Error = StoreError;

    fn try_from(row: ReservationRow) -> Result<Self, Self::Error> {
        let status = ReservationStatus::try_from(row.status.as_str())?;
        Ok(Self {
            id: row.id,
            reservation_id: row.reservation_id,
            item_id: row.item_id,
            customer_id: row.customer_id,
            quantity: row.quantity,
            status,
            planned_start: row.planned_start,
            planned_end: row.planned_end,
            expires_at: row.expires_at,
            notes: row.notes,
            confirmed_at: row.confirmed_at,
            cancelled_at: row.cancelled_at,
            expired_at: row.expired_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::processed_commands)]
pub struct ProcessedCommand {
    pub idempotency_key: String,
    pub command_id: Uuid,
    pub result: Option<serde_json::Value>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// The command on whose behalf a write is made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOrigin {
    pub idempotency_key: String,
    pub command_id: Uuid,
}

impl CommandOrigin {
    pub fn new(idempotency_key: impl Into<String>, command_id: Uuid) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            command_id,
        }
    }

    /// The successful reply carrying `result`, ready to be committed with the
    /// write that produced it.
    pub fn receipt<T: Serialize>(&self, result: &T) -> Result<CommandReceipt, StoreError> {
        let result = serde_json::to_value(result)
            .map_err(|e| StoreError::Corrupt(format!("reply payload: {e}")))?;
        let reply = serde_json::to_value(CommandReply::success(self.command_id, Some(result)))
            .map_err(|e| StoreError::Corrupt(format!("reply: {e}")))?;
        Ok(CommandReceipt {
            idempotency_key: self.idempotency_key.clone(),
            command_id: self.command_id,
            reply,
        })
    }
}

/// A processed-command record that stores write in the same transaction as
/// the change it answers. A second receipt for the same key aborts the write
/// with [`StoreError::DuplicateCommand`].
#[derive(Debug, Clone, PartialEq)]
pub struct CommandReceipt {
    pub idempotency_key: String,
    pub command_id: Uuid,
    pub reply: serde_json::Value,
}

impl CommandReceipt {
    pub fn to_row(&self, now: DateTime<Utc>) -> ProcessedCommand {
        ProcessedCommand {
            idempotency_key: self.idempotency_key.clone(),
            command_id: self.command_id,
            result: Some(self.reply.clone()),
            processed_at: Some(now),
        }
    }
}

// ---------------------------------------------------------------------------
// Read models served to callers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EquipmentView {
    pub item_id: Uuid,
    pub sku: Option<String>,
    pub name: String,
    pub category: Option<String>,
    pub brand: Option<String>,
    pub item_type: Option<String>,
    pub base_price: Option<BigDecimal>,
    pub daily_rate: Option<BigDecimal>,
    pub description: Option<String>,
    pub total_quantity: i32,
    pub available_quantity: i32,
    pub reserved_quantity: i32,
    pub pending_reservations: i32,
    pub is_active: bool,
    pub is_rental_available: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl From<StockItem> for EquipmentView {
    fn from(item: StockItem) -> Self {
        Self {
            total_quantity: item.total_quantity(),
            item_id: item.item_id,
            sku: item.sku,
            name: item.name,
            category: item.category,
            brand: item.brand,
            item_type: item.item_type,
            base_price: item.base_price,
            daily_rate: item.daily_rate,
            description: item.description,
            available_quantity: item.available_quantity,
            reserved_quantity: item.reserved_quantity,
            pending_reservations: item.pending_reservations,
            is_active: item.is_active,
            is_rental_available: item.is_rental_available,
            last_synced_at: item.last_synced_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Availability {
    pub item_id: Uuid,
    pub available: bool,
    pub total_quantity: i32,
    pub available_quantity: i32,
    pub reserved_quantity: i32,
    pub pending_reservations: i32,
}

/// Equality filter over the search buckets. Every field narrows the result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EquipmentFilter {
    pub category: Option<String>,
    pub brand: Option<String>,
    pub rental_available_only: bool,
}

impl EquipmentFilter {
    pub fn matches(&self, item: &StockItem) -> bool {
        if !item.is_active {
            return false;
        }
        if self.rental_available_only && !item.is_rental_available {
            return false;
        }
        if let Some(category) = &self.category {
            if item.category.as_ref() != Some(category) {
                return false;
            }
        }
        if let Some(brand) = &self.brand {
            if item.brand.as_ref() != Some(brand) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryStatistics {
    pub item_count: i64,
    pub active_item_count: i64,
    pub total_available: i64,
    pub total_reserved: i64,
    pub total_pending: i64,
}
