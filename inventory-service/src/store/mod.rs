//! Store of record for the stock and reservation ledgers.
//!
//! Every method that changes more than one row does so atomically: either all
//! of its writes land or none do.

mod memory;
mod postgres;

pub use memory::MemoryInventoryStore;
pub use postgres::{DbPool, PgInventoryStore, MIGRATIONS};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::ledger::{StockLevels, StockMutation};
use crate::models::{
    CatalogFields, CommandReceipt, EquipmentFilter, InventoryStatistics, Reservation,
    ReservationStatus, RetireOutcome, StockItem,
};

pub type StoreResult<T> = Result<T, StoreError>;

/// Result of a conditional write. Anything but `Applied` means nothing changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    ItemNotFound,
    /// The row's version moved since it was read.
    VersionMismatch,
    /// A counter would go negative or the availability floor was not met.
    Insufficient(StockLevels),
    /// The reservation is no longer in the state it was read in.
    StatusMismatch,
}

impl WriteOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, WriteOutcome::Applied)
    }
}

/// A versioned stock mutation applied alongside a reservation write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardedMutation {
    pub mutation: StockMutation,
    pub expected_version: i64,
}

/// Replace a reservation row with `next`, guarded by the status and deadline
/// it was read with, optionally together with a stock mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct ReservationChange {
    pub next: Reservation,
    pub expected_status: ReservationStatus,
    pub expected_expires_at: DateTime<Utc>,
    pub stock: Option<GuardedMutation>,
    pub receipt: Option<CommandReceipt>,
}

impl ReservationChange {
    pub fn new(current: &Reservation, next: Reservation) -> Self {
        Self {
            next,
            expected_status: current.status,
            expected_expires_at: current.expires_at,
            stock: None,
            receipt: None,
        }
    }

    pub fn with_stock(mut self, mutation: StockMutation, expected_version: i64) -> Self {
        self.stock = Some(GuardedMutation {
            mutation,
            expected_version,
        });
        self
    }

    pub fn with_receipt(mut self, receipt: CommandReceipt) -> Self {
        self.receipt = Some(receipt);
        self
    }
}

#[async_trait]
pub trait InventoryStore: Send + Sync {
    async fn find_item(&self, item_id: Uuid) -> StoreResult<Option<StockItem>>;

    async fn search_items(&self, filter: &EquipmentFilter) -> StoreResult<Vec<StockItem>>;

    async fn statistics(&self) -> StoreResult<InventoryStatistics>;

    /// The single conditional write of the mutation engine. `None` skips the
    /// version check; the non-negativity guards always apply. A receipt is
    /// recorded only when the mutation applies.
    async fn apply_mutation(
        &self,
        item_id: Uuid,
        mutation: StockMutation,
        expected_version: Option<i64>,
        now: DateTime<Utc>,
        receipt: Option<&CommandReceipt>,
    ) -> StoreResult<WriteOutcome>;

    /// Insert `item` unless a row for its `item_id` exists. Returns whether it
    /// was inserted.
    async fn insert_item_if_absent(&self, item: &StockItem) -> StoreResult<bool>;

    /// Overwrite the catalog-owned columns. Returns `false` if the item is
    /// unknown.
    async fn update_catalog_fields(&self, item_id: Uuid, fields: &CatalogFields) -> StoreResult<bool>;

    /// Fill the catalog columns of a row that has never been synced. Returns
    /// `false` if the row is missing or was already synced.
    async fn fill_unsynced_item(&self, item_id: Uuid, fields: &CatalogFields) -> StoreResult<bool>;

    /// Logical delete: suspend rentals when confirmed holds exist, otherwise
    /// deactivate. `None` if the item is unknown.
    async fn retire_item(&self, item_id: Uuid, now: DateTime<Utc>) -> StoreResult<Option<RetireOutcome>>;

    async fn find_reservation(&self, reservation_id: &str) -> StoreResult<Option<Reservation>>;

    async fn reservations_for_customer(&self, customer_id: Uuid) -> StoreResult<Vec<Reservation>>;

    async fn reservations_for_item(&self, item_id: Uuid) -> StoreResult<Vec<Reservation>>;

    /// PENDING reservations whose deadline is at or before `now`, oldest first.
    async fn overdue_reservations(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<Reservation>>;

    /// Insert a PENDING reservation and hold its quantity against the item in
    /// one transaction, together with `receipt` when given.
    async fn insert_reservation(
        &self,
        reservation: &Reservation,
        expected_version: i64,
        receipt: Option<&CommandReceipt>,
    ) -> StoreResult<WriteOutcome>;

    async fn transition_reservation(&self, change: &ReservationChange) -> StoreResult<WriteOutcome>;

    async fn find_processed_command(&self, idempotency_key: &str) -> StoreResult<Option<serde_json::Value>>;

    /// Record the reply to a command that changed nothing. A key that already
    /// has a reply keeps it.
    async fn record_processed_command(
        &self,
        idempotency_key: &str,
        command_id: Uuid,
        reply: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> StoreResult<()>;
}
