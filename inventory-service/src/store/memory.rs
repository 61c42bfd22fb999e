use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{InventoryStore, ReservationChange, StoreResult, WriteOutcome};
use crate::error::StoreError;
use crate::ledger::StockMutation;
use crate::models::{
    CatalogFields, CommandReceipt, EquipmentFilter, InventoryStatistics, Reservation,
    ReservationStatus, RetireOutcome, StockItem,
};

#[derive(Default)]
struct State {
    items: HashMap<Uuid, StockItem>,
    reservations: HashMap<String, Reservation>,
    processed: HashMap<String, (Uuid, serde_json::Value)>,
}

impl State {
    /// Same checks, in the same order, as the conditional UPDATE.
    fn mutate(
        &mut self,
        item_id: Uuid,
        mutation: StockMutation,
        expected_version: Option<i64>,
        now: DateTime<Utc>,
    ) -> WriteOutcome {
        let Some(item) = self.items.get_mut(&item_id) else {
            return WriteOutcome::ItemNotFound;
        };
        if expected_version.is_some_and(|v| v != item.version) {
            return WriteOutcome::VersionMismatch;
        }
        let current = item.levels();
        let Some(next) = current.apply(&mutation.delta()) else {
            return WriteOutcome::Insufficient(current);
        };
        item.available_quantity = next.available;
        item.reserved_quantity = next.reserved;
        item.pending_reservations = next.pending;
        item.version += 1;
        item.updated_at = now;
        WriteOutcome::Applied
    }

    /// Checked before any write so a duplicate leaves nothing behind.
    fn ensure_unrecorded(&self, receipt: Option<&CommandReceipt>) -> StoreResult<()> {
        match receipt {
            Some(receipt) if self.processed.contains_key(&receipt.idempotency_key) => {
                Err(StoreError::DuplicateCommand(receipt.idempotency_key.clone()))
            }
            _ => Ok(()),
        }
    }

    fn record(&mut self, receipt: Option<&CommandReceipt>) {
        if let Some(receipt) = receipt {
            self.processed.insert(
                receipt.idempotency_key.clone(),
                (receipt.command_id, receipt.reply.clone()),
            );
        }
    }
}

/// In-process store with the same conditional-write semantics as Postgres.
/// One mutex covers both ledgers, so each method is a transaction.
#[derive(Default)]
pub struct MemoryInventoryStore {
    state: Mutex<State>,
}

impl MemoryInventoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn sorted(mut reservations: Vec<Reservation>) -> Vec<Reservation> {
    reservations.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    reservations
}

#[async_trait]
impl InventoryStore for MemoryInventoryStore {
    async fn find_item(&self, item_id: Uuid) -> StoreResult<Option<StockItem>> {
        Ok(self.lock()?.items.get(&item_id).cloned())
    }

    async fn search_items(&self, filter: &EquipmentFilter) -> StoreResult<Vec<StockItem>> {
        let state = self.lock()?;
        let mut items: Vec<StockItem> = state
            .items
            .values()
            .filter(|item| filter.matches(item))
            .cloned()
            .collect();
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(items)
    }

    async fn statistics(&self) -> StoreResult<InventoryStatistics> {
        let state = self.lock()?;
        Ok(state.items.values().fold(InventoryStatistics::default(), |mut acc, item| {
            acc.item_count += 1;
            if item.is_active {
                acc.active_item_count += 1;
            }
            acc.total_available += i64::from(item.available_quantity);
            acc.total_reserved += i64::from(item.reserved_quantity);
            acc.total_pending += i64::from(item.pending_reservations);
            acc
        }))
    }

    async fn apply_mutation(
        &self,
        item_id: Uuid,
        mutation: StockMutation,
        expected_version: Option<i64>,
        now: DateTime<Utc>,
        receipt: Option<&CommandReceipt>,
    ) -> StoreResult<WriteOutcome> {
        let mut state = self.lock()?;
        state.ensure_unrecorded(receipt)?;
        let outcome = state.mutate(item_id, mutation, expected_version, now);
        if outcome.is_applied() {
            state.record(receipt);
        }
        Ok(outcome)
    }

    async fn insert_item_if_absent(&self, item: &StockItem) -> StoreResult<bool> {
        let mut state = self.lock()?;
        if state.items.contains_key(&item.item_id) {
            return Ok(false);
        }
        state.items.insert(item.item_id, item.clone());
        Ok(true)
    }

    async fn update_catalog_fields(&self, item_id: Uuid, fields: &CatalogFields) -> StoreResult<bool> {
        let mut state = self.lock()?;
        let Some(item) = state.items.get_mut(&item_id) else {
            return Ok(false);
        };
        item.apply_catalog_fields(fields);
        item.updated_at = fields.last_synced_at;
        Ok(true)
    }

    async fn fill_unsynced_item(&self, item_id: Uuid, fields: &CatalogFields) -> StoreResult<bool> {
        let mut state = self.lock()?;
        match state.items.get_mut(&item_id) {
            Some(item) if item.last_synced_at.is_none() => {
                item.apply_catalog_fields(fields);
                item.updated_at = fields.last_synced_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn retire_item(&self, item_id: Uuid, now: DateTime<Utc>) -> StoreResult<Option<RetireOutcome>> {
        let mut state = self.lock()?;
        let has_confirmed = state.reservations.values().any(|r| {
            r.item_id == item_id && r.status == ReservationStatus::Confirmed
        });
        let Some(item) = state.items.get_mut(&item_id) else {
            return Ok(None);
        };
        item.is_rental_available = false;
        if item.retired_at.is_none() {
            item.retired_at = Some(now);
        }
        item.updated_at = now;
        if has_confirmed {
            return Ok(Some(RetireOutcome::RentalSuspended));
        }
        item.is_active = false;
        Ok(Some(RetireOutcome::Deactivated))
    }

    async fn find_reservation(&self, reservation_id: &str) -> StoreResult<Option<Reservation>> {
        Ok(self.lock()?.reservations.get(reservation_id).cloned())
    }

    async fn reservations_for_customer(&self, customer_id: Uuid) -> StoreResult<Vec<Reservation>> {
        let state = self.lock()?;
        Ok(sorted(
            state
                .reservations
                .values()
                .filter(|r| r.customer_id == customer_id)
                .cloned()
                .collect(),
        ))
    }

    async fn reservations_for_item(&self, item_id: Uuid) -> StoreResult<Vec<Reservation>> {
        let state = self.lock()?;
        Ok(sorted(
            state
                .reservations
                .values()
                .filter(|r| r.item_id == item_id)
                .cloned()
                .collect(),
        ))
    }

    async fn overdue_reservations(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<Reservation>> {
        let state = self.lock()?;
        let mut overdue: Vec<Reservation> = state
            .reservations
            .values()
            .filter(|r| r.status == ReservationStatus::Pending && r.expires_at <= now)
            .cloned()
            .collect();
        overdue.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));
        overdue.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(overdue)
    }

    async fn insert_reservation(
        &self,
        reservation: &Reservation,
        expected_version: i64,
        receipt: Option<&CommandReceipt>,
    ) -> StoreResult<WriteOutcome> {
        let mut state = self.lock()?;
        state.ensure_unrecorded(receipt)?;
        if state.reservations.contains_key(&reservation.reservation_id) {
            return Err(StoreError::Corrupt(format!(
                "duplicate reservation id {}",
                reservation.reservation_id
            )));
        }
        let outcome = state.mutate(
            reservation.item_id,
            StockMutation::HoldPending(reservation.quantity),
            Some(expected_version),
            reservation.created_at,
        );
        if outcome.is_applied() {
            state
                .reservations
                .insert(reservation.reservation_id.clone(), reservation.clone());
            state.record(receipt);
        }
        Ok(outcome)
    }

    async fn transition_reservation(&self, change: &ReservationChange) -> StoreResult<WriteOutcome> {
        let mut state = self.lock()?;
        state.ensure_unrecorded(change.receipt.as_ref())?;
        let id = &change.next.reservation_id;
        match state.reservations.get(id) {
            Some(current)
                if current.status == change.expected_status
                    && current.expires_at == change.expected_expires_at => {}
            Some(_) => return Ok(WriteOutcome::StatusMismatch),
            None => return Err(StoreError::Corrupt(format!("reservation {id} vanished"))),
        }

        if let Some(guarded) = change.stock {
            let outcome = state.mutate(
                change.next.item_id,
                guarded.mutation,
                Some(guarded.expected_version),
                change.next.updated_at,
            );
            if !outcome.is_applied() {
                return Ok(outcome);
            }
        }

        state.reservations.insert(id.clone(), change.next.clone());
        state.record(change.receipt.as_ref());
        Ok(WriteOutcome::Applied)
    }

    async fn find_processed_command(&self, idempotency_key: &str) -> StoreResult<Option<serde_json::Value>> {
        Ok(self
            .lock()?
            .processed
            .get(idempotency_key)
            .map(|(_, reply)| reply.clone()))
    }

    async fn record_processed_command(
        &self,
        idempotency_key: &str,
        command_id: Uuid,
        reply: &serde_json::Value,
        _now: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.lock()?
            .processed
            .entry(idempotency_key.to_string())
            .or_insert_with(|| (command_id, reply.clone()));
        Ok(())
    }
}
