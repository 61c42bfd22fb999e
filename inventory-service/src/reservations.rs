//! Reservation state machine.
//!
//! ```text
//! PENDING ──confirm──> CONFIRMED ──cancel──> CANCELLED
//!    │ └────────────────cancel─────────────────^
//!    └──expire (reaper only)──> EXPIRED
//! ```
//!
//! Each transition re-reads the reservation and its item, then writes both in
//! one store transaction guarded by the reservation's status and the item's
//! version. A lost race is retried under the configured [`RetryPolicy`].

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use shared::{ReservationEvent, ReservationEventKind};
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::{keys, ReadThroughCache};
use crate::clock::Clock;
use crate::error::{InventoryError, Result};
use crate::events::EventPublisher;
use crate::ledger::{insufficient, retry_on_conflict, Attempt, RetryPolicy, StockMutation};
use crate::models::{new_reservation_id, CommandOrigin, Reservation, ReservationStatus, StockItem};
use crate::store::{InventoryStore, ReservationChange, WriteOutcome};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationSettings {
    pub default_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ReservationSettings {
    fn default() -> Self {
        Self {
            default_timeout: Duration::minutes(30),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateReservation {
    pub item_id: Uuid,
    pub customer_id: Uuid,
    pub quantity: i32,
    pub timeout_minutes: Option<i64>,
    pub planned_start: Option<DateTime<Utc>>,
    pub planned_end: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

impl CreateReservation {
    pub fn new(item_id: Uuid, customer_id: Uuid, quantity: i32) -> Self {
        Self {
            item_id,
            customer_id,
            quantity,
            timeout_minutes: None,
            planned_start: None,
            planned_end: None,
            notes: None,
        }
    }

    pub fn with_timeout_minutes(mut self, minutes: i64) -> Self {
        self.timeout_minutes = Some(minutes);
        self
    }

    pub fn with_period(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.planned_start = Some(start);
        self.planned_end = Some(end);
        self
    }
}

/// What a transition plan decided after looking at the current rows.
enum Step {
    Write(ReservationChange),
    Skip,
}

enum Transition {
    Written { reservation: Reservation, item: StockItem },
    Skipped { current: Reservation },
}

pub struct ReservationOrchestrator {
    store: Arc<dyn InventoryStore>,
    cache: ReadThroughCache,
    publisher: EventPublisher,
    clock: Arc<dyn Clock>,
    settings: ReservationSettings,
}

impl ReservationOrchestrator {
    pub fn new(
        store: Arc<dyn InventoryStore>,
        cache: ReadThroughCache,
        publisher: EventPublisher,
        clock: Arc<dyn Clock>,
        settings: ReservationSettings,
    ) -> Self {
        Self {
            store,
            cache,
            publisher,
            clock,
            settings,
        }
    }

    pub async fn create_reservation(&self, request: CreateReservation) -> Result<Reservation> {
        self.create(request, None).await
    }

    pub async fn confirm_reservation(&self, reservation_id: &str) -> Result<Reservation> {
        self.confirm(reservation_id, None).await
    }

    pub async fn cancel_reservation(&self, reservation_id: &str, reason: Option<String>) -> Result<Reservation> {
        self.cancel(reservation_id, reason, None).await
    }

    pub async fn extend_reservation(
        &self,
        reservation_id: &str,
        additional_minutes: i64,
        reason: Option<String>,
    ) -> Result<Reservation> {
        self.extend(reservation_id, additional_minutes, reason, None).await
    }

    /// The `origin` variants commit the command's reply in the same store
    /// transaction as the reservation write.
    pub(crate) async fn create(
        &self,
        request: CreateReservation,
        origin: Option<&CommandOrigin>,
    ) -> Result<Reservation> {
        if request.quantity <= 0 {
            return Err(InventoryError::InvalidRequest(format!(
                "quantity must be positive, got {}",
                request.quantity
            )));
        }
        let timeout = match request.timeout_minutes {
            Some(minutes) if minutes <= 0 => {
                return Err(InventoryError::InvalidRequest(format!(
                    "timeout must be positive, got {minutes} minutes"
                )))
            }
            Some(minutes) => Duration::minutes(minutes),
            None => self.settings.default_timeout,
        };
        if let (Some(start), Some(end)) = (request.planned_start, request.planned_end) {
            if end <= start {
                return Err(InventoryError::InvalidRequest(
                    "planned end must be after planned start".to_string(),
                ));
            }
        }

        let id = Uuid::new_v4();
        let reservation_id = new_reservation_id();
        let request = &request;
        let reservation_id = &reservation_id;

        let (reservation, item) = retry_on_conflict(&self.settings.retry, request.item_id, || async move {
            let item = self.load_item(request.item_id).await?;
            if !item.is_reservable() {
                return Err(InventoryError::ItemUnavailable {
                    item_id: item.item_id,
                    is_active: item.is_active,
                    is_rental_available: item.is_rental_available,
                });
            }
            // Pending holds are an accounting signal, not a second gate.
            if item.available_quantity < request.quantity {
                return Err(insufficient(item.item_id, request.quantity, item.levels()));
            }

            let now = self.clock.now();
            let reservation = Reservation {
                id,
                reservation_id: reservation_id.clone(),
                item_id: request.item_id,
                customer_id: request.customer_id,
                quantity: request.quantity,
                status: ReservationStatus::Pending,
                planned_start: request.planned_start,
                planned_end: request.planned_end,
                expires_at: now + timeout,
                notes: request.notes.clone(),
                confirmed_at: None,
                cancelled_at: None,
                expired_at: None,
                created_at: now,
                updated_at: now,
            };

            let receipt = origin.map(|origin| origin.receipt(&reservation)).transpose()?;
            match self
                .store
                .insert_reservation(&reservation, item.version, receipt.as_ref())
                .await?
            {
                WriteOutcome::Applied => Ok(Attempt::Done((reservation, item))),
                WriteOutcome::VersionMismatch | WriteOutcome::StatusMismatch => Ok(Attempt::Conflict),
                WriteOutcome::ItemNotFound => Err(InventoryError::ItemNotFound(request.item_id)),
                WriteOutcome::Insufficient(levels) => {
                    Err(insufficient(request.item_id, request.quantity, levels))
                }
            }
        })
        .await?;

        info!(
            reservation_id = %reservation.reservation_id,
            item_id = %reservation.item_id,
            customer_id = %reservation.customer_id,
            quantity = reservation.quantity,
            expires_at = %reservation.expires_at,
            "Reservation created"
        );

        self.cache.invalidate_reservation(&reservation, Some(&item)).await;
        self.publish(
            &reservation,
            ReservationEventKind::ReservationCreated {
                expires_at: reservation.expires_at,
            },
        )
        .await;
        Ok(reservation)
    }

    pub(crate) async fn confirm(
        &self,
        reservation_id: &str,
        origin: Option<&CommandOrigin>,
    ) -> Result<Reservation> {
        let transition = self
            .transition(reservation_id, origin, |current, item, now| {
                if current.status != ReservationStatus::Pending {
                    return Err(invalid_state(current, "confirm"));
                }
                if current.is_overdue(now) {
                    return Err(already_expired(current));
                }
                let mut next = current.clone();
                next.status = ReservationStatus::Confirmed;
                next.confirmed_at = Some(now);
                next.updated_at = now;
                Ok(Step::Write(
                    ReservationChange::new(current, next)
                        .with_stock(StockMutation::ConfirmPending(current.quantity), item.version),
                ))
            })
            .await?;

        let reservation = self.finish(transition, "confirm").await?;
        info!(reservation_id, item_id = %reservation.item_id, quantity = reservation.quantity, "Reservation confirmed");
        self.publish(&reservation, ReservationEventKind::ReservationConfirmed).await;
        Ok(reservation)
    }

    pub(crate) async fn cancel(
        &self,
        reservation_id: &str,
        reason: Option<String>,
        origin: Option<&CommandOrigin>,
    ) -> Result<Reservation> {
        let note = match reason.as_deref() {
            Some(reason) if !reason.trim().is_empty() => format!("Cancelled: {}", reason.trim()),
            _ => "Cancelled".to_string(),
        };

        let transition = self
            .transition(reservation_id, origin, |current, item, now| {
                let mutation = match current.status {
                    // Available stock was never moved for a pending hold.
                    ReservationStatus::Pending => StockMutation::ReleasePending(current.quantity),
                    ReservationStatus::Confirmed => StockMutation::Release(current.quantity),
                    ReservationStatus::Cancelled | ReservationStatus::Expired => {
                        return Err(invalid_state(current, "cancel"))
                    }
                };
                let mut next = current.clone();
                next.status = ReservationStatus::Cancelled;
                next.cancelled_at = Some(now);
                next.updated_at = now;
                next.append_note(&note);
                Ok(Step::Write(
                    ReservationChange::new(current, next).with_stock(mutation, item.version),
                ))
            })
            .await?;

        let reservation = self.finish(transition, "cancel").await?;
        info!(reservation_id, item_id = %reservation.item_id, quantity = reservation.quantity, "Reservation cancelled");
        self.publish(&reservation, ReservationEventKind::ReservationCancelled { reason })
            .await;
        Ok(reservation)
    }

    pub(crate) async fn extend(
        &self,
        reservation_id: &str,
        additional_minutes: i64,
        reason: Option<String>,
        origin: Option<&CommandOrigin>,
    ) -> Result<Reservation> {
        if additional_minutes <= 0 {
            return Err(InventoryError::InvalidRequest(format!(
                "extension must be positive, got {additional_minutes} minutes"
            )));
        }
        let note = match reason.as_deref() {
            Some(reason) if !reason.trim().is_empty() => {
                format!("Extended by {additional_minutes} minutes: {}", reason.trim())
            }
            _ => format!("Extended by {additional_minutes} minutes"),
        };

        let transition = self
            .transition(reservation_id, origin, |current, _item, now| {
                if current.status != ReservationStatus::Pending {
                    return Err(invalid_state(current, "extend"));
                }
                if current.is_overdue(now) {
                    return Err(already_expired(current));
                }
                let mut next = current.clone();
                next.expires_at = current.expires_at + Duration::minutes(additional_minutes);
                next.updated_at = now;
                next.append_note(&note);
                Ok(Step::Write(ReservationChange::new(current, next)))
            })
            .await?;

        let reservation = self.finish(transition, "extend").await?;
        info!(reservation_id, expires_at = %reservation.expires_at, "Reservation extended");
        Ok(reservation)
    }

    /// PENDING -> EXPIRED for an overdue hold. Returns `None` when the
    /// reservation has already left PENDING or its deadline moved forward, so
    /// repeated sweeps are no-ops. Only the expiration reaper drives this.
    pub(crate) async fn expire_reservation(&self, reservation_id: &str) -> Result<Option<Reservation>> {
        let transition = self
            .transition(reservation_id, None, |current, item, now| {
                if current.status != ReservationStatus::Pending || !current.is_overdue(now) {
                    return Ok(Step::Skip);
                }
                let mut next = current.clone();
                next.status = ReservationStatus::Expired;
                next.expired_at = Some(now);
                next.updated_at = now;
                Ok(Step::Write(
                    ReservationChange::new(current, next)
                        .with_stock(StockMutation::ReleasePending(current.quantity), item.version),
                ))
            })
            .await?;

        match transition {
            Transition::Written { reservation, item } => {
                self.cache.invalidate_reservation(&reservation, Some(&item)).await;
                info!(
                    reservation_id,
                    item_id = %reservation.item_id,
                    quantity = reservation.quantity,
                    "Reservation expired"
                );
                self.publish(&reservation, ReservationEventKind::ReservationExpired).await;
                Ok(Some(reservation))
            }
            Transition::Skipped { .. } => Ok(None),
        }
    }

    pub(crate) async fn overdue_reservations(&self, limit: i64) -> Result<Vec<Reservation>> {
        let now = self.clock.now();
        Ok(self.store.overdue_reservations(now, limit).await?)
    }

    pub async fn get_reservation(&self, reservation_id: &str) -> Result<Reservation> {
        let ttl = self.cache.policy().entity_ttl;
        self.cache
            .get_or_load(&keys::reservation(reservation_id), ttl, || async {
                self.store
                    .find_reservation(reservation_id)
                    .await?
                    .ok_or_else(|| InventoryError::ReservationNotFound(reservation_id.to_string()))
            })
            .await
    }

    pub async fn list_customer_reservations(&self, customer_id: Uuid) -> Result<Vec<Reservation>> {
        let ttl = self.cache.policy().list_ttl;
        self.cache
            .get_or_load(&keys::customer_reservations(customer_id), ttl, || async {
                Ok(self.store.reservations_for_customer(customer_id).await?)
            })
            .await
    }

    pub async fn list_item_reservations(&self, item_id: Uuid) -> Result<Vec<Reservation>> {
        let ttl = self.cache.policy().list_ttl;
        self.cache
            .get_or_load(&keys::item_reservations(item_id), ttl, || async {
                Ok(self.store.reservations_for_item(item_id).await?)
            })
            .await
    }

    async fn load_item(&self, item_id: Uuid) -> Result<StockItem> {
        self.store
            .find_item(item_id)
            .await?
            .ok_or(InventoryError::ItemNotFound(item_id))
    }

    async fn load_reservation(&self, reservation_id: &str) -> Result<Reservation> {
        self.store
            .find_reservation(reservation_id)
            .await?
            .ok_or_else(|| InventoryError::ReservationNotFound(reservation_id.to_string()))
    }

    async fn transition<P>(
        &self,
        reservation_id: &str,
        origin: Option<&CommandOrigin>,
        plan: P,
    ) -> Result<Transition>
    where
        P: Fn(&Reservation, &StockItem, DateTime<Utc>) -> Result<Step>,
    {
        let item_id = self.load_reservation(reservation_id).await?.item_id;
        let plan = &plan;

        retry_on_conflict(&self.settings.retry, item_id, || async move {
            let current = self.load_reservation(reservation_id).await?;
            let item = self.load_item(current.item_id).await?;
            let now = self.clock.now();

            let change = match plan(&current, &item, now)? {
                Step::Write(change) => change,
                Step::Skip => return Ok(Attempt::Done(Transition::Skipped { current })),
            };
            let change = match origin {
                Some(origin) => {
                    let receipt = origin.receipt(&change.next)?;
                    change.with_receipt(receipt)
                }
                None => change,
            };

            match self.store.transition_reservation(&change).await? {
                WriteOutcome::Applied => {
                    let mut item = item;
                    if let Some(guarded) = change.stock {
                        if let Some(levels) = item.levels().apply(&guarded.mutation.delta()) {
                            item.available_quantity = levels.available;
                            item.reserved_quantity = levels.reserved;
                            item.pending_reservations = levels.pending;
                            item.version += 1;
                        }
                    }
                    Ok(Attempt::Done(Transition::Written {
                        reservation: change.next,
                        item,
                    }))
                }
                WriteOutcome::VersionMismatch | WriteOutcome::StatusMismatch => {
                    warn!(reservation_id, "Reservation or item changed concurrently");
                    Ok(Attempt::Conflict)
                }
                WriteOutcome::ItemNotFound => Err(InventoryError::ItemNotFound(current.item_id)),
                WriteOutcome::Insufficient(levels) => {
                    Err(insufficient(current.item_id, current.quantity, levels))
                }
            }
        })
        .await
    }

    /// Invalidate caches for a written transition. A skipped one can only come
    /// from a state the action does not accept.
    async fn finish(&self, transition: Transition, action: &'static str) -> Result<Reservation> {
        match transition {
            Transition::Written { reservation, item } => {
                self.cache.invalidate_reservation(&reservation, Some(&item)).await;
                Ok(reservation)
            }
            Transition::Skipped { current } => Err(invalid_state(&current, action)),
        }
    }

    async fn publish(&self, reservation: &Reservation, kind: ReservationEventKind) {
        let event = ReservationEvent::new(
            kind,
            reservation.reservation_id.clone(),
            reservation.item_id,
            reservation.customer_id,
            reservation.quantity,
            reservation.updated_at,
        );
        self.publisher.publish(event).await;
    }
}

fn invalid_state(reservation: &Reservation, action: &'static str) -> InventoryError {
    InventoryError::InvalidStateTransition {
        reservation_id: reservation.reservation_id.clone(),
        status: reservation.status,
        action,
    }
}

fn already_expired(reservation: &Reservation) -> InventoryError {
    InventoryError::AlreadyExpired {
        reservation_id: reservation.reservation_id.clone(),
        expires_at: reservation.expires_at,
    }
}
