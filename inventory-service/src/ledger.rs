//! Stock ledger counters and the conditional mutations applied to them.
//!
//! Every mutation is expressed as a [`StockDelta`] and applied by the store in
//! a single conditional write: the row changes only when the expected version
//! matches (if one is given) and every counter stays non-negative. Callers
//! that lose a version race re-read and retry under a [`RetryPolicy`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{InventoryError, Result};
use crate::models::CommandReceipt;
use crate::store::{InventoryStore, WriteOutcome};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevels {
    pub available: i32,
    pub reserved: i32,
    pub pending: i32,
}

impl StockLevels {
    /// The counters after `delta`, or `None` when the guards reject it.
    pub fn apply(&self, delta: &StockDelta) -> Option<StockLevels> {
        if self.available < delta.min_available {
            return None;
        }
        let next = StockLevels {
            available: self.available.checked_add(delta.available)?,
            reserved: self.reserved.checked_add(delta.reserved)?,
            pending: self.pending.checked_add(delta.pending)?,
        };
        next.is_valid().then_some(next)
    }

    pub fn is_valid(&self) -> bool {
        self.available >= 0 && self.reserved >= 0 && self.pending >= 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockDelta {
    pub available: i32,
    pub reserved: i32,
    pub pending: i32,
    /// Lower bound on `available` before the delta is applied.
    pub min_available: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StockMutation {
    AddStock(i32),
    RemoveStock(i32),
    /// available -> reserved
    Reserve(i32),
    /// reserved -> available
    Release(i32),
    /// Soft hold for a new pending reservation; requires `available >= q`.
    HoldPending(i32),
    /// Drop a pending hold without touching available stock.
    ReleasePending(i32),
    /// Promote a pending hold: reserve(q) and drop the pending hold.
    ConfirmPending(i32),
}

impl StockMutation {
    pub fn quantity(&self) -> i32 {
        match *self {
            StockMutation::AddStock(q)
            | StockMutation::RemoveStock(q)
            | StockMutation::Reserve(q)
            | StockMutation::Release(q)
            | StockMutation::HoldPending(q)
            | StockMutation::ReleasePending(q)
            | StockMutation::ConfirmPending(q) => q,
        }
    }

    pub fn delta(&self) -> StockDelta {
        let zero = StockDelta {
            available: 0,
            reserved: 0,
            pending: 0,
            min_available: 0,
        };
        match *self {
            StockMutation::AddStock(q) => StockDelta { available: q, ..zero },
            StockMutation::RemoveStock(q) => StockDelta { available: -q, ..zero },
            StockMutation::Reserve(q) => StockDelta {
                available: -q,
                reserved: q,
                ..zero
            },
            StockMutation::Release(q) => StockDelta {
                available: q,
                reserved: -q,
                ..zero
            },
            StockMutation::HoldPending(q) => StockDelta {
                pending: q,
                min_available: q,
                ..zero
            },
            StockMutation::ReleasePending(q) => StockDelta { pending: -q, ..zero },
            StockMutation::ConfirmPending(q) => StockDelta {
                available: -q,
                reserved: q,
                pending: -q,
                min_available: 0,
            },
        }
    }
}

/// Bounded exponential backoff for version conflicts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
        }
    }
}

impl RetryPolicy {
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// Outcome of one optimistic attempt.
pub enum Attempt<T> {
    Done(T),
    Conflict,
}

/// Run `operation` until it completes or the attempt budget is spent.
///
/// Only [`Attempt::Conflict`] is retried; errors are returned immediately.
pub async fn retry_on_conflict<T, F, Fut>(
    policy: &RetryPolicy,
    item_id: Uuid,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Attempt<T>>>,
{
    let max_attempts = policy.max_attempts.max(1);
    for attempt in 1..=max_attempts {
        match operation().await? {
            Attempt::Done(value) => {
                if attempt > 1 {
                    debug!(item_id = %item_id, attempt, "Conditional write succeeded after retry");
                }
                return Ok(value);
            }
            Attempt::Conflict if attempt < max_attempts => {
                let backoff = policy.backoff_for(attempt);
                warn!(item_id = %item_id, attempt, backoff_ms = backoff.as_millis() as u64, "Version conflict, retrying");
                tokio::time::sleep(backoff).await;
            }
            Attempt::Conflict => {}
        }
    }

    Err(InventoryError::VersionConflict {
        item_id,
        attempts: max_attempts,
    })
}

/// The atomic mutation engine over the stock ledger.
#[derive(Clone)]
pub struct StockLedger {
    store: Arc<dyn InventoryStore>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl StockLedger {
    pub fn new(store: Arc<dyn InventoryStore>, clock: Arc<dyn Clock>, retry: RetryPolicy) -> Self {
        Self { store, clock, retry }
    }

    /// Unconditional on version; fails only if the item is missing.
    pub async fn add_stock(&self, item_id: Uuid, quantity: i32) -> Result<bool> {
        self.adjust(item_id, StockMutation::AddStock(quantity), None).await
    }

    /// Unconditional on version; returns `false` if available stock would go
    /// negative.
    pub async fn remove_stock(&self, item_id: Uuid, quantity: i32) -> Result<bool> {
        self.adjust(item_id, StockMutation::RemoveStock(quantity), None).await
    }

    /// Apply `mutation` without a version check, committing `receipt` with it
    /// when it applies.
    pub(crate) async fn adjust(
        &self,
        item_id: Uuid,
        mutation: StockMutation,
        receipt: Option<&CommandReceipt>,
    ) -> Result<bool> {
        ensure_non_negative(mutation.quantity())?;
        self.apply_unversioned(item_id, mutation, receipt).await
    }

    pub async fn reserve(&self, item_id: Uuid, quantity: i32) -> Result<()> {
        ensure_positive(quantity)?;
        self.apply_versioned(item_id, StockMutation::Reserve(quantity)).await
    }

    pub async fn release(&self, item_id: Uuid, quantity: i32) -> Result<()> {
        ensure_positive(quantity)?;
        self.apply_versioned(item_id, StockMutation::Release(quantity)).await
    }

    async fn apply_unversioned(
        &self,
        item_id: Uuid,
        mutation: StockMutation,
        receipt: Option<&CommandReceipt>,
    ) -> Result<bool> {
        let now = self.clock.now();
        match self.store.apply_mutation(item_id, mutation, None, now, receipt).await? {
            WriteOutcome::Applied => {
                info!(item_id = %item_id, ?mutation, "Stock ledger updated");
                Ok(true)
            }
            WriteOutcome::Insufficient(levels) => {
                warn!(item_id = %item_id, ?mutation, ?levels, "Stock mutation rejected");
                Ok(false)
            }
            WriteOutcome::ItemNotFound => Err(InventoryError::ItemNotFound(item_id)),
            WriteOutcome::VersionMismatch | WriteOutcome::StatusMismatch => {
                Err(InventoryError::VersionConflict { item_id, attempts: 1 })
            }
        }
    }

    async fn apply_versioned(&self, item_id: Uuid, mutation: StockMutation) -> Result<()> {
        retry_on_conflict(&self.retry, item_id, || async move {
            let item = self
                .store
                .find_item(item_id)
                .await?
                .ok_or(InventoryError::ItemNotFound(item_id))?;

            let now = self.clock.now();
            match self
                .store
                .apply_mutation(item_id, mutation, Some(item.version), now, None)
                .await?
            {
                WriteOutcome::Applied => Ok(Attempt::Done(())),
                WriteOutcome::VersionMismatch | WriteOutcome::StatusMismatch => Ok(Attempt::Conflict),
                WriteOutcome::ItemNotFound => Err(InventoryError::ItemNotFound(item_id)),
                WriteOutcome::Insufficient(levels) => Err(insufficient(item_id, mutation.quantity(), levels)),
            }
        })
        .await
    }
}

pub(crate) fn insufficient(item_id: Uuid, requested: i32, levels: StockLevels) -> InventoryError {
    InventoryError::InsufficientStock {
        item_id,
        requested,
        available: levels.available,
        reserved: levels.reserved,
        pending: levels.pending,
    }
}

fn ensure_positive(quantity: i32) -> Result<()> {
    if quantity <= 0 {
        return Err(InventoryError::InvalidRequest(format!(
            "quantity must be positive, got {quantity}"
        )));
    }
    Ok(())
}

fn ensure_non_negative(quantity: i32) -> Result<()> {
    if quantity < 0 {
        return Err(InventoryError::InvalidRequest(format!(
            "quantity must not be negative, got {quantity}"
        )));
    }
    Ok(())
}
