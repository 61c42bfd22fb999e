//! Applies upstream catalog events to the catalog-owned columns of the stock
//! ledger. Counters are never touched here.

use std::sync::Arc;
use std::time::Duration;

use bigdecimal::num_bigint::BigInt;
use bigdecimal::{BigDecimal, RoundingMode};
use futures::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::{Message, Offset};
use shared::{CatalogEvent, CatalogItem, DecodedCatalogEvent};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cache::ReadThroughCache;
use crate::clock::Clock;
use crate::error::{InventoryError, Result};
use crate::models::{CatalogFields, RetireOutcome, StockItem};
use crate::store::InventoryStore;

/// Default daily rental rate as a share of the catalog base price.
pub fn daily_rate(category: Option<&str>, base_price: &BigDecimal) -> BigDecimal {
    // (numerator, scale): 3 / 10^2 = 3%
    let (numerator, scale) = match category.map(str::to_ascii_lowercase).as_deref() {
        Some("camera") => (3, 2),
        Some("lens") => (25, 3),
        Some("lighting") => (4, 2),
        Some("audio") => (35, 3),
        Some("drone") => (5, 2),
        _ => (3, 2),
    };
    let share = BigDecimal::new(BigInt::from(numerator), scale);
    let minimum = BigDecimal::new(BigInt::from(500), 2);

    let rate = (base_price * share).with_scale_round(2, RoundingMode::HalfUp);
    if rate < minimum {
        minimum
    } else {
        rate
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Created,
    /// Replay of a create for an item that is already synced.
    AlreadyExists,
    /// Catalog fields written onto a row first created by a stock add.
    Filled,
    Refreshed,
    PriceUpdated,
    Deactivated,
    RentalSuspended,
    /// Delete for an item this service never knew about.
    Ignored,
    /// Event kind this service does not consume.
    Skipped(String),
}

pub struct CatalogIngestor {
    store: Arc<dyn InventoryStore>,
    cache: ReadThroughCache,
    clock: Arc<dyn Clock>,
    redelivery_delay: Duration,
}

impl CatalogIngestor {
    pub fn new(store: Arc<dyn InventoryStore>, cache: ReadThroughCache, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            cache,
            clock,
            redelivery_delay: Duration::from_secs(1),
        }
    }

    pub async fn run(&self, consumer: StreamConsumer) {
        let mut message_stream = consumer.stream();

        while let Some(message) = message_stream.next().await {
            let m = match message {
                Ok(m) => m,
                Err(e) => {
                    error!("Error receiving catalog message: {}", e);
                    continue;
                }
            };

            let result = match m.payload_view::<str>() {
                Some(Ok(payload)) => self.handle_payload(payload).await.map(|_| ()),
                Some(Err(e)) => {
                    warn!(offset = m.offset(), "Skipping non UTF-8 catalog message: {}", e);
                    Ok(())
                }
                None => Ok(()),
            };

            match result {
                Ok(()) => {
                    if let Err(e) = consumer.commit_message(&m, CommitMode::Async) {
                        error!("Error committing catalog message: {}", e);
                    }
                }
                Err(e) => {
                    error!(
                        topic = m.topic(),
                        partition = m.partition(),
                        offset = m.offset(),
                        "Catalog event not applied, will be redelivered: {}",
                        e
                    );
                    tokio::time::sleep(self.redelivery_delay).await;
                    if let Err(e) = consumer.seek(
                        m.topic(),
                        m.partition(),
                        Offset::Offset(m.offset()),
                        Duration::from_secs(5),
                    ) {
                        error!("Error seeking back to failed catalog message: {}", e);
                    }
                }
            }
        }
    }

    pub async fn handle_payload(&self, payload: &str) -> Result<IngestOutcome> {
        let event = match CatalogEvent::decode(payload) {
            Ok(DecodedCatalogEvent::Known(event)) => event,
            Ok(DecodedCatalogEvent::Unknown(kind)) => {
                info!(kind = %kind, "Skipping unknown catalog event");
                return Ok(IngestOutcome::Skipped(kind));
            }
            Err(e) => {
                return Err(InventoryError::EventProcessing(format!(
                    "malformed catalog event: {e}"
                )))
            }
        };
        self.apply(event).await
    }

    pub async fn apply(&self, event: CatalogEvent) -> Result<IngestOutcome> {
        let kind = event.kind();
        let item_id = event.item_id();

        let outcome = match event {
            CatalogEvent::ItemCreated(item) => self.item_created(&item).await?,
            CatalogEvent::ItemUpdated(item) => self.item_updated(&item).await?,
            CatalogEvent::ItemPriceChanged { id, new_price, .. } => self.price_changed(id, new_price).await?,
            CatalogEvent::ItemDeleted { id } => self.item_deleted(id).await?,
        };

        info!(kind, item_id = %item_id, ?outcome, "Catalog event applied");
        Ok(outcome)
    }

    async fn item_created(&self, item: &CatalogItem) -> Result<IngestOutcome> {
        let now = self.clock.now();
        let fields = catalog_fields(item, now);

        let mut row = StockItem::placeholder(item.id, now);
        row.apply_catalog_fields(&fields);

        let outcome = if self.store.insert_item_if_absent(&row).await? {
            IngestOutcome::Created
        } else if self.store.fill_unsynced_item(item.id, &fields).await? {
            IngestOutcome::Filled
        } else {
            return Ok(IngestOutcome::AlreadyExists);
        };

        self.invalidate(item.id, None).await?;
        Ok(outcome)
    }

    async fn item_updated(&self, item: &CatalogItem) -> Result<IngestOutcome> {
        let previous = self.store.find_item(item.id).await?;
        let fields = catalog_fields(item, self.clock.now());

        if !self.store.update_catalog_fields(item.id, &fields).await? {
            return Err(out_of_order("ItemUpdated", item.id));
        }

        self.invalidate(item.id, previous.as_ref()).await?;
        Ok(IngestOutcome::Refreshed)
    }

    async fn price_changed(&self, item_id: Uuid, new_price: BigDecimal) -> Result<IngestOutcome> {
        let current = self
            .store
            .find_item(item_id)
            .await?
            .ok_or_else(|| out_of_order("ItemPriceChanged", item_id))?;

        let fields = CatalogFields {
            sku: current.sku.clone(),
            name: current.name.clone(),
            category: current.category.clone(),
            brand: current.brand.clone(),
            item_type: current.item_type.clone(),
            daily_rate: Some(daily_rate(current.category.as_deref(), &new_price)),
            base_price: Some(new_price),
            description: current.description.clone(),
            is_rental_available: current.is_rental_available,
            last_synced_at: self.clock.now(),
        };

        if !self.store.update_catalog_fields(item_id, &fields).await? {
            return Err(out_of_order("ItemPriceChanged", item_id));
        }

        self.cache.invalidate_item(&current).await;
        Ok(IngestOutcome::PriceUpdated)
    }

    async fn item_deleted(&self, item_id: Uuid) -> Result<IngestOutcome> {
        let outcome = match self.store.retire_item(item_id, self.clock.now()).await? {
            Some(RetireOutcome::Deactivated) => IngestOutcome::Deactivated,
            Some(RetireOutcome::RentalSuspended) => {
                warn!(item_id = %item_id, "Item has confirmed reservations, suspending rentals only");
                IngestOutcome::RentalSuspended
            }
            None => return Ok(IngestOutcome::Ignored),
        };

        self.invalidate(item_id, None).await?;
        Ok(outcome)
    }

    /// Drop cached views of the item as it is now, and of `previous` when its
    /// category or brand may have moved it between search buckets.
    async fn invalidate(&self, item_id: Uuid, previous: Option<&StockItem>) -> Result<()> {
        if let Some(previous) = previous {
            self.cache.invalidate_item(previous).await;
        }
        if let Some(current) = self.store.find_item(item_id).await? {
            self.cache.invalidate_item(&current).await;
        }
        Ok(())
    }
}

fn catalog_fields(item: &CatalogItem, now: chrono::DateTime<chrono::Utc>) -> CatalogFields {
    CatalogFields {
        sku: item.sku.clone(),
        name: item.name.clone(),
        category: item.category.clone(),
        brand: item.brand.clone(),
        item_type: item.item_type.clone(),
        base_price: item.base_price.clone(),
        daily_rate: item
            .base_price
            .as_ref()
            .map(|price| daily_rate(item.category.as_deref(), price)),
        description: item.description.clone(),
        is_rental_available: item.rental_eligible,
        last_synced_at: now,
    }
}

fn out_of_order(kind: &str, item_id: Uuid) -> InventoryError {
    InventoryError::EventProcessing(format!("{kind} for unknown item {item_id}"))
}
