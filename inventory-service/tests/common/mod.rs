#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, TimeZone, Utc};
use uuid::Uuid;

use inventory_service::cache::{CacheBackend, CachePolicy, MemoryCache, ReadThroughCache};
use inventory_service::catalog::CatalogIngestor;
use inventory_service::clock::Clock;
use inventory_service::error::{CacheError, StoreError};
use inventory_service::events::{EventPublisher, MessageSink};
use inventory_service::handlers::CommandHandler;
use inventory_service::ledger::{RetryPolicy, StockLedger, StockMutation};
use inventory_service::models::{
    CatalogFields, CommandReceipt, EquipmentFilter, InventoryStatistics, Reservation,
    RetireOutcome, StockItem,
};
use inventory_service::reaper::{ExpirationReaper, ReaperSettings};
use inventory_service::reservations::{ReservationOrchestrator, ReservationSettings};
use inventory_service::service::InventoryService;
use inventory_service::store::{
    InventoryStore, MemoryInventoryStore, ReservationChange, StoreResult, WriteOutcome,
};
use shared::ReservationEvent;

pub const RESERVATION_TOPIC: &str = "reservation-events";
pub const REPLY_TOPIC: &str = "inventory-replies";

pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<(String, String, String)>>,
    failing: AtomicBool,
}

impl RecordingSink {
    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn messages(&self, topic: &str) -> Vec<(String, String)> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _, _)| t == topic)
            .map(|(_, key, payload)| (key.clone(), payload.clone()))
            .collect()
    }

    pub fn events(&self) -> Vec<ReservationEvent> {
        self.messages(RESERVATION_TOPIC)
            .into_iter()
            .map(|(_, payload)| serde_json::from_str(&payload).unwrap())
            .collect()
    }

    pub fn event_names(&self) -> Vec<&'static str> {
        self.events().iter().map(|e| e.name()).collect()
    }
}

#[async_trait]
impl MessageSink for RecordingSink {
    async fn send(&self, topic: &str, key: &str, payload: String) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("broker unavailable");
        }
        self.sent
            .lock()
            .unwrap()
            .push((topic.to_string(), key.to_string(), payload));
        Ok(())
    }
}

/// Cache backend whose every call fails.
pub struct BrokenCache;

#[async_trait]
impl CacheBackend for BrokenCache {
    async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
        Err(CacheError::Backend("connection refused".to_string()))
    }

    async fn set(&self, _key: &str, _value: String, _ttl: StdDuration) -> Result<(), CacheError> {
        Err(CacheError::Backend("connection refused".to_string()))
    }

    async fn delete(&self, _keys: &[String]) -> Result<(), CacheError> {
        Err(CacheError::Backend("connection refused".to_string()))
    }
}

/// Cache backend that never answers within the operation timeout.
pub struct StalledCache;

#[async_trait]
impl CacheBackend for StalledCache {
    async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
        tokio::time::sleep(StdDuration::from_secs(5)).await;
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: String, _ttl: StdDuration) -> Result<(), CacheError> {
        tokio::time::sleep(StdDuration::from_secs(5)).await;
        Ok(())
    }

    async fn delete(&self, _keys: &[String]) -> Result<(), CacheError> {
        tokio::time::sleep(StdDuration::from_secs(5)).await;
        Ok(())
    }
}

/// Memory store with injectable failures: reservation transitions for chosen
/// reservations, and a number of upcoming `record_processed_command` calls.
#[derive(Default)]
pub struct FaultyStore {
    inner: MemoryInventoryStore,
    broken: Mutex<HashSet<String>>,
    failing_records: AtomicUsize,
}

impl FaultyStore {
    pub fn break_reservation(&self, reservation_id: &str) {
        self.broken.lock().unwrap().insert(reservation_id.to_string());
    }

    pub fn heal(&self) {
        self.broken.lock().unwrap().clear();
    }

    pub fn fail_records(&self, count: usize) {
        self.failing_records.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl InventoryStore for FaultyStore {
    async fn find_item(&self, item_id: Uuid) -> StoreResult<Option<StockItem>> {
        self.inner.find_item(item_id).await
    }

    async fn search_items(&self, filter: &EquipmentFilter) -> StoreResult<Vec<StockItem>> {
        self.inner.search_items(filter).await
    }

    async fn statistics(&self) -> StoreResult<InventoryStatistics> {
        self.inner.statistics().await
    }

    async fn apply_mutation(
        &self,
        item_id: Uuid,
        mutation: StockMutation,
        expected_version: Option<i64>,
        now: DateTime<Utc>,
        receipt: Option<&CommandReceipt>,
    ) -> StoreResult<WriteOutcome> {
        self.inner
            .apply_mutation(item_id, mutation, expected_version, now, receipt)
            .await
    }

    async fn insert_item_if_absent(&self, item: &StockItem) -> StoreResult<bool> {
        self.inner.insert_item_if_absent(item).await
    }

    async fn update_catalog_fields(&self, item_id: Uuid, fields: &CatalogFields) -> StoreResult<bool> {
        self.inner.update_catalog_fields(item_id, fields).await
    }

    async fn fill_unsynced_item(&self, item_id: Uuid, fields: &CatalogFields) -> StoreResult<bool> {
        self.inner.fill_unsynced_item(item_id, fields).await
    }

    async fn retire_item(&self, item_id: Uuid, now: DateTime<Utc>) -> StoreResult<Option<RetireOutcome>> {
        self.inner.retire_item(item_id, now).await
    }

    async fn find_reservation(&self, reservation_id: &str) -> StoreResult<Option<Reservation>> {
        self.inner.find_reservation(reservation_id).await
    }

    async fn reservations_for_customer(&self, customer_id: Uuid) -> StoreResult<Vec<Reservation>> {
        self.inner.reservations_for_customer(customer_id).await
    }

    async fn reservations_for_item(&self, item_id: Uuid) -> StoreResult<Vec<Reservation>> {
        self.inner.reservations_for_item(item_id).await
    }

    async fn overdue_reservations(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<Reservation>> {
        self.inner.overdue_reservations(now, limit).await
    }

    async fn insert_reservation(
        &self,
        reservation: &Reservation,
        expected_version: i64,
        receipt: Option<&CommandReceipt>,
    ) -> StoreResult<WriteOutcome> {
        self.inner
            .insert_reservation(reservation, expected_version, receipt)
            .await
    }

    async fn transition_reservation(&self, change: &ReservationChange) -> StoreResult<WriteOutcome> {
        if self.broken.lock().unwrap().contains(&change.next.reservation_id) {
            return Err(StoreError::Pool("connection reset".to_string()));
        }
        self.inner.transition_reservation(change).await
    }

    async fn find_processed_command(&self, idempotency_key: &str) -> StoreResult<Option<serde_json::Value>> {
        self.inner.find_processed_command(idempotency_key).await
    }

    async fn record_processed_command(
        &self,
        idempotency_key: &str,
        command_id: Uuid,
        reply: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let failing = self
            .failing_records
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Pool("timed out".to_string()));
        }
        self.inner
            .record_processed_command(idempotency_key, command_id, reply, now)
            .await
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff: StdDuration::from_millis(1),
    }
}

pub struct Harness {
    pub store: Arc<dyn InventoryStore>,
    pub cache_backend: Arc<MemoryCache>,
    pub cache: ReadThroughCache,
    pub clock: Arc<ManualClock>,
    pub sink: Arc<RecordingSink>,
    pub orchestrator: Arc<ReservationOrchestrator>,
    pub service: Arc<InventoryService>,
    pub ingestor: CatalogIngestor,
    pub commands: CommandHandler,
    pub reaper: ExpirationReaper,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryInventoryStore::new()))
    }

    pub fn with_store(store: Arc<dyn InventoryStore>) -> Self {
        let cache_backend = Arc::new(MemoryCache::new());
        let backend: Arc<dyn CacheBackend> = cache_backend.clone();
        let cache = ReadThroughCache::new(backend, CachePolicy::default());
        Self::build(store, cache_backend, cache)
    }

    pub fn with_cache_backend(backend: Arc<dyn CacheBackend>) -> Self {
        let cache = ReadThroughCache::new(
            backend,
            CachePolicy {
                op_timeout: StdDuration::from_millis(20),
                ..CachePolicy::default()
            },
        );
        Self::build(
            Arc::new(MemoryInventoryStore::new()),
            Arc::new(MemoryCache::new()),
            cache,
        )
    }

    fn build(store: Arc<dyn InventoryStore>, cache_backend: Arc<MemoryCache>, cache: ReadThroughCache) -> Self {
        let clock = Arc::new(ManualClock::new());
        let sink = Arc::new(RecordingSink::default());
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let dyn_sink: Arc<dyn MessageSink> = sink.clone();

        let orchestrator = Arc::new(ReservationOrchestrator::new(
            store.clone(),
            cache.clone(),
            EventPublisher::new(dyn_sink.clone(), RESERVATION_TOPIC),
            dyn_clock.clone(),
            ReservationSettings {
                retry: fast_retry(),
                ..ReservationSettings::default()
            },
        ));
        let ledger = StockLedger::new(store.clone(), dyn_clock.clone(), fast_retry());
        let service = Arc::new(InventoryService::new(
            store.clone(),
            ledger,
            cache.clone(),
            dyn_clock.clone(),
        ));
        let ingestor = CatalogIngestor::new(store.clone(), cache.clone(), dyn_clock.clone());
        let commands = CommandHandler::new(
            orchestrator.clone(),
            service.clone(),
            store.clone(),
            dyn_sink,
            dyn_clock,
            REPLY_TOPIC.to_string(),
        );
        let reaper = ExpirationReaper::new(orchestrator.clone(), ReaperSettings::default());

        Self {
            store,
            cache_backend,
            cache,
            clock,
            sink,
            orchestrator,
            service,
            ingestor,
            commands,
            reaper,
        }
    }

    pub fn clock_now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn ledger(&self) -> StockLedger {
        let clock: Arc<dyn Clock> = self.clock.clone();
        StockLedger::new(self.store.clone(), clock, fast_retry())
    }

    /// A synced, rentable camera with `available` units on hand.
    pub async fn seed_item(&self, available: i32) -> Uuid {
        self.seed(available, "camera", "Acme").await
    }

    pub async fn seed(&self, available: i32, category: &str, brand: &str) -> Uuid {
        let item_id = Uuid::new_v4();
        let now = self.clock.now();
        let mut item = StockItem::placeholder(item_id, now);
        item.sku = Some(format!("SKU-{}", &item_id.simple().to_string()[..8]));
        item.name = format!("{brand} {category}");
        item.category = Some(category.to_string());
        item.brand = Some(brand.to_string());
        item.base_price = Some(BigDecimal::from(2000));
        item.daily_rate = Some(BigDecimal::from(60));
        item.available_quantity = available;
        item.last_synced_at = Some(now);
        assert!(self.store.insert_item_if_absent(&item).await.unwrap());
        item_id
    }

    pub async fn item(&self, item_id: Uuid) -> StockItem {
        self.store.find_item(item_id).await.unwrap().unwrap()
    }
}
