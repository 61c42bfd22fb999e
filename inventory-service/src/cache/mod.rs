//! Read-through cache in front of the read-heavy queries.
//!
//! The cache is best-effort. Every backend call is bounded by a short timeout
//! and any failure degrades to a miss on reads and a no-op on writes and
//! invalidations. Nothing in this module returns a cache error to a caller.

mod memory;
mod redis_backend;

pub use self::memory::MemoryCache;
pub use self::redis_backend::RedisCache;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{CacheError, Result};
use crate::models::{EquipmentFilter, Reservation, StockItem};

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, keys: &[String]) -> Result<(), CacheError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
    pub op_timeout: Duration,
    pub entity_ttl: Duration,
    pub list_ttl: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            op_timeout: Duration::from_millis(50),
            entity_ttl: Duration::from_secs(30 * 60),
            list_ttl: Duration::from_secs(15 * 60),
        }
    }
}

impl CachePolicy {
    pub fn stats_ttl(&self) -> Duration {
        self.list_ttl / 2
    }
}

pub mod keys {
    use super::*;

    pub const STATISTICS: &str = "inventory:stats";

    pub fn equipment(item_id: Uuid) -> String {
        format!("equipment:{item_id}")
    }

    pub fn reservation(reservation_id: &str) -> String {
        format!("reservation:{reservation_id}")
    }

    pub fn customer_reservations(customer_id: Uuid) -> String {
        format!("reservations:customer:{customer_id}")
    }

    pub fn item_reservations(item_id: Uuid) -> String {
        format!("reservations:item:{item_id}")
    }

    /// Unset fields are written as `*`; set ones are escaped so that no value
    /// can spell out the wildcard or another field's separator.
    pub fn search(filter: &EquipmentFilter) -> String {
        format!(
            "equipment:search:c={}:b={}:r={}",
            component(filter.category.as_deref()),
            component(filter.brand.as_deref()),
            filter.rental_available_only,
        )
    }

    fn component(value: Option<&str>) -> String {
        let Some(value) = value else {
            return "*".to_string();
        };
        let mut escaped = String::with_capacity(value.len());
        for c in value.chars() {
            match c {
                '%' => escaped.push_str("%25"),
                ':' => escaped.push_str("%3A"),
                '*' => escaped.push_str("%2A"),
                c => escaped.push(c),
            }
        }
        escaped
    }

    /// Every search bucket whose results could include a row with this
    /// category and brand.
    pub fn search_buckets(category: Option<&str>, brand: Option<&str>) -> Vec<String> {
        let categories = [category.map(str::to_string), None];
        let brands = [brand.map(str::to_string), None];
        let mut buckets = Vec::with_capacity(8);
        for category in &categories {
            for brand in &brands {
                for rental_available_only in [false, true] {
                    let key = search(&EquipmentFilter {
                        category: category.clone(),
                        brand: brand.clone(),
                        rental_available_only,
                    });
                    if !buckets.contains(&key) {
                        buckets.push(key);
                    }
                }
            }
        }
        buckets
    }
}

/// Optional cache backend plus the timeout and TTL policy for using it.
#[derive(Clone)]
pub struct ReadThroughCache {
    backend: Option<Arc<dyn CacheBackend>>,
    policy: CachePolicy,
}

impl ReadThroughCache {
    pub fn new(backend: Arc<dyn CacheBackend>, policy: CachePolicy) -> Self {
        Self {
            backend: Some(backend),
            policy,
        }
    }

    pub fn disabled() -> Self {
        Self {
            backend: None,
            policy: CachePolicy::default(),
        }
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    /// Serve `key` from the cache, or compute it with `load` and store the
    /// result for `ttl`. Errors from `load` are returned and never cached.
    pub async fn get_or_load<T, F, Fut>(&self, key: &str, ttl: Duration, load: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(hit) = self.get::<T>(key).await {
            debug!(key, "Cache hit");
            return Ok(hit);
        }

        let value = load().await?;
        self.put(key, &value, ttl).await;
        Ok(value)
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let backend = self.backend.as_ref()?;
        let raw = match self.bounded(backend.get(key)).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(key, error = %e, "Cache read failed, falling back to store");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "Discarding undecodable cache entry");
                self.invalidate(vec![key.to_string()]).await;
                None
            }
        }
    }

    pub async fn put<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let Some(backend) = &self.backend else {
            return;
        };
        let payload = match serde_json::to_string(value) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(key, error = %e, "Skipping cache write for unserializable value");
                return;
            }
        };
        if let Err(e) = self.bounded(backend.set(key, payload, ttl)).await {
            warn!(key, error = %e, "Cache write failed");
        }
    }

    pub async fn invalidate(&self, keys: Vec<String>) {
        let Some(backend) = &self.backend else {
            return;
        };
        if keys.is_empty() {
            return;
        }
        if let Err(e) = self.bounded(backend.delete(&keys)).await {
            warn!(?keys, error = %e, "Cache invalidation failed");
        }
    }

    /// Keys derived from an item's row: its detail view, the search buckets
    /// that could list it and the aggregate statistics.
    pub async fn invalidate_item(&self, item: &StockItem) {
        let mut stale = vec![keys::equipment(item.item_id), keys::STATISTICS.to_string()];
        stale.extend(keys::search_buckets(
            item.category.as_deref(),
            item.brand.as_deref(),
        ));
        self.invalidate(stale).await;
    }

    /// Keys touched by a reservation transition, including those of the item
    /// whose counters moved with it.
    pub async fn invalidate_reservation(&self, reservation: &Reservation, item: Option<&StockItem>) {
        let mut stale = vec![
            keys::reservation(&reservation.reservation_id),
            keys::customer_reservations(reservation.customer_id),
            keys::item_reservations(reservation.item_id),
            keys::equipment(reservation.item_id),
            keys::STATISTICS.to_string(),
        ];
        if let Some(item) = item {
            stale.extend(keys::search_buckets(
                item.category.as_deref(),
                item.brand.as_deref(),
            ));
        }
        self.invalidate(stale).await;
    }

    async fn bounded<T>(
        &self,
        op: impl Future<Output = Result<T, CacheError>>,
    ) -> Result<T, CacheError> {
        match tokio::time::timeout(self.policy.op_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout),
        }
    }
}
