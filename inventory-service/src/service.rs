use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::cache::{keys, ReadThroughCache};
use crate::clock::Clock;
use crate::error::{InventoryError, Result};
use crate::ledger::{StockLedger, StockMutation};
use crate::models::{
    Availability, CommandOrigin, EquipmentFilter, EquipmentView, InventoryStatistics, StockItem,
};
use crate::store::InventoryStore;

/// Equipment reads and manual stock adjustments.
pub struct InventoryService {
    store: Arc<dyn InventoryStore>,
    ledger: StockLedger,
    cache: ReadThroughCache,
    clock: Arc<dyn Clock>,
}

impl InventoryService {
    pub fn new(
        store: Arc<dyn InventoryStore>,
        ledger: StockLedger,
        cache: ReadThroughCache,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            ledger,
            cache,
            clock,
        }
    }

    pub async fn get_equipment(&self, item_id: Uuid) -> Result<EquipmentView> {
        let ttl = self.cache.policy().entity_ttl;
        self.cache
            .get_or_load(&keys::equipment(item_id), ttl, || async {
                Ok(EquipmentView::from(self.load_item(item_id).await?))
            })
            .await
    }

    /// Always read from the store: a stale answer here would let a caller
    /// attempt a reservation that is bound to fail.
    pub async fn check_availability(&self, item_id: Uuid, quantity: i32) -> Result<Availability> {
        if quantity <= 0 {
            return Err(InventoryError::InvalidRequest(format!(
                "quantity must be positive, got {quantity}"
            )));
        }
        let item = self.load_item(item_id).await?;
        Ok(Availability {
            item_id,
            available: item.is_reservable() && item.available_quantity >= quantity,
            total_quantity: item.total_quantity(),
            available_quantity: item.available_quantity,
            reserved_quantity: item.reserved_quantity,
            pending_reservations: item.pending_reservations,
        })
    }

    /// Add (`delta > 0`) or remove (`delta < 0`) available stock. Returns
    /// `false` when a removal would take available stock below zero.
    ///
    /// A first addition for an item the catalog has not described yet creates
    /// its ledger row.
    pub async fn update_stock(&self, item_id: Uuid, delta: i32, reason: Option<&str>) -> Result<bool> {
        self.adjust_stock(item_id, delta, reason, None).await
    }

    /// [`update_stock`](Self::update_stock) on behalf of a command. When the
    /// adjustment applies, the command's reply is committed with it.
    pub(crate) async fn adjust_stock(
        &self,
        item_id: Uuid,
        delta: i32,
        reason: Option<&str>,
        origin: Option<&CommandOrigin>,
    ) -> Result<bool> {
        let receipt = origin
            .map(|origin| origin.receipt(&stock_update_result(item_id, true)))
            .transpose()?;
        let receipt = receipt.as_ref();

        let applied = match delta {
            0 => {
                return Err(InventoryError::InvalidRequest(
                    "stock delta must not be zero".to_string(),
                ))
            }
            d if d > 0 => {
                let mutation = StockMutation::AddStock(d);
                match self.ledger.adjust(item_id, mutation, receipt).await {
                    Err(InventoryError::ItemNotFound(_)) => {
                        let placeholder = StockItem::placeholder(item_id, self.clock.now());
                        if self.store.insert_item_if_absent(&placeholder).await? {
                            info!(item_id = %item_id, "Created stock ledger entry ahead of catalog sync");
                        }
                        self.ledger.adjust(item_id, mutation, receipt).await?
                    }
                    other => other?,
                }
            }
            d => {
                let quantity = d.checked_neg().ok_or_else(|| {
                    InventoryError::InvalidRequest(format!("stock delta out of range: {d}"))
                })?;
                self.ledger
                    .adjust(item_id, StockMutation::RemoveStock(quantity), receipt)
                    .await?
            }
        };

        if applied {
            info!(item_id = %item_id, delta, reason = reason.unwrap_or(""), "Stock updated");
            if let Some(item) = self.store.find_item(item_id).await? {
                self.cache.invalidate_item(&item).await;
            }
        }
        Ok(applied)
    }

    pub async fn search_equipment(&self, filter: &EquipmentFilter) -> Result<Vec<EquipmentView>> {
        let ttl = self.cache.policy().list_ttl;
        self.cache
            .get_or_load(&keys::search(filter), ttl, || async {
                let items = self.store.search_items(filter).await?;
                Ok(items.into_iter().map(EquipmentView::from).collect())
            })
            .await
    }

    pub async fn inventory_statistics(&self) -> Result<InventoryStatistics> {
        let ttl = self.cache.policy().stats_ttl();
        self.cache
            .get_or_load(keys::STATISTICS, ttl, || async {
                Ok(self.store.statistics().await?)
            })
            .await
    }

    async fn load_item(&self, item_id: Uuid) -> Result<StockItem> {
        self.store
            .find_item(item_id)
            .await?
            .ok_or(InventoryError::ItemNotFound(item_id))
    }
}

/// Result payload of a stock update command.
pub(crate) fn stock_update_result(item_id: Uuid, updated: bool) -> serde_json::Value {
    serde_json::json!({ "itemId": item_id, "updated": updated })
}
