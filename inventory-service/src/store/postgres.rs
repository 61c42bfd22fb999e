use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::result::DatabaseErrorKind;
use diesel::sql_types::{BigInt, Integer, Nullable, Timestamptz};
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::pooled_connection::{bb8::Pool, PoolError};
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use diesel_migrations::{embed_migrations, EmbeddedMigrations};
use uuid::Uuid;

use super::{InventoryStore, ReservationChange, StoreResult, WriteOutcome};
use crate::error::StoreError;
use crate::ledger::StockMutation;
use crate::models::*;
use crate::schema::*;

pub type DbPool = Pool<AsyncPgConnection>;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

const CONDITIONAL_STOCK_UPDATE: &str = "\
UPDATE stock_ledger
   SET available_quantity = available_quantity + $2,
       reserved_quantity = reserved_quantity + $3,
       pending_reservations = pending_reservations + $4,
       version = version + 1,
       updated_at = $7
 WHERE item_id = $1
   AND ($5::BIGINT IS NULL OR version = $5::BIGINT)
   AND available_quantity >= $6
   AND available_quantity + $2 >= 0
   AND reserved_quantity + $3 >= 0
   AND pending_reservations + $4 >= 0";

const STATISTICS_QUERY: &str = "\
SELECT COUNT(*) AS item_count,
       COUNT(*) FILTER (WHERE is_active) AS active_item_count,
       COALESCE(SUM(available_quantity), 0)::BIGINT AS total_available,
       COALESCE(SUM(reserved_quantity), 0)::BIGINT AS total_reserved,
       COALESCE(SUM(pending_reservations), 0)::BIGINT AS total_pending
  FROM stock_ledger";

#[derive(QueryableByName)]
struct StatisticsRow {
    #[diesel(sql_type = BigInt)]
    item_count: i64,
    #[diesel(sql_type = BigInt)]
    active_item_count: i64,
    #[diesel(sql_type = BigInt)]
    total_available: i64,
    #[diesel(sql_type = BigInt)]
    total_reserved: i64,
    #[diesel(sql_type = BigInt)]
    total_pending: i64,
}

/// Aborts a transaction on a database error, because a guard rejected one of
/// its writes, or because the command it answers already has a reply.
enum TxError {
    Db(diesel::result::Error),
    Rejected(WriteOutcome),
    Duplicate(String),
}

impl From<diesel::result::Error> for TxError {
    fn from(err: diesel::result::Error) -> Self {
        TxError::Db(err)
    }
}

fn settle(result: Result<WriteOutcome, TxError>) -> StoreResult<WriteOutcome> {
    match result {
        Ok(outcome) | Err(TxError::Rejected(outcome)) => Ok(outcome),
        Err(TxError::Duplicate(key)) => Err(StoreError::DuplicateCommand(key)),
        Err(TxError::Db(err)) => Err(err.into()),
    }
}

/// Plain insert: the primary key turns a second receipt into a rollback.
async fn insert_receipt(
    conn: &mut AsyncPgConnection,
    receipt: &CommandReceipt,
    now: DateTime<Utc>,
) -> Result<(), TxError> {
    let result = diesel::insert_into(processed_commands::table)
        .values(&receipt.to_row(now))
        .execute(conn)
        .await;
    match result {
        Ok(_) => Ok(()),
        Err(diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
            Err(TxError::Duplicate(receipt.idempotency_key.clone()))
        }
        Err(err) => Err(err.into()),
    }
}

fn pool_error(err: bb8::RunError<PoolError>) -> StoreError {
    StoreError::Pool(err.to_string())
}

fn to_reservations(rows: Vec<ReservationRow>) -> StoreResult<Vec<Reservation>> {
    rows.into_iter().map(Reservation::try_from).collect()
}

/// Applies `mutation` with one conditional UPDATE. When no row matches, the
/// row is read back to tell the caller why.
async fn conditional_update(
    conn: &mut AsyncPgConnection,
    item_id: Uuid,
    mutation: StockMutation,
    expected_version: Option<i64>,
    now: DateTime<Utc>,
) -> Result<WriteOutcome, diesel::result::Error> {
    let delta = mutation.delta();
    let affected = diesel::sql_query(CONDITIONAL_STOCK_UPDATE)
        .bind::<diesel::sql_types::Uuid, _>(item_id)
        .bind::<Integer, _>(delta.available)
        .bind::<Integer, _>(delta.reserved)
        .bind::<Integer, _>(delta.pending)
        .bind::<Nullable<BigInt>, _>(expected_version)
        .bind::<Integer, _>(delta.min_available)
        .bind::<Timestamptz, _>(now)
        .execute(conn)
        .await?;

    if affected == 1 {
        return Ok(WriteOutcome::Applied);
    }

    let current = stock_ledger::table
        .filter(stock_ledger::item_id.eq(item_id))
        .select(StockItem::as_select())
        .first(conn)
        .await
        .optional()?;

    Ok(match current {
        None => WriteOutcome::ItemNotFound,
        Some(item) if expected_version.is_some_and(|v| v != item.version) => {
            WriteOutcome::VersionMismatch
        }
        Some(item) => WriteOutcome::Insufficient(item.levels()),
    })
}

/// Catalog fields carry `is_rental_available`; a retired row must not get it
/// back from a late update.
async fn keep_retired_rentals_off(
    conn: &mut AsyncPgConnection,
    item_id: Uuid,
) -> Result<(), diesel::result::Error> {
    diesel::update(
        stock_ledger::table
            .filter(stock_ledger::item_id.eq(item_id))
            .filter(stock_ledger::retired_at.is_not_null())
            .filter(stock_ledger::is_rental_available.eq(true)),
    )
    .set(stock_ledger::is_rental_available.eq(false))
    .execute(conn)
    .await?;
    Ok(())
}

pub struct PgInventoryStore {
    pool: DbPool,
}

impl PgInventoryStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InventoryStore for PgInventoryStore {
    async fn find_item(&self, item_id: Uuid) -> StoreResult<Option<StockItem>> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        let item = stock_ledger::table
            .filter(stock_ledger::item_id.eq(item_id))
            .select(StockItem::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(item)
    }

    async fn search_items(&self, filter: &EquipmentFilter) -> StoreResult<Vec<StockItem>> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        let mut query = stock_ledger::table
            .select(StockItem::as_select())
            .filter(stock_ledger::is_active.eq(true))
            .into_boxed();

        if filter.rental_available_only {
            query = query.filter(stock_ledger::is_rental_available.eq(true));
        }
        if let Some(category) = &filter.category {
            query = query.filter(stock_ledger::category.eq(category.clone()));
        }
        if let Some(brand) = &filter.brand {
            query = query.filter(stock_ledger::brand.eq(brand.clone()));
        }

        let items = query
            .order(stock_ledger::name.asc())
            .load(&mut conn)
            .await?;
        Ok(items)
    }

    async fn statistics(&self) -> StoreResult<InventoryStatistics> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        let row = diesel::sql_query(STATISTICS_QUERY)
            .get_result::<StatisticsRow>(&mut conn)
            .await?;
        Ok(InventoryStatistics {
            item_count: row.item_count,
            active_item_count: row.active_item_count,
            total_available: row.total_available,
            total_reserved: row.total_reserved,
            total_pending: row.total_pending,
        })
    }

    async fn apply_mutation(
        &self,
        item_id: Uuid,
        mutation: StockMutation,
        expected_version: Option<i64>,
        now: DateTime<Utc>,
        receipt: Option<&CommandReceipt>,
    ) -> StoreResult<WriteOutcome> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        let result = conn
            .transaction::<_, TxError, _>(|conn| {
                async move {
                    let outcome = conditional_update(conn, item_id, mutation, expected_version, now).await?;
                    if let (true, Some(receipt)) = (outcome.is_applied(), receipt) {
                        insert_receipt(conn, receipt, now).await?;
                    }
                    Ok(outcome)
                }
                .scope_boxed()
            })
            .await;
        settle(result)
    }

    async fn insert_item_if_absent(&self, item: &StockItem) -> StoreResult<bool> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        let inserted = diesel::insert_into(stock_ledger::table)
            .values(item)
            .on_conflict(stock_ledger::item_id)
            .do_nothing()
            .execute(&mut conn)
            .await?;
        Ok(inserted == 1)
    }

    async fn update_catalog_fields(&self, item_id: Uuid, fields: &CatalogFields) -> StoreResult<bool> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        let updated = conn
            .transaction::<_, diesel::result::Error, _>(|conn| {
                async move {
                    let updated = diesel::update(stock_ledger::table.filter(stock_ledger::item_id.eq(item_id)))
                        .set((fields, stock_ledger::updated_at.eq(fields.last_synced_at)))
                        .execute(conn)
                        .await?;
                    keep_retired_rentals_off(conn, item_id).await?;
                    Ok(updated == 1)
                }
                .scope_boxed()
            })
            .await?;
        Ok(updated)
    }

    async fn fill_unsynced_item(&self, item_id: Uuid, fields: &CatalogFields) -> StoreResult<bool> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        let updated = conn
            .transaction::<_, diesel::result::Error, _>(|conn| {
                async move {
                    let updated = diesel::update(
                        stock_ledger::table
                            .filter(stock_ledger::item_id.eq(item_id))
                            .filter(stock_ledger::last_synced_at.is_null()),
                    )
                    .set((fields, stock_ledger::updated_at.eq(fields.last_synced_at)))
                    .execute(conn)
                    .await?;
                    keep_retired_rentals_off(conn, item_id).await?;
                    Ok(updated == 1)
                }
                .scope_boxed()
            })
            .await?;
        Ok(updated)
    }

    async fn retire_item(&self, item_id: Uuid, now: DateTime<Utc>) -> StoreResult<Option<RetireOutcome>> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        let outcome = conn
            .transaction::<_, diesel::result::Error, _>(|conn| {
                async move {
                    let has_confirmed: bool = diesel::select(diesel::dsl::exists(
                        reservations::table
                            .filter(reservations::item_id.eq(item_id))
                            .filter(reservations::status.eq(ReservationStatus::Confirmed.as_str())),
                    ))
                    .get_result(conn)
                    .await?;

                    diesel::update(
                        stock_ledger::table
                            .filter(stock_ledger::item_id.eq(item_id))
                            .filter(stock_ledger::retired_at.is_null()),
                    )
                    .set(stock_ledger::retired_at.eq(now))
                    .execute(conn)
                    .await?;

                    let target = stock_ledger::table.filter(stock_ledger::item_id.eq(item_id));
                    let updated = if has_confirmed {
                        diesel::update(target)
                            .set((
                                stock_ledger::is_rental_available.eq(false),
                                stock_ledger::updated_at.eq(now),
                            ))
                            .execute(conn)
                            .await?
                    } else {
                        diesel::update(target)
                            .set((
                                stock_ledger::is_active.eq(false),
                                stock_ledger::is_rental_available.eq(false),
                                stock_ledger::updated_at.eq(now),
                            ))
                            .execute(conn)
                            .await?
                    };

                    Ok(match (updated, has_confirmed) {
                        (0, _) => None,
                        (_, true) => Some(RetireOutcome::RentalSuspended),
                        (_, false) => Some(RetireOutcome::Deactivated),
                    })
                }
                .scope_boxed()
            })
            .await?;
        Ok(outcome)
    }

    async fn find_reservation(&self, reservation_id: &str) -> StoreResult<Option<Reservation>> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        let row = reservations::table
            .filter(reservations::reservation_id.eq(reservation_id))
            .select(ReservationRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        row.map(Reservation::try_from).transpose()
    }

    async fn reservations_for_customer(&self, customer_id: Uuid) -> StoreResult<Vec<Reservation>> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        let rows = reservations::table
            .filter(reservations::customer_id.eq(customer_id))
            .order(reservations::created_at.desc())
            .select(ReservationRow::as_select())
            .load(&mut conn)
            .await?;
        to_reservations(rows)
    }

    async fn reservations_for_item(&self, item_id: Uuid) -> StoreResult<Vec<Reservation>> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        let rows = reservations::table
            .filter(reservations::item_id.eq(item_id))
            .order(reservations::created_at.desc())
            .select(ReservationRow::as_select())
            .load(&mut conn)
            .await?;
        to_reservations(rows)
    }

    async fn overdue_reservations(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<Reservation>> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        let rows = reservations::table
            .filter(reservations::status.eq(ReservationStatus::Pending.as_str()))
            .filter(reservations::expires_at.le(now))
            .order(reservations::expires_at.asc())
            .limit(limit)
            .select(ReservationRow::as_select())
            .load(&mut conn)
            .await?;
        to_reservations(rows)
    }

    async fn insert_reservation(
        &self,
        reservation: &Reservation,
        expected_version: i64,
        receipt: Option<&CommandReceipt>,
    ) -> StoreResult<WriteOutcome> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        let row = ReservationRow::from(reservation);
        let result = conn
            .transaction::<_, TxError, _>(|conn| {
                async move {
                    let outcome = conditional_update(
                        conn,
                        row.item_id,
                        StockMutation::HoldPending(row.quantity),
                        Some(expected_version),
                        row.created_at,
                    )
                    .await?;
                    if !outcome.is_applied() {
                        return Err(TxError::Rejected(outcome));
                    }

                    diesel::insert_into(reservations::table)
                        .values(&row)
                        .execute(conn)
                        .await?;
                    if let Some(receipt) = receipt {
                        insert_receipt(conn, receipt, row.created_at).await?;
                    }
                    Ok(WriteOutcome::Applied)
                }
                .scope_boxed()
            })
            .await;
        settle(result)
    }

    async fn transition_reservation(&self, change: &ReservationChange) -> StoreResult<WriteOutcome> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        let row = ReservationRow::from(&change.next);
        let expected_status = change.expected_status.as_str();
        let expected_expires_at = change.expected_expires_at;
        let stock = change.stock;
        let receipt = change.receipt.as_ref();

        let result = conn
            .transaction::<_, TxError, _>(|conn| {
                async move {
                    let updated = diesel::update(
                        reservations::table
                            .filter(reservations::reservation_id.eq(&row.reservation_id))
                            .filter(reservations::status.eq(expected_status))
                            .filter(reservations::expires_at.eq(expected_expires_at)),
                    )
                    .set(&row)
                    .execute(conn)
                    .await?;
                    if updated == 0 {
                        return Err(TxError::Rejected(WriteOutcome::StatusMismatch));
                    }

                    if let Some(guarded) = stock {
                        let outcome = conditional_update(
                            conn,
                            row.item_id,
                            guarded.mutation,
                            Some(guarded.expected_version),
                            row.updated_at,
                        )
                        .await?;
                        if !outcome.is_applied() {
                            return Err(TxError::Rejected(outcome));
                        }
                    }
                    if let Some(receipt) = receipt {
                        insert_receipt(conn, receipt, row.updated_at).await?;
                    }
                    Ok(WriteOutcome::Applied)
                }
                .scope_boxed()
            })
            .await;
        settle(result)
    }

    async fn find_processed_command(&self, idempotency_key: &str) -> StoreResult<Option<serde_json::Value>> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        let processed = processed_commands::table
            .filter(processed_commands::idempotency_key.eq(idempotency_key))
            .first::<ProcessedCommand>(&mut conn)
            .await
            .optional()?;
        Ok(processed.and_then(|p| p.result))
    }

    async fn record_processed_command(
        &self,
        idempotency_key: &str,
        command_id: Uuid,
        reply: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        let processed = ProcessedCommand {
            idempotency_key: idempotency_key.to_string(),
            command_id,
            result: Some(reply.clone()),
            processed_at: Some(now),
        };

        diesel::insert_into(processed_commands::table)
            .values(&processed)
            .on_conflict(processed_commands::idempotency_key)
            .do_nothing()
            .execute(&mut conn)
            .await?;
        Ok(())
    }
}
