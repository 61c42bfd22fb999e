use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use diesel::{Connection, PgConnection};
use diesel_async::pooled_connection::bb8::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;
use diesel_migrations::MigrationHarness;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::FutureProducer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use inventory_service::cache::{CacheBackend, ReadThroughCache, RedisCache};
use inventory_service::catalog::CatalogIngestor;
use inventory_service::clock::{Clock, SystemClock};
use inventory_service::config::Args;
use inventory_service::events::{EventPublisher, KafkaSink, MessageSink};
use inventory_service::handlers::CommandHandler;
use inventory_service::ledger::StockLedger;
use inventory_service::reaper::ExpirationReaper;
use inventory_service::reservations::ReservationOrchestrator;
use inventory_service::service::InventoryService;
use inventory_service::store::{InventoryStore, PgInventoryStore, MIGRATIONS};

fn consumer(args: &Args, group_id: &str) -> Result<StreamConsumer> {
    let consumer = ClientConfig::new()
        .set("group.id", group_id)
        .set("bootstrap.servers", &args.kafka_brokers)
        .set("enable.partition.eof", "false")
        .set("session.timeout.ms", "6000")
        .set("enable.auto.commit", "false")
        .create()?;
    Ok(consumer)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    info!("Running database migrations...");
    let mut conn = PgConnection::establish(&args.database_url)?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow::anyhow!("Migration error: {}", e))?;
    info!("Migrations completed successfully");

    let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(&args.database_url);
    let pool = Pool::builder().max_size(args.db_pool_size).build(config).await?;
    let store: Arc<dyn InventoryStore> = Arc::new(PgInventoryStore::new(pool));

    let cache = match &args.redis_url {
        Some(url) => match RedisCache::connect(url, &args.cache_key_prefix).await {
            Ok(redis) => {
                let backend: Arc<dyn CacheBackend> = Arc::new(redis);
                ReadThroughCache::new(backend, args.cache_policy())
            }
            Err(e) => {
                warn!("Redis unavailable, running without cache: {}", e);
                ReadThroughCache::disabled()
            }
        },
        None => {
            info!("No REDIS_URL configured, running without cache");
            ReadThroughCache::disabled()
        }
    };

    let producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", &args.kafka_brokers)
        .set("message.timeout.ms", "5000")
        .create()?;
    let sink: Arc<dyn MessageSink> = Arc::new(KafkaSink::new(producer));

    let catalog_consumer = consumer(&args, &format!("{}-catalog", args.consumer_group))?;
    let command_consumer = consumer(&args, &args.consumer_group)?;
    catalog_consumer.subscribe(&[&args.catalog_topic])?;
    command_consumer.subscribe(&[&args.command_topic])?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let publisher = EventPublisher::new(sink.clone(), args.reservation_topic.clone());
    let ledger = StockLedger::new(store.clone(), clock.clone(), args.retry_policy());

    let orchestrator = Arc::new(ReservationOrchestrator::new(
        store.clone(),
        cache.clone(),
        publisher,
        clock.clone(),
        args.reservation_settings(),
    ));
    let service = Arc::new(InventoryService::new(store.clone(), ledger, cache.clone(), clock.clone()));
    let ingestor = CatalogIngestor::new(store.clone(), cache.clone(), clock.clone());
    let command_handler = CommandHandler::new(
        orchestrator.clone(),
        service,
        store,
        sink,
        clock,
        args.reply_topic.clone(),
    );

    let catalog_task = tokio::spawn(async move {
        ingestor.run(catalog_consumer).await;
    });

    let command_task = tokio::spawn(async move {
        command_handler.run(command_consumer).await;
    });

    let reaper = ExpirationReaper::new(orchestrator, args.reaper_settings()).spawn();

    info!(
        catalog_topic = %args.catalog_topic,
        command_topic = %args.command_topic,
        "Inventory service started"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down inventory service");

    reaper.shutdown().await;
    catalog_task.abort();
    command_task.abort();

    Ok(())
}
