use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::info;

use super::CacheBackend;
use crate::error::CacheError;

/// Redis-backed cache. Values are stored with `SET EX`, so Redis owns expiry.
#[derive(Clone)]
pub struct RedisCache {
    conn_manager: ConnectionManager,
    prefix: String,
}

impl RedisCache {
    pub async fn connect(redis_url: &str, prefix: &str) -> Result<Self, CacheError> {
        let client = Client::open(redis_url)?;
        let conn_manager = ConnectionManager::new(client).await?;
        info!(redis_url, prefix, "Connected to Redis cache");
        Ok(Self {
            conn_manager,
            prefix: prefix.to_string(),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn_manager.clone();
        let value: Option<String> = conn.get(self.key(key)).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn_manager.clone();
        let seconds = ttl.as_secs().max(1);
        let _: () = conn.set_ex(self.key(key), value, seconds).await?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), CacheError> {
        let mut conn = self.conn_manager.clone();
        let keys: Vec<String> = keys.iter().map(|k| self.key(k)).collect();
        let _: () = conn.del(keys).await?;
        Ok(())
    }
}
