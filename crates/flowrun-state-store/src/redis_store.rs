//! Redis-backed state store
//!
//! Shared by every replica pointed at the same Redis, which makes waiting
//! state and run snapshots resumable from any process.

use crate::error::{Result, StoreError};
use crate::metrics::{record_store_error, update_redis_status, OperationTimer};
use crate::state_store::{scoped_key, StateStore};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde_json::Value;
use std::time::Duration;
use tracing::info;

const BACKEND: &str = "redis";

#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = match client.get_multiplexed_async_connection().await {
            Ok(conn) => conn,
            Err(e) => {
                update_redis_status(false);
                return Err(e.into());
            }
        };
        update_redis_status(true);
        info!("Connected to Redis state store");
        Ok(Self { conn })
    }

    fn observe<T>(operation: &'static str, result: redis::RedisResult<T>) -> Result<T> {
        result.map_err(|e| {
            record_store_error(operation, BACKEND, "redis");
            if e.is_io_error() || e.is_connection_dropped() {
                update_redis_status(false);
            }
            StoreError::from(e)
        })
    }
}

#[async_trait]
impl StateStore for RedisStore {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: &Value,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let _timer = OperationTimer::new("set", BACKEND);
        let payload = serde_json::to_string(value)?;
        let mut conn = self.conn.clone();
        let full_key = scoped_key(namespace, key);
        let result: redis::RedisResult<()> = match ttl {
            Some(ttl) => conn.set_ex(full_key, payload, ttl.as_secs().max(1)).await,
            None => conn.set(full_key, payload).await,
        };
        Self::observe("set", result)
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        let _timer = OperationTimer::new("get", BACKEND);
        let mut conn = self.conn.clone();
        let raw: Option<String> = Self::observe("get", conn.get(scoped_key(namespace, key)).await)?;
        Ok(raw.map(|s| serde_json::from_str(&s)).transpose()?)
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        let _timer = OperationTimer::new("delete", BACKEND);
        let mut conn = self.conn.clone();
        let removed: i64 = Self::observe("delete", conn.del(scoped_key(namespace, key)).await)?;
        Ok(removed > 0)
    }

    async fn exists(&self, namespace: &str, key: &str) -> Result<bool> {
        let _timer = OperationTimer::new("exists", BACKEND);
        let mut conn = self.conn.clone();
        Self::observe("exists", conn.exists(scoped_key(namespace, key)).await)
    }

    async fn keys(&self, namespace: &str, pattern: &str) -> Result<Vec<String>> {
        let _timer = OperationTimer::new("keys", BACKEND);
        let mut conn = self.conn.clone();
        let prefix = scoped_key(namespace, "");
        let found: Vec<String> =
            Self::observe("keys", conn.keys(format!("{}{}", prefix, pattern)).await)?;
        let mut keys: Vec<String> = found
            .into_iter()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn take(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        let _timer = OperationTimer::new("take", BACKEND);
        let mut conn = self.conn.clone();
        let raw: Option<String> = Self::observe(
            "take",
            redis::cmd("GETDEL")
                .arg(scoped_key(namespace, key))
                .query_async(&mut conn)
                .await,
        )?;
        Ok(raw.map(|s| serde_json::from_str(&s)).transpose()?)
    }
}
