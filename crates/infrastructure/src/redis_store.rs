//! Redis key-value store implementation

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde_json::Value;
use taskrelay_core::config::RedisConfig;
use taskrelay_core::{KeyValueStore, RelayError, RelayResult};
use tracing::{debug, error, info, instrument};

const SCAN_BATCH: usize = 100;

/// Redis backed store shared by every process of a deployment
///
/// Values are stored as JSON strings under `<namespace>/<key>`.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    namespace: String,
}

fn store_error(op: &str, key: &str, e: redis::RedisError) -> RelayError {
    error!("Store {} failed for key {}: {}", op, key, e);
    RelayError::store(e.to_string())
}

impl RedisStore {
    pub async fn connect(config: &RedisConfig, namespace: &str) -> RelayResult<Self> {
        info!("Creating Redis store with URL: {}", config.url);

        let client =
            redis::Client::open(config.url.as_str()).map_err(|e| RelayError::store(e.to_string()))?;
        let mut conn = client
            .get_connection_manager()
            .await
            .map_err(|e| RelayError::store(e.to_string()))?;

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| RelayError::store(e.to_string()))?;

        info!("Redis store connected");
        Ok(Self {
            conn,
            namespace: namespace.to_string(),
        })
    }

    fn build_key(&self, key: &str) -> String {
        if self.namespace.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.namespace, key)
        }
    }

    fn strip_key(&self, full_key: String) -> String {
        if self.namespace.is_empty() {
            return full_key;
        }
        let prefix = format!("{}/", self.namespace);
        match full_key.strip_prefix(&prefix) {
            Some(key) => key.to_string(),
            None => full_key,
        }
    }

    fn ttl_millis(ttl: Duration) -> u64 {
        (ttl.as_millis() as u64).max(1)
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> RelayResult<Option<Value>> {
        let full_key = self.build_key(key);
        let mut conn = self.conn.clone();

        let raw: Option<String> = redis::cmd("GET")
            .arg(&full_key)
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("GET", &full_key, e))?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => {
                debug!("Store MISS: {}", full_key);
                Ok(None)
            }
        }
    }

    #[instrument(skip(self, value))]
    async fn set(&self, key: &str, value: &Value, ttl: Option<Duration>) -> RelayResult<()> {
        let full_key = self.build_key(key);
        let payload = serde_json::to_string(value)?;
        let mut conn = self.conn.clone();

        let mut cmd = redis::cmd("SET");
        cmd.arg(&full_key).arg(payload);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(Self::ttl_millis(ttl));
        }
        let _: () = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("SET", &full_key, e))?;

        debug!("Store SET success: {}", full_key);
        Ok(())
    }

    #[instrument(skip(self, value))]
    async fn set_nx(&self, key: &str, value: &Value, ttl: Duration) -> RelayResult<bool> {
        let full_key = self.build_key(key);
        let payload = serde_json::to_string(value)?;
        let mut conn = self.conn.clone();

        let reply: Option<String> = redis::cmd("SET")
            .arg(&full_key)
            .arg(payload)
            .arg("PX")
            .arg(Self::ttl_millis(ttl))
            .arg("NX")
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("SETNX", &full_key, e))?;

        Ok(reply.is_some())
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> RelayResult<bool> {
        let full_key = self.build_key(key);
        let mut conn = self.conn.clone();

        let removed: i64 = redis::cmd("DEL")
            .arg(&full_key)
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("DEL", &full_key, e))?;

        Ok(removed > 0)
    }

    #[instrument(skip(self))]
    async fn scan(&self, pattern: &str) -> RelayResult<Vec<String>> {
        let full_pattern = self.build_key(pattern);
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&full_pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(|e| store_error("SCAN", &full_pattern, e))?;

            keys.extend(batch.into_iter().map(|k| self.strip_key(k)));
            if next == 0 {
                break;
            }
            cursor = next;
        }

        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}
