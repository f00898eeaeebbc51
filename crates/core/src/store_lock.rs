use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::StoreLockConfig;
use crate::traits::KeyValueStore;
use crate::{RelayError, RelayResult};

/// 基于键值存储的短时互斥锁
///
/// 通过带过期时间的 set-if-absent 获取 `<key>/lock`，在固定间隔上忙等，
/// 超过最长等待时间后报错。锁自带短TTL，持有者崩溃后可被回收。
#[derive(Clone)]
pub struct StoreMutex {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
    retry_interval: Duration,
    max_wait: Duration,
}

impl StoreMutex {
    pub fn new(store: Arc<dyn KeyValueStore>, config: &StoreLockConfig) -> Self {
        Self {
            store,
            ttl: config.ttl(),
            retry_interval: config.retry_interval(),
            max_wait: config.max_wait(),
        }
    }

    pub fn lock_key(key: &str) -> String {
        format!("{key}/lock")
    }

    /// 在持有 `key` 的互斥锁期间执行 `f`
    ///
    /// 无论 `f` 成功与否都会释放锁；释放前比对令牌，避免删除已过期后被他人获取的锁。
    pub async fn with_lock<F, Fut, T>(&self, key: &str, f: F) -> RelayResult<T>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = RelayResult<T>> + Send,
        T: Send,
    {
        let lock_key = Self::lock_key(key);
        let token = Value::String(Uuid::new_v4().to_string());
        self.acquire(&lock_key, &token).await?;

        let result = f().await;

        if let Err(e) = self.release(&lock_key, &token).await {
            warn!("Failed to release store lock {}: {}", lock_key, e);
        }
        result
    }

    async fn acquire(&self, lock_key: &str, token: &Value) -> RelayResult<()> {
        let deadline = Instant::now() + self.max_wait;
        loop {
            if self.store.set_nx(lock_key, token, self.ttl).await? {
                debug!("Acquired store lock {}", lock_key);
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(RelayError::store(format!(
                    "等待存储锁超时: {lock_key}"
                )));
            }
            tokio::time::sleep(self.retry_interval).await;
        }
    }

    async fn release(&self, lock_key: &str, token: &Value) -> RelayResult<()> {
        match self.store.get(lock_key).await? {
            Some(current) if &current == token => {
                self.store.delete(lock_key).await?;
                debug!("Released store lock {}", lock_key);
            }
            _ => warn!("Store lock {} expired before release", lock_key),
        }
        Ok(())
    }
}
