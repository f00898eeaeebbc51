use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::RelayResult;

/// 共享键值存储抽象
///
/// 这是所有进程之间唯一的同步点。键为 `/` 分隔的UTF-8字符串，值为JSON。
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// 读取键，不存在或已过期时返回 `None`
    async fn get(&self, key: &str) -> RelayResult<Option<Value>>;

    /// 写入键，`ttl` 为 `None` 时永不过期
    async fn set(&self, key: &str, value: &Value, ttl: Option<Duration>) -> RelayResult<()>;

    /// 仅当键不存在时写入并设置过期时间，返回是否写入成功
    async fn set_nx(&self, key: &str, value: &Value, ttl: Duration) -> RelayResult<bool>;

    /// 删除键，返回键是否存在
    async fn delete(&self, key: &str) -> RelayResult<bool>;

    /// 按模式列出键，`*` 匹配任意字符序列
    async fn scan(&self, pattern: &str) -> RelayResult<Vec<String>>;
}

/// 带类型的读写辅助方法
#[async_trait]
pub trait KeyValueStoreExt: KeyValueStore {
    async fn get_as<T: DeserializeOwned>(&self, key: &str) -> RelayResult<Option<T>> {
        match self.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn set_as<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> RelayResult<()> {
        let value = serde_json::to_value(value)?;
        self.set(key, &value, ttl).await
    }
}

impl<S: KeyValueStore + ?Sized> KeyValueStoreExt for S {}

/// 拼接 `/` 分隔的存储键
pub fn store_key(parts: &[&str]) -> String {
    parts.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_key() {
        assert_eq!(store_key(&["unique_job", "abc"]), "unique_job/abc");
        assert_eq!(store_key(&["batch_job", "state", "j-1"]), "batch_job/state/j-1");
    }
}
