//! 协调层配置
//!
//! 配置在启动时构建一次，之后以 `Arc<RelayConfig>` 的形式注入各个子系统，
//! 运行期间不可变。

pub mod loader;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::logging::LoggingConfig;
use crate::models::ConflictStrategy;

pub use loader::ConfigLoader;

/// 顶层配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// 存储键命名空间
    pub namespace: String,
    /// 投递后端回调的处理端点
    pub processor_url: String,
    /// 请求签名密钥
    pub secret: String,
    /// 默认队列名
    pub default_queue: String,
    /// 默认最大重试次数
    pub max_retries: u32,
    /// 单次投递的处理时限（秒）
    pub dispatch_deadline_secs: u64,
    pub unique_job: UniqueJobConfig,
    pub store_lock: StoreLockConfig,
    pub cron: CronConfig,
    pub redis: RedisConfig,
    pub logging: LoggingConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            namespace: "taskrelay".to_string(),
            processor_url: "http://localhost:3000/taskrelay/run".to_string(),
            secret: "change-me".to_string(),
            default_queue: "default".to_string(),
            max_retries: 25,
            dispatch_deadline_secs: 600,
            unique_job: UniqueJobConfig::default(),
            store_lock: StoreLockConfig::default(),
            cron: CronConfig::default(),
            redis: RedisConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl RelayConfig {
    pub fn dispatch_deadline(&self) -> Duration {
        Duration::from_secs(self.dispatch_deadline_secs)
    }
}

/// 唯一任务锁配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UniqueJobConfig {
    /// 锁的默认持续时间（秒）
    pub lock_ttl_secs: u64,
    /// 两阶段加锁时临时锁的持续时间（秒）
    pub provisional_lock_ttl_secs: u64,
    /// 默认冲突策略名称
    pub on_conflict: String,
    /// 是否按父批次隔离唯一性
    pub lock_per_batch: bool,
    /// Reschedule策略的重新入队延迟（秒）
    pub reschedule_delay_secs: u64,
}

impl Default for UniqueJobConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: 600,
            provisional_lock_ttl_secs: 60,
            on_conflict: "reject".to_string(),
            lock_per_batch: false,
            reschedule_delay_secs: 5,
        }
    }
}

impl UniqueJobConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }
    pub fn provisional_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.provisional_lock_ttl_secs)
    }
    pub fn reschedule_delay(&self) -> Duration {
        Duration::from_secs(self.reschedule_delay_secs)
    }
    pub fn default_conflict_strategy(&self) -> ConflictStrategy {
        ConflictStrategy::from_name(&self.on_conflict)
    }
}

/// 存储互斥锁配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreLockConfig {
    pub ttl_ms: u64,
    pub retry_interval_ms: u64,
    pub max_wait_ms: u64,
}

impl Default for StoreLockConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 2000,
            retry_interval_ms: 10,
            max_wait_ms: 5000,
        }
    }
}

impl StoreLockConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

/// 定时任务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CronConfig {
    /// 实例处理标记的过期时间（秒）
    pub flag_ttl_secs: u64,
    /// 启动时同步的定时计划
    pub schedules: Vec<CronScheduleConfig>,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            flag_ttl_secs: 7 * 24 * 3600,
            schedules: Vec::new(),
        }
    }
}

impl CronConfig {
    pub fn flag_ttl(&self) -> Duration {
        Duration::from_secs(self.flag_ttl_secs)
    }
}

/// 单个定时计划的声明
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronScheduleConfig {
    pub id: String,
    pub cron: String,
    pub worker: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub tz: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}
