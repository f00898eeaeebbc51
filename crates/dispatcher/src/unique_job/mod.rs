//! 唯一任务锁
//!
//! 以 `{class, unique_args, unique_scope}` 的SHA-256指纹作为锁键，
//! 锁值为持有者的任务ID。释放前总是重新读取持有者（先比对再删除）。

mod conflict;
mod middleware;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use taskrelay_core::config::UniqueJobConfig;
use taskrelay_core::models::{ConflictStrategy, Job, LockStrategy};
use taskrelay_core::{
    store_key, KeyValueStore, RelayConfig, RelayError, RelayResult, StoreMutex, WorkerOptions,
    WorkerRegistry,
};
use tracing::{debug, info, warn};

pub use conflict::{on_execute_conflict, on_schedule_conflict};
pub use middleware::{UniqueJobClientMiddleware, UniqueJobServerMiddleware};

pub const UNIQUE_JOB_NAMESPACE: &str = "unique_job";

/// 计算唯一性指纹
pub fn fingerprint(class: &str, unique_args: &[Value], unique_scope: Option<&str>) -> String {
    let payload = json!({
        "class": class,
        "unique_args": unique_args,
        "unique_scope": unique_scope,
    });
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// 锁的持续时间：不短于配置值，并覆盖从现在到计划执行时间的间隔
pub fn lock_ttl_at(
    duration: Duration,
    time_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Duration {
    let start = time_at.map_or(now, |at| at.max(now));
    let gap = (start - now).to_std().unwrap_or_default();
    duration.max(gap + duration)
}

/// 唯一锁句柄的构造上下文，由客户端和服务端中间件共享
#[derive(Clone)]
pub struct UniqueJobLocks {
    store: Arc<dyn KeyValueStore>,
    mutex: StoreMutex,
    config: Arc<RelayConfig>,
    registry: Arc<WorkerRegistry>,
}

impl UniqueJobLocks {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        config: Arc<RelayConfig>,
        registry: Arc<WorkerRegistry>,
    ) -> Self {
        let mutex = StoreMutex::new(store.clone(), &config.store_lock);
        Self {
            store,
            mutex,
            config,
            registry,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// 按任务的Worker选项构建锁句柄，未注册的类使用默认选项（不加锁）
    pub fn for_job(&self, job: &Job) -> UniqueJob {
        let (options, unique_args) = match self.registry.get(&job.class) {
            Some(worker) => (worker.options(), worker.unique_args(&job.args)),
            None => (WorkerOptions::default(), job.args.clone()),
        };
        UniqueJob::new(
            self.store.clone(),
            self.mutex.clone(),
            job,
            &options,
            unique_args,
            &self.config.unique_job,
        )
    }
}

/// 单个任务的唯一锁句柄
pub struct UniqueJob {
    store: Arc<dyn KeyValueStore>,
    mutex: StoreMutex,
    job_id: String,
    unique_id: String,
    strategy: LockStrategy,
    on_schedule: ConflictStrategy,
    on_execute: ConflictStrategy,
    duration: Duration,
    provisional_duration: Duration,
}

impl UniqueJob {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        mutex: StoreMutex,
        job: &Job,
        options: &WorkerOptions,
        unique_args: Vec<Value>,
        config: &UniqueJobConfig,
    ) -> Self {
        let lock_per_batch = options.lock_per_batch.unwrap_or(config.lock_per_batch);
        let scope = if lock_per_batch {
            job.parent_batch_id()
        } else {
            None
        };
        let default_conflict = options
            .on_conflict
            .unwrap_or_else(|| config.default_conflict_strategy());
        let duration = options.lock_ttl.unwrap_or_else(|| config.lock_ttl());

        Self {
            store,
            mutex,
            job_id: job.id.clone(),
            unique_id: fingerprint(&job.class, &unique_args, scope),
            strategy: options.lock,
            on_schedule: options.on_schedule_conflict.unwrap_or(default_conflict),
            on_execute: options.on_execute_conflict.unwrap_or(default_conflict),
            duration,
            provisional_duration: config.provisional_lock_ttl().min(duration),
        }
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn strategy(&self) -> LockStrategy {
        self.strategy
    }

    pub fn on_schedule(&self) -> ConflictStrategy {
        self.on_schedule
    }

    pub fn on_execute(&self) -> ConflictStrategy {
        self.on_execute
    }

    pub fn lock_key(&self) -> String {
        store_key(&[UNIQUE_JOB_NAMESPACE, &self.unique_id])
    }

    pub fn provisional_ttl(&self) -> Duration {
        self.provisional_duration
    }

    pub fn lock_ttl(&self, time_at: Option<DateTime<Utc>>) -> Duration {
        lock_ttl_at(self.duration, time_at, Utc::now())
    }

    /// 当前持有者的任务ID
    pub async fn owner(&self) -> RelayResult<Option<String>> {
        Ok(self
            .store
            .get(&self.lock_key())
            .await?
            .and_then(|v| v.as_str().map(str::to_string)))
    }

    /// 获取锁或确认自己持有并刷新过期时间，被其他任务持有时返回锁冲突错误
    pub async fn lock(&self, ttl: Duration) -> RelayResult<()> {
        let key = self.lock_key();
        let key_ref = key.as_str();
        self.mutex
            .with_lock(&key, move || async move {
                let owner = self.owner().await?;
                if let Some(owner) = owner.filter(|o| o != &self.job_id) {
                    debug!("Unique lock {} held by {}", key_ref, owner);
                    return Err(RelayError::lock(self.unique_id.clone(), Some(owner)));
                }
                self.store
                    .set(key_ref, &Value::String(self.job_id.clone()), Some(ttl))
                    .await?;
                info!("获取唯一锁: {} -> 任务 {} ({:?})", key_ref, self.job_id, ttl);
                Ok(())
            })
            .await
    }

    /// 仅当自己持有时释放，否则不做任何事
    pub async fn unlock(&self) -> RelayResult<()> {
        let key = self.lock_key();
        let key_ref = key.as_str();
        self.mutex
            .with_lock(&key, move || async move {
                if self.owner().await?.as_deref() == Some(self.job_id.as_str()) {
                    self.store.delete(key_ref).await?;
                    info!("释放唯一锁: {} (任务 {})", key_ref, self.job_id);
                }
                Ok(())
            })
            .await
    }

    /// 两阶段加锁：先持有短期临时锁完成调度，再升级为完整时长的锁
    ///
    /// 升级失败只记录日志，因为调度已经成功；调度失败时释放临时锁。
    pub async fn lock_for_scheduling<F, Fut, T>(
        &self,
        time_at: Option<DateTime<Utc>>,
        schedule: F,
    ) -> RelayResult<T>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = RelayResult<T>> + Send,
        T: Send,
    {
        self.lock(self.provisional_duration).await?;

        match schedule().await {
            Ok(value) => {
                if let Err(e) = self.lock(self.lock_ttl(time_at)).await {
                    warn!(
                        "唯一锁升级失败: {} (任务 {}): {}",
                        self.lock_key(),
                        self.job_id,
                        e
                    );
                }
                Ok(value)
            }
            Err(e) => {
                self.release_quietly().await;
                Err(e)
            }
        }
    }

    pub(crate) async fn release_quietly(&self) {
        if let Err(e) = self.unlock().await {
            warn!("释放唯一锁失败: {} (任务 {}): {}", self.lock_key(), self.job_id, e);
        }
    }
}
