//! Worker接口定义
//!
//! Worker是应用代码实现的任务执行体。协调层在调度时读取它的选项
//! （队列、重试预算、唯一锁策略），在执行时调用 `perform`，并在批次树
//! 收敛时调用相应的回调。
//!
//! 除 `on_dead` 外，所有回调的失败都会被记录并吞掉，不会影响协调状态。

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::models::{BatchStatus, ConflictStrategy, ExecutionContext, Job, LockStrategy};
use crate::{RelayError, RelayResult};

/// Worker级别的选项，未设置的字段使用全局配置
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerOptions {
    pub queue: Option<String>,
    pub max_retries: Option<u32>,
    pub lock: LockStrategy,
    /// 同时作用于调度期和执行期的冲突策略
    pub on_conflict: Option<ConflictStrategy>,
    pub on_schedule_conflict: Option<ConflictStrategy>,
    pub on_execute_conflict: Option<ConflictStrategy>,
    pub lock_ttl: Option<Duration>,
    pub lock_per_batch: Option<bool>,
}

impl WorkerOptions {
    pub fn with_queue<S: Into<String>>(mut self, queue: S) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_lock(mut self, lock: LockStrategy) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_conflict(mut self, strategy: ConflictStrategy) -> Self {
        self.on_conflict = Some(strategy);
        self
    }

    pub fn with_schedule_conflict(mut self, strategy: ConflictStrategy) -> Self {
        self.on_schedule_conflict = Some(strategy);
        self
    }

    pub fn with_execute_conflict(mut self, strategy: ConflictStrategy) -> Self {
        self.on_execute_conflict = Some(strategy);
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = Some(ttl);
        self
    }

    pub fn with_lock_per_batch(mut self, enabled: bool) -> Self {
        self.lock_per_batch = Some(enabled);
        self
    }
}

#[async_trait]
pub trait Worker: Send + Sync {
    fn options(&self) -> WorkerOptions {
        WorkerOptions::default()
    }

    /// 参与唯一性指纹计算的参数，默认为全部参数
    fn unique_args(&self, args: &[Value]) -> Vec<Value> {
        args.to_vec()
    }

    async fn perform(&self, ctx: &mut ExecutionContext) -> RelayResult<()>;

    async fn on_error(&self, _job: &Job, _error: &RelayError) -> RelayResult<()> {
        Ok(())
    }

    /// 重试预算耗尽时调用，失败会被上报而不是吞掉
    async fn on_dead(&self, _job: &Job, _error: &RelayError) -> RelayResult<()> {
        Ok(())
    }

    /// 批次子树全部成功完成
    async fn on_batch_complete(&self, _job: &Job) -> RelayResult<()> {
        Ok(())
    }

    async fn on_child_complete(&self, _job: &Job, _child: &Job) -> RelayResult<()> {
        Ok(())
    }

    async fn on_child_error(&self, _job: &Job, _child: &Job) -> RelayResult<()> {
        Ok(())
    }

    async fn on_child_dead(&self, _job: &Job, _child: &Job) -> RelayResult<()> {
        Ok(())
    }

    /// 子树中任意节点到达终态
    async fn on_batch_node_complete(
        &self,
        _job: &Job,
        _node: &Job,
        _status: BatchStatus,
    ) -> RelayResult<()> {
        Ok(())
    }
}
