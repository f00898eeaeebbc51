use std::sync::Arc;

use async_trait::async_trait;
use taskrelay_core::models::{ExecutionContext, LockStrategy, ScheduleContext};
use taskrelay_core::RelayResult;
use tracing::debug;

use super::{on_execute_conflict, on_schedule_conflict, UniqueJob, UniqueJobLocks};
use crate::client::JobClient;
use crate::middleware::{Middleware, Next};

/// 调度期加锁
pub struct UniqueJobClientMiddleware {
    locks: UniqueJobLocks,
}

impl UniqueJobClientMiddleware {
    pub fn new(locks: UniqueJobLocks) -> Self {
        Self { locks }
    }
}

#[async_trait]
impl Middleware<ScheduleContext> for UniqueJobClientMiddleware {
    async fn call(
        &self,
        ctx: &mut ScheduleContext,
        next: Next<'_, ScheduleContext>,
    ) -> RelayResult<()> {
        let unique = self.locks.for_job(&ctx.job);
        let time_at = ctx.time_at;

        match unique.strategy() {
            LockStrategy::NoOp | LockStrategy::WhileExecuting => next.run(ctx).await,
            LockStrategy::UntilExecuted => {
                // 冲突直接上抛，不经过冲突策略
                unique.lock(unique.lock_ttl(time_at)).await?;
                let result = next.run(ctx).await;
                if result.is_err() || ctx.is_suppressed() {
                    unique.release_quietly().await;
                }
                result
            }
            LockStrategy::UntilExecuting | LockStrategy::UntilCompleted => {
                let scheduled = {
                    let ctx = &mut *ctx;
                    unique
                        .lock_for_scheduling(time_at, move || next.run(ctx))
                        .await
                };
                match scheduled {
                    Err(e) if e.is_lock_error() => on_schedule_conflict(unique.on_schedule(), e),
                    other => other,
                }
            }
        }
    }
}

/// 执行期加锁与释放
pub struct UniqueJobServerMiddleware {
    locks: UniqueJobLocks,
    client: Arc<JobClient>,
}

impl UniqueJobServerMiddleware {
    pub fn new(locks: UniqueJobLocks, client: Arc<JobClient>) -> Self {
        Self { locks, client }
    }

    /// 执行前获取锁；返回 `false` 表示冲突已由冲突策略处理，不再执行
    async fn acquire(&self, unique: &UniqueJob, ctx: &mut ExecutionContext) -> RelayResult<bool> {
        match unique.lock(unique.lock_ttl(None)).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_lock_error() => {
                let delay = self.locks.config().unique_job.reschedule_delay();
                on_execute_conflict(unique.on_execute(), e, ctx, &self.client, delay).await?;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Middleware<ExecutionContext> for UniqueJobServerMiddleware {
    async fn call(
        &self,
        ctx: &mut ExecutionContext,
        next: Next<'_, ExecutionContext>,
    ) -> RelayResult<()> {
        let unique = self.locks.for_job(&ctx.job);

        match unique.strategy() {
            LockStrategy::NoOp => next.run(ctx).await,
            LockStrategy::UntilExecuted => {
                let result = next.run(ctx).await;
                unique.release_quietly().await;
                result
            }
            LockStrategy::UntilExecuting => {
                unique.unlock().await?;
                next.run(ctx).await
            }
            LockStrategy::WhileExecuting => {
                if !self.acquire(&unique, ctx).await? {
                    return Ok(());
                }
                let result = next.run(ctx).await;
                unique.release_quietly().await;
                result
            }
            LockStrategy::UntilCompleted => {
                if !self.acquire(&unique, ctx).await? {
                    return Ok(());
                }
                let result = next.run(ctx).await;
                match &result {
                    Err(e) if e.is_retryable() => {
                        debug!("Keeping unique lock {} for retry", unique.lock_key());
                    }
                    _ => unique.release_quietly().await,
                }
                result
            }
        }
    }
}
