use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use taskrelay_core::models::{ExecutionContext, Job};
use taskrelay_core::{store_key, KeyValueStore, RelayResult};
use tracing::{debug, info};

use super::CronScheduleStore;
use crate::middleware::{Middleware, Next};
use crate::unique_job::UniqueJobLocks;

pub const CRON_JOB_NAMESPACE: &str = "cron_job";
pub const PROCESSING: &str = "processing";
/// 任务体已执行，只剩后继尚未分发
pub const PERFORMED: &str = "performed";

/// 定时实例守卫
///
/// 过期实例（不是计划最近分发的实例，也不是已开始处理的实例的重试）
/// 被直接跳过；有效实例执行完毕后分发下一个实例。
///
/// 后继与当前实例的唯一性指纹相同，分发前先释放当前实例持有的唯一锁。
/// 后继分发失败时标志保留为 `performed`，重试只补发后继，不再执行任务体。
pub struct CronGuardMiddleware {
    store: Arc<dyn KeyValueStore>,
    schedules: CronScheduleStore,
    locks: UniqueJobLocks,
    flag_ttl: Duration,
}

impl CronGuardMiddleware {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        schedules: CronScheduleStore,
        locks: UniqueJobLocks,
        flag_ttl: Duration,
    ) -> Self {
        Self {
            store,
            schedules,
            locks,
            flag_ttl,
        }
    }

    pub fn flag_key(job_id: &str) -> String {
        store_key(&[CRON_JOB_NAMESPACE, job_id])
    }

    async fn set_flag(&self, key: &str, value: &str) -> RelayResult<()> {
        self.store
            .set(key, &Value::String(value.to_string()), Some(self.flag_ttl))
            .await
    }

    async fn hand_over(&self, job: &Job) -> RelayResult<()> {
        self.locks.for_job(job).unlock().await?;
        self.schedules.dispatch_successor(job).await?;
        Ok(())
    }
}

#[async_trait]
impl Middleware<ExecutionContext> for CronGuardMiddleware {
    async fn call(
        &self,
        ctx: &mut ExecutionContext,
        next: Next<'_, ExecutionContext>,
    ) -> RelayResult<()> {
        let Some(schedule_id) = ctx.job.cron_schedule_id().map(str::to_string) else {
            return next.run(ctx).await;
        };

        let flag_key = Self::flag_key(&ctx.job.id);
        let flag = self.store.get(&flag_key).await?;
        let performed = flag.as_ref().and_then(Value::as_str) == Some(PERFORMED);
        let expected = flag.is_some()
            || self
                .schedules
                .find(&schedule_id)
                .await?
                .and_then(|s| s.job_id)
                .is_some_and(|id| id == ctx.job.id);

        if !expected {
            info!(
                "跳过过期的定时实例: {} (计划 {})",
                ctx.job.id, schedule_id
            );
            return Ok(());
        }

        let result = if performed {
            info!("定时实例 {} 已执行，补发后继", ctx.job.id);
            Ok(())
        } else {
            self.set_flag(&flag_key, PROCESSING).await?;
            let result = next.run(ctx).await;
            if let Err(e) = &result {
                if e.is_retryable() {
                    debug!("Cron instance {} failed, keeping processing flag", ctx.job.id);
                    return result;
                }
            }
            self.set_flag(&flag_key, PERFORMED).await?;
            result
        };

        self.hand_over(&ctx.job).await?;
        self.store.delete(&flag_key).await?;
        result
    }
}
