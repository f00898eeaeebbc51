use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use taskrelay_core::models::{Job, ScheduleContext, TaskRequest};
use taskrelay_core::{RelayConfig, RelayError, RelayResult, TaskBackend, WorkerRegistry};
use tracing::{debug, info};

use crate::middleware::{ClientChain, Endpoint};

/// 调度链末端：把任务包装为请求并交给投递后端
struct BackendEndpoint<'a> {
    backend: &'a dyn TaskBackend,
    config: &'a RelayConfig,
}

#[async_trait]
impl Endpoint<ScheduleContext> for BackendEndpoint<'_> {
    async fn call(&self, ctx: &mut ScheduleContext) -> RelayResult<()> {
        let request = TaskRequest::for_job(&ctx.job, ctx.time_at, self.config)?;
        let task_id = self.backend.schedule(request).await?;
        info!(
            "任务已提交: {} ({}) -> {}",
            ctx.job.id, ctx.job.class, task_id
        );
        ctx.task_id = Some(task_id);
        Ok(())
    }
}

/// 任务客户端
///
/// 所有调度都经过客户端中间件链；返回 `None` 表示调度被冲突策略抑制。
pub struct JobClient {
    config: Arc<RelayConfig>,
    backend: Arc<dyn TaskBackend>,
    registry: Arc<WorkerRegistry>,
    chain: ClientChain,
}

impl JobClient {
    pub fn new(
        config: Arc<RelayConfig>,
        backend: Arc<dyn TaskBackend>,
        registry: Arc<WorkerRegistry>,
        chain: ClientChain,
    ) -> Self {
        Self {
            config,
            backend,
            registry,
            chain,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn chain(&self) -> &ClientChain {
        &self.chain
    }

    /// 队列优先级：任务自身、Worker选项、全局默认
    fn resolve_queue(&self, job: &mut Job) {
        if job.queue.is_none() {
            let queue = self
                .registry
                .options(&job.class)
                .queue
                .unwrap_or_else(|| self.config.default_queue.clone());
            job.queue = Some(queue);
        }
    }

    fn endpoint(&self) -> BackendEndpoint<'_> {
        BackendEndpoint {
            backend: self.backend.as_ref(),
            config: &self.config,
        }
    }

    /// 立即投递
    pub async fn schedule(&self, job: Job) -> RelayResult<Option<String>> {
        self.dispatch(job, None).await
    }

    /// 延迟 `delay` 后投递
    pub async fn schedule_in(&self, job: Job, delay: Duration) -> RelayResult<Option<String>> {
        let delay = chrono::Duration::from_std(delay)
            .map_err(|e| RelayError::Internal(format!("无效的延迟: {e}")))?;
        self.dispatch(job, Some(Utc::now() + delay)).await
    }

    /// 在指定时间投递
    pub async fn schedule_at(
        &self,
        job: Job,
        time_at: DateTime<Utc>,
    ) -> RelayResult<Option<String>> {
        self.dispatch(job, Some(time_at)).await
    }

    async fn dispatch(
        &self,
        mut job: Job,
        time_at: Option<DateTime<Utc>>,
    ) -> RelayResult<Option<String>> {
        self.resolve_queue(&mut job);
        debug!("Scheduling job {} ({})", job.id, job.class);

        let mut ctx = ScheduleContext::new(job, time_at);
        self.chain.invoke(&mut ctx, &self.endpoint()).await?;

        if ctx.is_suppressed() {
            info!("任务调度被抑制: {} ({})", ctx.job.id, ctx.job.class);
        }
        Ok(ctx.task_id)
    }

    /// 延迟后以相同ID重新投递，不经过客户端中间件链
    ///
    /// 调用后任务被标记为已重新入队，当前执行的批次后处理会被跳过。
    pub async fn reenqueue(&self, job: &mut Job, delay: Duration) -> RelayResult<String> {
        job.reenqueued = true;
        self.resolve_queue(job);

        let delay = chrono::Duration::from_std(delay)
            .map_err(|e| RelayError::Internal(format!("无效的延迟: {e}")))?;
        let mut ctx = ScheduleContext::new(job.clone(), Some(Utc::now() + delay));
        self.endpoint().call(&mut ctx).await?;

        info!("任务已重新入队: {} ({})", job.id, job.class);
        ctx.task_id
            .ok_or_else(|| RelayError::backend("投递后端未返回任务ID"))
    }

    /// 撤销尚未投递的任务
    pub async fn delete_task(&self, task_id: &str) -> RelayResult<bool> {
        let deleted = self.backend.delete(task_id).await?;
        debug!("Delete task {}: {}", task_id, deleted);
        Ok(deleted)
    }
}
