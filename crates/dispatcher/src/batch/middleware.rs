use std::sync::Arc;

use async_trait::async_trait;
use taskrelay_core::models::{BatchStatus, ExecutionContext, Job};
use taskrelay_core::RelayResult;
use tracing::{debug, info, warn};

use super::BatchTracker;
use crate::client::JobClient;
use crate::middleware::{Middleware, Next};

/// 服务端批次中间件，包裹整个执行过程
pub struct BatchMiddleware {
    tracker: BatchTracker,
    client: Arc<JobClient>,
}

impl BatchMiddleware {
    pub fn new(tracker: BatchTracker, client: Arc<JobClient>) -> Self {
        Self { tracker, client }
    }

    /// 持久化节点并分发暂存的子任务，返回是否有子任务被分发
    async fn setup(&self, ctx: &mut ExecutionContext) -> RelayResult<bool> {
        let children = ctx.take_children();
        if children.is_empty() {
            return Ok(false);
        }

        let child_ids: Vec<String> = children.iter().map(|c| c.id.clone()).collect();
        self.tracker.save(&ctx.job).await?;
        self.tracker.register_children(&ctx.job.id, &child_ids).await?;
        self.tracker.save_pending(&ctx.job.id, &children).await?;

        let dispatched = self.dispatch_children(&ctx.job, children).await?;
        Ok(dispatched > 0)
    }

    /// 逐个分发已登记的子任务，返回成功分发的数量
    ///
    /// 分发失败时剩余子任务仍保持 scheduled 并写回待分发列表，
    /// 节点重新投递时由 [`Self::resume`] 继续分发，不会重新执行任务体。
    async fn dispatch_children(&self, parent: &Job, children: Vec<Job>) -> RelayResult<usize> {
        let total = children.len();
        let mut dispatched = 0usize;

        for (index, child) in children.iter().enumerate() {
            let scheduled = match self.client.schedule(child.clone()).await {
                Ok(scheduled) => scheduled,
                Err(e) => {
                    warn!(
                        "批次 {} 的子任务 {} 分发失败，剩余 {} 个待重试: {}",
                        parent.id,
                        child.id,
                        total - index,
                        e
                    );
                    self.tracker.save_pending(&parent.id, &children[index..]).await?;
                    return Err(e);
                }
            };
            if scheduled.is_some() {
                dispatched += 1;
                continue;
            }

            // 调度被冲突策略抑制的子任务不参与收敛
            let update = self.tracker.remove_child(&parent.id, &child.id).await?;
            if update.resolved_now {
                self.tracker
                    .on_complete(parent.clone(), update.resolved_status())
                    .await?;
            }
        }

        self.tracker.clear_pending(&parent.id).await?;
        info!("批次 {} 已分发 {}/{} 个子任务", parent.id, dispatched, total);
        Ok(dispatched)
    }

    /// 继续上一次投递中断的子任务分发
    async fn resume(&self, ctx: &ExecutionContext, pending: Vec<Job>) -> RelayResult<()> {
        info!(
            "任务 {} 的子任务分发未完成，继续分发 {} 个",
            ctx.job.id,
            pending.len()
        );
        self.dispatch_children(&ctx.job, pending).await?;

        // 子任务全部被抑制且没有更早分发的子任务时，由本节点自行完成
        match self.tracker.state(&ctx.job.id).await? {
            Some(state) if state.is_empty() => {
                self.tracker.complete(&ctx.job, BatchStatus::Completed).await
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Middleware<ExecutionContext> for BatchMiddleware {
    async fn call(
        &self,
        ctx: &mut ExecutionContext,
        next: Next<'_, ExecutionContext>,
    ) -> RelayResult<()> {
        if let Some(parent_id) = ctx.job.parent_batch_id().map(str::to_string) {
            self.tracker
                .update_state(&parent_id, &ctx.job.id, BatchStatus::Processing)
                .await?;
        }

        if let Some(pending) = self.tracker.pending_children(&ctx.job.id).await? {
            return self.resume(ctx, pending).await;
        }

        match next.run(ctx).await {
            Ok(()) => {
                if self.setup(ctx).await? {
                    debug!("Job {} waits for its children", ctx.job.id);
                    return Ok(());
                }
                self.tracker.complete(&ctx.job, BatchStatus::Completed).await
            }
            Err(e) => {
                let discarded = ctx.take_children();
                if !discarded.is_empty() {
                    debug!(
                        "Discarding {} staged children of failed job {}",
                        discarded.len(),
                        ctx.job.id
                    );
                }

                let status = if e.is_dead() {
                    BatchStatus::Dead
                } else {
                    BatchStatus::Errored
                };
                if let Err(ce) = self.tracker.complete(&ctx.job, status).await {
                    warn!("批次完成处理失败 (任务 {}): {}", ctx.job.id, ce);
                }
                Err(e)
            }
        }
    }
}
