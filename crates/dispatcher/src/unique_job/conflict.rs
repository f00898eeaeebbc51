use std::time::Duration;

use taskrelay_core::models::{ConflictStrategy, ExecutionContext};
use taskrelay_core::{RelayError, RelayResult};
use tracing::info;

use crate::client::JobClient;

/// 调度期冲突；返回 `Ok` 时调度被抑制
///
/// 调度期没有可以重新入队的任务，`Reschedule` 与 `Reject` 相同。
pub fn on_schedule_conflict(strategy: ConflictStrategy, error: RelayError) -> RelayResult<()> {
    match strategy {
        ConflictStrategy::Raise => Err(error),
        ConflictStrategy::Reject | ConflictStrategy::Reschedule => {
            info!("调度冲突，丢弃任务: {}", error);
            Ok(())
        }
    }
}

/// 执行期冲突；返回 `Ok` 时本次执行被跳过
pub async fn on_execute_conflict(
    strategy: ConflictStrategy,
    error: RelayError,
    ctx: &mut ExecutionContext,
    client: &JobClient,
    delay: Duration,
) -> RelayResult<()> {
    match strategy {
        ConflictStrategy::Raise => Err(error),
        ConflictStrategy::Reject => {
            info!("执行冲突，丢弃任务 {}: {}", ctx.job.id, error);
            Ok(())
        }
        ConflictStrategy::Reschedule => {
            info!(
                "执行冲突，任务 {} 将在 {:?} 后重新入队: {}",
                ctx.job.id, delay, error
            );
            client.reenqueue(&mut ctx.job, delay).await?;
            Ok(())
        }
    }
}
