use std::sync::Arc;

use async_trait::async_trait;
use taskrelay_core::models::{ExecutionContext, Job};
use taskrelay_core::{RelayConfig, RelayError, RelayResult, Worker, WorkerRegistry};
use taskrelay_dispatcher::{Endpoint, JobClient, ServerChain};
use tracing::{error, info, warn};

/// 一次执行请求的结果，对应处理端点的HTTP状态
#[derive(Debug)]
pub enum ExecutionOutcome {
    Success,
    /// 无法解码或无法解析Worker，不重试
    Malformed(String),
    /// 临时失败，由投递后端重试
    Failed(RelayError),
    /// 重试预算耗尽或被声明为死亡，不重试
    Dead(RelayError),
}

impl ExecutionOutcome {
    pub fn status_code(&self) -> u16 {
        match self {
            ExecutionOutcome::Success => 204,
            ExecutionOutcome::Malformed(_) => 404,
            ExecutionOutcome::Failed(_) => 422,
            ExecutionOutcome::Dead(_) => 205,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecutionOutcome::Failed(_))
    }
}

/// 执行链末端：调用 `perform` 并应用重试预算
struct PerformEndpoint<'a> {
    worker: Arc<dyn Worker>,
    client: &'a JobClient,
    max_retries: u32,
}

impl PerformEndpoint<'_> {
    /// 死亡回调失败时记录并附加到返回的错误上
    async fn declare_dead(&self, job: &Job, cause: &RelayError, message: String) -> RelayError {
        match self.worker.on_dead(job, cause).await {
            Ok(()) => RelayError::dead(message),
            Err(hook_err) => {
                error!("on_dead 回调失败 (任务 {}): {}", job.id, hook_err);
                RelayError::dead(format!("{message}; on_dead 回调失败: {hook_err}"))
            }
        }
    }
}

#[async_trait]
impl Endpoint<ExecutionContext> for PerformEndpoint<'_> {
    async fn call(&self, ctx: &mut ExecutionContext) -> RelayResult<()> {
        info!(
            "开始执行任务: {} ({}), 重试次数 {}",
            ctx.job.id,
            ctx.job.class,
            ctx.retries()
        );

        match self.worker.perform(ctx).await {
            Ok(()) => {
                if let Some(delay) = ctx.take_reenqueue() {
                    self.client.reenqueue(&mut ctx.job, delay).await?;
                }
                info!("任务执行完成: {} ({})", ctx.job.id, ctx.job.class);
                Ok(())
            }
            Err(e) if e.is_dead() => {
                warn!("任务被声明为死亡: {} ({}): {}", ctx.job.id, ctx.job.class, e);
                Err(self.declare_dead(&ctx.job, &e, e.to_string()).await)
            }
            Err(e) => {
                warn!("任务执行失败: {} ({}): {}", ctx.job.id, ctx.job.class, e);
                if let Err(hook_err) = self.worker.on_error(&ctx.job, &e).await {
                    warn!("on_error 回调失败 (任务 {}): {}", ctx.job.id, hook_err);
                }

                if ctx.retries() >= self.max_retries {
                    let message = format!(
                        "重试次数耗尽 ({}/{}): {}",
                        ctx.retries(),
                        self.max_retries,
                        e
                    );
                    return Err(self.declare_dead(&ctx.job, &e, message).await);
                }
                Err(e)
            }
        }
    }
}

/// 执行入口
///
/// 解码任务、解析Worker、在服务端中间件链中执行，并把结果映射为执行结果。
pub struct Processor {
    config: Arc<RelayConfig>,
    registry: Arc<WorkerRegistry>,
    client: Arc<JobClient>,
    chain: ServerChain,
}

impl Processor {
    pub fn new(
        config: Arc<RelayConfig>,
        registry: Arc<WorkerRegistry>,
        client: Arc<JobClient>,
        chain: ServerChain,
    ) -> Self {
        Self {
            config,
            registry,
            client,
            chain,
        }
    }

    pub fn chain(&self) -> &ServerChain {
        &self.chain
    }

    /// 处理原始JSON请求体
    pub async fn process(
        &self,
        body: &str,
        retries: u32,
        task_id: Option<String>,
    ) -> ExecutionOutcome {
        match Job::from_json(body) {
            Ok(job) => self.execute(job, retries, task_id).await,
            Err(e) => {
                warn!("无法解码任务请求体: {}", e);
                ExecutionOutcome::Malformed(e.to_string())
            }
        }
    }

    /// 执行已解码的任务
    pub async fn execute(
        &self,
        mut job: Job,
        retries: u32,
        task_id: Option<String>,
    ) -> ExecutionOutcome {
        job.job_retries = retries;

        let worker = match self.registry.resolve(&job.class) {
            Ok(worker) => worker,
            Err(e) => {
                warn!("任务 {} 无法执行: {}", job.id, e);
                return ExecutionOutcome::Malformed(e.to_string());
            }
        };

        let endpoint = PerformEndpoint {
            max_retries: worker
                .options()
                .max_retries
                .unwrap_or(self.config.max_retries),
            worker,
            client: &self.client,
        };

        let mut ctx = ExecutionContext::new(job, task_id);
        match self.chain.invoke(&mut ctx, &endpoint).await {
            Ok(()) => ExecutionOutcome::Success,
            Err(e) if e.is_dead() => ExecutionOutcome::Dead(e),
            Err(RelayError::InvalidWorker(msg)) => ExecutionOutcome::Malformed(msg),
            Err(e) => ExecutionOutcome::Failed(e),
        }
    }
}
