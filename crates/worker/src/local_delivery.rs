use std::sync::Arc;

use chrono::{DateTime, Utc};
use taskrelay_core::models::verify_signature;
use taskrelay_core::RelayConfig;
use taskrelay_infrastructure::{InMemoryTaskQueue, StoredTask};
use tracing::{debug, info, warn};

use crate::processor::{ExecutionOutcome, Processor};

/// 单次排空的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub passes: usize,
    pub delivered: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub dead: usize,
    pub malformed: usize,
}

impl DeliveryReport {
    fn record(&mut self, outcome: &ExecutionOutcome) {
        self.delivered += 1;
        match outcome {
            ExecutionOutcome::Success => self.succeeded += 1,
            ExecutionOutcome::Failed(_) => self.failed += 1,
            ExecutionOutcome::Dead(_) => self.dead += 1,
            ExecutionOutcome::Malformed(_) => self.malformed += 1,
        }
    }
}

/// 进程内投递
///
/// 代替托管任务服务重放内存队列中的请求：校验签名、交给处理器执行，
/// 可重试的失败以递增的重试次数放回队列。
pub struct LocalDelivery {
    queue: Arc<InMemoryTaskQueue>,
    processor: Arc<Processor>,
    secret: String,
    max_passes: usize,
}

impl LocalDelivery {
    pub fn new(queue: Arc<InMemoryTaskQueue>, processor: Arc<Processor>, config: &RelayConfig) -> Self {
        Self {
            queue,
            processor,
            secret: config.secret.clone(),
            max_passes: 100,
        }
    }

    pub fn with_max_passes(mut self, max_passes: usize) -> Self {
        self.max_passes = max_passes;
        self
    }

    pub fn queue(&self) -> &Arc<InMemoryTaskQueue> {
        &self.queue
    }

    /// 投递一次
    pub async fn deliver(&self, task: &StoredTask) -> ExecutionOutcome {
        let http = &task.request.http_request;
        let signed = task
            .request
            .signature()
            .is_some_and(|sig| verify_signature(&self.secret, &http.body, sig));
        if !signed {
            warn!("任务 {} 的请求签名无效，拒绝执行", task.id);
            return ExecutionOutcome::Malformed(format!("任务 {} 的请求签名无效", task.id));
        }

        let outcome = self
            .processor
            .process(&http.body, task.retries, Some(task.id.clone()))
            .await;
        debug!("Task {} delivered with status {}", task.id, outcome.status_code());
        outcome
    }

    async fn deliver_batch(&self, tasks: Vec<StoredTask>, report: &mut DeliveryReport) {
        for task in tasks {
            let outcome = self.deliver(&task).await;
            report.record(&outcome);
            if outcome.is_retryable() {
                self.queue.requeue(task).await;
            }
        }
    }

    /// 不考虑计划时间，反复投递直到队列为空或达到轮数上限
    pub async fn drain(&self) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        while report.passes < self.max_passes {
            let tasks = self.queue.pop_all().await;
            if tasks.is_empty() {
                break;
            }
            report.passes += 1;
            self.deliver_batch(tasks, &mut report).await;
        }
        info!(
            "本地投递结束: {} 轮, 成功 {}, 失败 {}, 死亡 {}, 无效 {}",
            report.passes, report.succeeded, report.failed, report.dead, report.malformed
        );
        report
    }

    /// 只投递在 `now` 之前到期的任务
    pub async fn drain_due(&self, now: DateTime<Utc>) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        while report.passes < self.max_passes {
            let tasks = self.queue.pop_due(now).await;
            if tasks.is_empty() {
                break;
            }
            report.passes += 1;
            self.deliver_batch(tasks, &mut report).await;
        }
        report
    }
}
