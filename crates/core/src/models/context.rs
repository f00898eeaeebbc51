use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::Job;

/// 客户端调度链的上下文
#[derive(Debug, Clone)]
pub struct ScheduleContext {
    pub job: Job,
    /// 计划投递时间，`None` 表示立即投递
    pub time_at: Option<DateTime<Utc>>,
    /// 调度成功后由链末端填入
    pub task_id: Option<String>,
}

impl ScheduleContext {
    pub fn new(job: Job, time_at: Option<DateTime<Utc>>) -> Self {
        Self {
            job,
            time_at,
            task_id: None,
        }
    }

    /// 调度是否被冲突策略抑制（链末端从未被调用）
    pub fn is_suppressed(&self) -> bool {
        self.task_id.is_none()
    }
}

/// 服务端执行链的上下文
///
/// 应用代码在 `perform` 中通过它暂存批次子任务或请求重新入队，
/// 实际的持久化与分发由中间件在执行结束后完成。
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub job: Job,
    pub task_id: Option<String>,
    children: Vec<Job>,
    reenqueue_after: Option<Duration>,
}

impl ExecutionContext {
    pub fn new(job: Job, task_id: Option<String>) -> Self {
        Self {
            job,
            task_id,
            children: Vec::new(),
            reenqueue_after: None,
        }
    }

    pub fn args(&self) -> &[Value] {
        &self.job.args
    }

    pub fn retries(&self) -> u32 {
        self.job.job_retries
    }

    /// 暂存一个子任务，元数据记录当前任务为父批次
    pub fn add_child<S: Into<String>>(&mut self, class: S, args: Vec<Value>) -> &mut Job {
        let mut child = Job::new(class, args);
        child.set_parent_batch_id(self.job.id.clone());
        self.children.push(child);
        let last = self.children.len() - 1;
        &mut self.children[last]
    }

    pub fn children(&self) -> &[Job] {
        &self.children
    }

    pub fn take_children(&mut self) -> Vec<Job> {
        std::mem::take(&mut self.children)
    }

    /// 请求在延迟后重新投递当前任务，同时抑制批次完成处理
    pub fn reenqueue(&mut self, delay: Duration) {
        self.job.reenqueued = true;
        self.reenqueue_after = Some(delay);
    }

    pub fn take_reenqueue(&mut self) -> Option<Duration> {
        self.reenqueue_after.take()
    }
}
