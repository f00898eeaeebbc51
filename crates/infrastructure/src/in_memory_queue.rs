use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use taskrelay_core::models::TaskRequest;
use taskrelay_core::{RelayError, RelayResult, TaskBackend};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 队列中保存的任务
#[derive(Debug, Clone, PartialEq)]
pub struct StoredTask {
    pub id: String,
    pub request: TaskRequest,
    /// 已经发生的重投递次数
    pub retries: u32,
}

impl StoredTask {
    /// 计划时间已到或未设置计划时间
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.request.schedule_time.map_or(true, |at| at <= now)
    }

    /// 请求体中任务的ID，请求体损坏时返回 `None`
    pub fn job_id(&self) -> Option<String> {
        self.request.job().ok().map(|job| job.id)
    }
}

#[derive(Debug, Clone)]
pub struct InMemoryQueueConfig {
    /// 队列最大容量（0表示无限制）
    pub max_queue_size: usize,
}

impl Default for InMemoryQueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10000,
        }
    }
}

/// 内存投递后端
///
/// 按提交顺序保存任务请求，适用于测试和嵌入式部署。
/// 任务只有在被取出后才算投递，取出前可以通过ID撤销。
#[derive(Debug, Clone)]
pub struct InMemoryTaskQueue {
    tasks: Arc<RwLock<Vec<StoredTask>>>,
    config: InMemoryQueueConfig,
}

impl Default for InMemoryTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::with_config(InMemoryQueueConfig::default())
    }

    pub fn with_config(config: InMemoryQueueConfig) -> Self {
        info!("Creating in-memory task queue with config: {:?}", config);
        Self {
            tasks: Arc::new(RwLock::new(Vec::new())),
            config,
        }
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }

    /// 指定队列中的任务数量
    pub async fn queue_len(&self, queue: &str) -> usize {
        self.tasks
            .read()
            .await
            .iter()
            .filter(|t| t.request.queue == queue)
            .count()
    }

    /// 当前所有任务的快照
    pub async fn tasks(&self) -> Vec<StoredTask> {
        self.tasks.read().await.clone()
    }

    pub async fn find(&self, task_id: &str) -> Option<StoredTask> {
        self.tasks
            .read()
            .await
            .iter()
            .find(|t| t.id == task_id)
            .cloned()
    }

    pub async fn find_by_job_id(&self, job_id: &str) -> Option<StoredTask> {
        self.tasks
            .read()
            .await
            .iter()
            .find(|t| t.job_id().as_deref() == Some(job_id))
            .cloned()
    }

    /// 取出所有任务，忽略计划时间
    pub async fn pop_all(&self) -> Vec<StoredTask> {
        let tasks = std::mem::take(&mut *self.tasks.write().await);
        debug!("Popped {} tasks from in-memory queue", tasks.len());
        tasks
    }

    /// 取出计划时间不晚于 `now` 的任务
    pub async fn pop_due(&self, now: DateTime<Utc>) -> Vec<StoredTask> {
        let mut tasks = self.tasks.write().await;
        let (due, pending): (Vec<StoredTask>, Vec<StoredTask>) =
            tasks.drain(..).partition(|t| t.is_due(now));
        *tasks = pending;
        debug!("Popped {} due tasks from in-memory queue", due.len());
        due
    }

    /// 重新放回一个投递失败的任务，重试计数加一
    pub async fn requeue(&self, mut task: StoredTask) {
        task.retries += 1;
        debug!("Requeue task {} (retries: {})", task.id, task.retries);
        self.tasks.write().await.push(task);
    }

    pub async fn clear(&self) {
        let mut tasks = self.tasks.write().await;
        let count = tasks.len();
        tasks.clear();
        info!("Cleared {} tasks from in-memory queue", count);
    }
}

#[async_trait]
impl TaskBackend for InMemoryTaskQueue {
    async fn schedule(&self, request: TaskRequest) -> RelayResult<String> {
        let mut tasks = self.tasks.write().await;
        if self.config.max_queue_size > 0 && tasks.len() >= self.config.max_queue_size {
            warn!(
                "In-memory queue is full ({} tasks), rejecting request for queue '{}'",
                tasks.len(),
                request.queue
            );
            return Err(RelayError::backend(format!(
                "队列已满: {}",
                self.config.max_queue_size
            )));
        }

        let id = format!("task-{}", Uuid::new_v4());
        debug!("Scheduling task {} on queue '{}'", id, request.queue);
        tasks.push(StoredTask {
            id: id.clone(),
            request,
            retries: 0,
        });
        Ok(id)
    }

    async fn delete(&self, task_id: &str) -> RelayResult<bool> {
        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|t| t.id != task_id);
        let removed = tasks.len() < before;
        debug!("Delete task {}: {}", task_id, removed);
        Ok(removed)
    }
}
