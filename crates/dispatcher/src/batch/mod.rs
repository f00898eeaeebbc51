//! 批次任务树
//!
//! 每个带子任务的任务是一个批次节点：`batch_job/job/<id>` 保存序列化的任务
//! （用于在调用栈之外重新触发回调），`batch_job/state/<id>` 保存子任务ID到
//! 状态的映射。所有读改写都在该状态键的存储锁内完成，"子树刚刚全部到达终态"
//! 在锁内判定，因此并发的兄弟任务中只有一个会向上传递完成事件。
//! `batch_job/pending/<id>` 保存尚未成功分发的子任务，节点重新投递时继续分发。

mod middleware;
mod progress;

use std::collections::BTreeMap;
use std::sync::Arc;

use taskrelay_core::models::{BatchStatus, Job};
use taskrelay_core::{
    store_key, KeyValueStore, KeyValueStoreExt, RelayConfig, RelayResult, StoreMutex, Worker,
    WorkerRegistry,
};
use tracing::{debug, info, warn};

pub use middleware::BatchMiddleware;
pub use progress::BatchProgress;

pub const BATCH_NAMESPACE: &str = "batch_job";

/// 子任务ID到状态的映射
pub type BatchState = BTreeMap<String, BatchStatus>;

/// 一次状态更新的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateUpdate {
    /// 状态映射是否被修改
    pub changed: bool,
    /// 本次更新使所有条目首次全部到达终态
    pub resolved_now: bool,
    /// 更新后是否存在 dead 条目
    pub any_dead: bool,
}

impl StateUpdate {
    /// 子树收敛后向上传递的状态
    pub fn resolved_status(&self) -> BatchStatus {
        if self.any_dead {
            BatchStatus::Dead
        } else {
            BatchStatus::Completed
        }
    }
}

fn all_terminal(state: &BatchState) -> bool {
    state.values().all(BatchStatus::is_terminal)
}

fn any_dead(state: &BatchState) -> bool {
    state.values().any(|s| *s == BatchStatus::Dead)
}

fn swallow(hook: &str, job: &Job, result: RelayResult<()>) {
    if let Err(e) = result {
        warn!("批次回调 {} 执行失败 (任务 {}): {}", hook, job.id, e);
    }
}

/// 批次状态的持久化与完成事件传播
#[derive(Clone)]
pub struct BatchTracker {
    store: Arc<dyn KeyValueStore>,
    mutex: StoreMutex,
    registry: Arc<WorkerRegistry>,
}

impl BatchTracker {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        config: &RelayConfig,
        registry: Arc<WorkerRegistry>,
    ) -> Self {
        let mutex = StoreMutex::new(store.clone(), &config.store_lock);
        Self {
            store,
            mutex,
            registry,
        }
    }

    pub fn job_key(job_id: &str) -> String {
        store_key(&[BATCH_NAMESPACE, "job", job_id])
    }

    pub fn state_key(job_id: &str) -> String {
        store_key(&[BATCH_NAMESPACE, "state", job_id])
    }

    /// 持久化批次节点的任务
    pub async fn save(&self, job: &Job) -> RelayResult<()> {
        self.store.set_as(&Self::job_key(&job.id), job, None).await
    }

    pub async fn find_job(&self, job_id: &str) -> RelayResult<Option<Job>> {
        self.store.get_as(&Self::job_key(job_id)).await
    }

    pub fn pending_key(job_id: &str) -> String {
        store_key(&[BATCH_NAMESPACE, "pending", job_id])
    }

    /// 尚未成功分发的子任务
    pub async fn pending_children(&self, job_id: &str) -> RelayResult<Option<Vec<Job>>> {
        self.store.get_as(&Self::pending_key(job_id)).await
    }

    pub async fn save_pending(&self, job_id: &str, children: &[Job]) -> RelayResult<()> {
        self.store
            .set_as(&Self::pending_key(job_id), &children, None)
            .await
    }

    pub async fn clear_pending(&self, job_id: &str) -> RelayResult<()> {
        self.store.delete(&Self::pending_key(job_id)).await?;
        Ok(())
    }

    pub async fn state(&self, job_id: &str) -> RelayResult<Option<BatchState>> {
        self.store.get_as(&Self::state_key(job_id)).await
    }

    /// 以 scheduled 状态登记子任务
    pub async fn register_children(&self, parent_id: &str, child_ids: &[String]) -> RelayResult<()> {
        let key = Self::state_key(parent_id);
        let key_ref = key.as_str();
        let store = self.store.as_ref();
        self.mutex
            .with_lock(&key, move || async move {
                let mut state: BatchState = store.get_as(key_ref).await?.unwrap_or_default();
                for id in child_ids {
                    state.entry(id.clone()).or_insert(BatchStatus::Scheduled);
                }
                store.set_as(key_ref, &state, None).await
            })
            .await?;
        debug!("Registered {} children on batch {}", child_ids.len(), parent_id);
        Ok(())
    }

    /// 移除调度被抑制的子任务
    pub async fn remove_child(&self, parent_id: &str, child_id: &str) -> RelayResult<StateUpdate> {
        let key = Self::state_key(parent_id);
        let key_ref = key.as_str();
        let store = self.store.as_ref();
        self.mutex
            .with_lock(&key, move || async move {
                let Some(mut state) = store.get_as::<BatchState>(key_ref).await? else {
                    return Ok(StateUpdate::default());
                };
                let was_resolved = all_terminal(&state);
                if state.remove(child_id).is_none() {
                    return Ok(StateUpdate::default());
                }
                store.set_as(key_ref, &state, None).await?;
                Ok(StateUpdate {
                    changed: true,
                    resolved_now: !was_resolved && !state.is_empty() && all_terminal(&state),
                    any_dead: any_dead(&state),
                })
            })
            .await
    }

    /// 更新子任务状态
    ///
    /// 未登记的子任务（例如批次已被清理）和已处于终态的条目不会被修改。
    pub async fn update_state(
        &self,
        parent_id: &str,
        child_id: &str,
        status: BatchStatus,
    ) -> RelayResult<StateUpdate> {
        let key = Self::state_key(parent_id);
        let key_ref = key.as_str();
        let store = self.store.as_ref();
        let update = self
            .mutex
            .with_lock(&key, move || async move {
                let Some(mut state) = store.get_as::<BatchState>(key_ref).await? else {
                    return Ok(StateUpdate::default());
                };
                match state.get(child_id) {
                    Some(current) if !current.is_terminal() => {}
                    _ => return Ok(StateUpdate::default()),
                }
                state.insert(child_id.to_string(), status);
                store.set_as(key_ref, &state, None).await?;
                Ok(StateUpdate {
                    changed: true,
                    resolved_now: all_terminal(&state),
                    any_dead: any_dead(&state),
                })
            })
            .await?;

        if update.changed {
            debug!("Batch {}: child {} -> {}", parent_id, child_id, status);
        } else {
            debug!(
                "Batch {}: ignored {} for child {} (unknown or terminal)",
                parent_id, status, child_id
            );
        }
        Ok(update)
    }

    /// 子树是否已全部到达终态；没有子任务的节点视为已完成
    pub async fn is_complete(&self, job_id: &str) -> RelayResult<bool> {
        let key = Self::state_key(job_id);
        let key_ref = key.as_str();
        let store = self.store.as_ref();
        self.mutex
            .with_lock(&key, move || async move {
                Ok(store
                    .get_as::<BatchState>(key_ref)
                    .await?
                    .map_or(true, |state| all_terminal(&state)))
            })
            .await
    }

    fn worker_for(&self, job: &Job) -> Option<Arc<dyn Worker>> {
        let worker = self.registry.get(&job.class);
        if worker.is_none() {
            warn!("批次回调跳过: 未注册的Worker {} (任务 {})", job.class, job.id);
        }
        worker
    }

    /// 节点一次执行结束后的完成处理
    ///
    /// 已重新入队的任务不做处理；先向所有祖先发送节点完成信号，
    /// 再在子树已收敛时触发 `on_complete`。
    pub async fn complete(&self, job: &Job, status: BatchStatus) -> RelayResult<()> {
        if job.reenqueued {
            debug!("Job {} was reenqueued, skipping batch completion", job.id);
            return Ok(());
        }

        self.notify_node_complete(job, status).await?;

        if self.is_complete(&job.id).await? {
            self.on_complete(job.clone(), status).await?;
        }
        Ok(())
    }

    /// 向所有祖先报告某个节点结束
    async fn notify_node_complete(&self, node: &Job, status: BatchStatus) -> RelayResult<()> {
        let mut parent_id = node.parent_batch_id().map(str::to_string);
        while let Some(id) = parent_id {
            let Some(ancestor) = self.find_job(&id).await? else {
                break;
            };
            if let Some(worker) = self.worker_for(&ancestor) {
                swallow(
                    "on_batch_node_complete",
                    &ancestor,
                    worker.on_batch_node_complete(&ancestor, node, status).await,
                );
            }
            parent_id = ancestor.parent_batch_id().map(str::to_string);
        }
        Ok(())
    }

    /// 子树收敛：执行完成回调并沿父链逐级传播，到达根节点后清理整棵树
    pub async fn on_complete(&self, job: Job, status: BatchStatus) -> RelayResult<()> {
        let mut current = job;
        let mut status = status;

        loop {
            if status == BatchStatus::Completed {
                if let Some(worker) = self.worker_for(&current) {
                    swallow(
                        "on_batch_complete",
                        &current,
                        worker.on_batch_complete(&current).await,
                    );
                }
            }

            let Some(parent_id) = current.parent_batch_id().map(str::to_string) else {
                info!("批次树已完成: 根任务 {} ({})", current.id, status);
                return self.cleanup(&current.id).await;
            };

            let update = self.update_state(&parent_id, &current.id, status).await?;
            if !update.changed {
                return Ok(());
            }
            let Some(parent) = self.find_job(&parent_id).await? else {
                warn!("批次节点 {} 缺少任务记录", parent_id);
                return Ok(());
            };

            if let Some(worker) = self.worker_for(&parent) {
                let (hook, result) = match status {
                    BatchStatus::Completed => (
                        "on_child_complete",
                        worker.on_child_complete(&parent, &current).await,
                    ),
                    BatchStatus::Errored => (
                        "on_child_error",
                        worker.on_child_error(&parent, &current).await,
                    ),
                    BatchStatus::Dead => (
                        "on_child_dead",
                        worker.on_child_dead(&parent, &current).await,
                    ),
                    BatchStatus::Scheduled | BatchStatus::Processing => ("", Ok(())),
                };
                swallow(hook, &parent, result);
            }

            // dead 子任务直接将祖先链标记为 dead，不再等待兄弟任务
            let next_status = if status == BatchStatus::Dead {
                BatchStatus::Dead
            } else if update.resolved_now {
                update.resolved_status()
            } else {
                return Ok(());
            };

            debug!("Batch {} resolved with status {}", parent.id, next_status);
            current = parent;
            status = next_status;
        }
    }

    /// 删除整棵子树的持久化状态
    pub async fn cleanup(&self, root_id: &str) -> RelayResult<()> {
        let mut stack = vec![root_id.to_string()];
        let mut removed = 0usize;

        while let Some(id) = stack.pop() {
            if let Some(state) = self.state(&id).await? {
                stack.extend(state.into_keys());
            }
            self.store.delete(&Self::state_key(&id)).await?;
            self.store.delete(&Self::job_key(&id)).await?;
            self.store.delete(&Self::pending_key(&id)).await?;
            removed += 1;
        }

        debug!("Cleaned up {} batch nodes under {}", removed, root_id);
        Ok(())
    }

    /// 统计子树状态；`depth` 为 0 时只统计直接子任务，`None` 时不限深度
    pub async fn progress(&self, job_id: &str, depth: Option<usize>) -> RelayResult<BatchProgress> {
        let mut progress = BatchProgress::default();
        let mut stack = vec![(job_id.to_string(), 0usize)];

        while let Some((id, level)) = stack.pop() {
            let Some(state) = self.state(&id).await? else {
                continue;
            };
            let descend = depth.map_or(true, |max| level < max);
            for (child_id, status) in state {
                progress.record(status);
                if descend {
                    stack.push((child_id, level + 1));
                }
            }
        }
        Ok(progress)
    }
}
