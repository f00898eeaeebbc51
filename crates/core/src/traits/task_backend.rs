use async_trait::async_trait;

use crate::{models::TaskRequest, RelayResult};

/// 投递后端抽象接口
///
/// 后端掌握投递时机与重试，协调层只负责提交和撤销任务。
#[async_trait]
pub trait TaskBackend: Send + Sync {
    /// 提交任务请求，返回后端分配的任务ID
    async fn schedule(&self, request: TaskRequest) -> RelayResult<String>;

    /// 撤销尚未投递的任务，返回任务是否存在
    async fn delete(&self, task_id: &str) -> RelayResult<bool>;
}
