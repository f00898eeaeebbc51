use thiserror::Error;

/// 协调层错误类型定义
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("唯一任务锁冲突: {unique_id} 已被任务 {owner:?} 持有")]
    Lock {
        unique_id: String,
        owner: Option<String>,
    },

    #[error("无效的Worker: {0}")]
    InvalidWorker(String),

    #[error("任务已死亡: {0}")]
    DeadWorker(String),

    #[error("任务执行失败: {0}")]
    JobFailed(String),

    #[error("存储错误: {0}")]
    Store(String),

    #[error("投递后端错误: {0}")]
    Backend(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 统一的Result类型
pub type RelayResult<T> = std::result::Result<T, RelayError>;

impl RelayError {
    pub fn lock<S: Into<String>>(unique_id: S, owner: Option<String>) -> Self {
        Self::Lock {
            unique_id: unique_id.into(),
            owner,
        }
    }
    pub fn job_failed<S: Into<String>>(msg: S) -> Self {
        Self::JobFailed(msg.into())
    }
    pub fn dead<S: Into<String>>(msg: S) -> Self {
        Self::DeadWorker(msg.into())
    }
    pub fn store<S: Into<String>>(msg: S) -> Self {
        Self::Store(msg.into())
    }
    pub fn backend<S: Into<String>>(msg: S) -> Self {
        Self::Backend(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn is_lock_error(&self) -> bool {
        matches!(self, RelayError::Lock { .. })
    }
    pub fn is_dead(&self) -> bool {
        matches!(self, RelayError::DeadWorker(_))
    }
    /// 终态错误不会被投递后端重试
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RelayError::DeadWorker(_) | RelayError::InvalidWorker(_)
        )
    }
    pub fn is_retryable(&self) -> bool {
        !self.is_terminal()
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for RelayError {
    fn from(err: anyhow::Error) -> Self {
        RelayError::Internal(err.to_string())
    }
}
