use serde::{Deserialize, Serialize};
use tracing::warn;

/// 唯一任务锁策略
///
/// | 策略 | 加锁时机 | 释放时机 |
/// |---|---|---|
/// | `NoOp` | 从不 | 从不 |
/// | `UntilExecuted` | 调度 | 执行结束（成功或任何失败） |
/// | `UntilExecuting` | 调度（两阶段） | 执行开始 |
/// | `WhileExecuting` | 执行开始 | 执行结束 |
/// | `UntilCompleted` | 调度（两阶段） | 成功结束或永久失败 |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStrategy {
    #[default]
    NoOp,
    UntilExecuted,
    UntilExecuting,
    WhileExecuting,
    UntilCompleted,
}

impl LockStrategy {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "no_op" | "noop" => Some(Self::NoOp),
            "until_executed" => Some(Self::UntilExecuted),
            "until_executing" => Some(Self::UntilExecuting),
            "while_executing" => Some(Self::WhileExecuting),
            "until_completed" => Some(Self::UntilCompleted),
            _ => None,
        }
    }

    /// 按名称解析，未知名称回退到 `NoOp`
    pub fn from_name(name: &str) -> Self {
        Self::parse(name).unwrap_or_else(|| {
            warn!("Unknown lock strategy '{}', falling back to no_op", name);
            Self::NoOp
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NoOp => "no_op",
            Self::UntilExecuted => "until_executed",
            Self::UntilExecuting => "until_executing",
            Self::WhileExecuting => "while_executing",
            Self::UntilCompleted => "until_completed",
        }
    }
}

/// 锁冲突处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// 静默丢弃
    #[default]
    Reject,
    /// 向上传播锁错误
    Raise,
    /// 仅执行期：延迟后重新入队而不是执行
    Reschedule,
}

impl ConflictStrategy {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "reject" => Some(Self::Reject),
            "raise" => Some(Self::Raise),
            "reschedule" => Some(Self::Reschedule),
            _ => None,
        }
    }

    /// 按名称解析，未知名称回退到 `Reject`
    pub fn from_name(name: &str) -> Self {
        Self::parse(name).unwrap_or_else(|| {
            warn!("Unknown conflict strategy '{}', falling back to reject", name);
            Self::Reject
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Reject => "reject",
            Self::Raise => "raise",
            Self::Reschedule => "reschedule",
        }
    }
}
