use std::fmt;

use serde::{Deserialize, Serialize};

/// 批次节点中子任务的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Scheduled,
    Processing,
    Completed,
    Errored,
    Dead,
}

impl BatchStatus {
    /// 终态之后不再发生状态迁移
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Dead)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Scheduled => "scheduled",
            BatchStatus::Processing => "processing",
            BatchStatus::Completed => "completed",
            BatchStatus::Errored => "errored",
            BatchStatus::Dead => "dead",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
