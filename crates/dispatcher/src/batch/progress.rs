use std::ops::Add;

use serde::{Deserialize, Serialize};
use taskrelay_core::models::BatchStatus;

/// 批次子树的状态统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub total: usize,
    pub scheduled: usize,
    pub processing: usize,
    pub completed: usize,
    pub errored: usize,
    pub dead: usize,
}

impl BatchProgress {
    pub fn record(&mut self, status: BatchStatus) {
        self.total += 1;
        match status {
            BatchStatus::Scheduled => self.scheduled += 1,
            BatchStatus::Processing => self.processing += 1,
            BatchStatus::Completed => self.completed += 1,
            BatchStatus::Errored => self.errored += 1,
            BatchStatus::Dead => self.dead += 1,
        }
    }

    /// 已到达终态的数量
    pub fn done(&self) -> usize {
        self.completed + self.dead
    }

    pub fn pending(&self) -> usize {
        self.total - self.done()
    }

    /// 完成百分比
    ///
    /// 分母取 `max(min_total, total + smoothing)`，用于在子任务尚未全部
    /// 注册时避免进度跳变。分母为零时返回 0。
    pub fn percent(&self, min_total: usize, smoothing: usize) -> f64 {
        let actual_total = min_total.max(self.total + smoothing);
        if actual_total == 0 {
            return 0.0;
        }
        self.done() as f64 / actual_total as f64 * 100.0
    }
}

impl Add for BatchProgress {
    type Output = BatchProgress;

    fn add(self, other: BatchProgress) -> BatchProgress {
        BatchProgress {
            total: self.total + other.total,
            scheduled: self.scheduled + other.scheduled,
            processing: self.processing + other.processing,
            completed: self.completed + other.completed,
            errored: self.errored + other.errored,
            dead: self.dead + other.dead,
        }
    }
}
