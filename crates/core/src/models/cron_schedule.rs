use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::CronScheduleConfig;

/// 定时计划
///
/// 每个计划最多有一个未完成的已分发任务。配置变更（表达式、Worker、
/// 参数、队列、时区）持久化时会取消旧任务并重新分发。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronSchedule {
    pub id: String,
    pub cron: String,
    pub worker: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub tz: Option<String>,
    /// 最后一次分发的投递任务ID
    #[serde(default)]
    pub task_id: Option<String>,
    /// 最后一次分发的Job ID
    #[serde(default)]
    pub job_id: Option<String>,
}

impl CronSchedule {
    pub fn new<S: Into<String>>(id: S, cron: S, worker: S) -> Self {
        Self {
            id: id.into(),
            cron: cron.into(),
            worker: worker.into(),
            args: Vec::new(),
            queue: None,
            tz: None,
            task_id: None,
            job_id: None,
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_queue<S: Into<String>>(mut self, queue: S) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_tz<S: Into<String>>(mut self, tz: S) -> Self {
        self.tz = Some(tz.into());
        self
    }

    /// 影响分发结果的配置是否不同
    pub fn config_changed(&self, other: &CronSchedule) -> bool {
        self.cron != other.cron
            || self.worker != other.worker
            || self.args != other.args
            || self.queue != other.queue
            || self.tz != other.tz
    }

    pub fn record_dispatch(&mut self, task_id: String, job_id: String) {
        self.task_id = Some(task_id);
        self.job_id = Some(job_id);
    }
}

impl From<&CronScheduleConfig> for CronSchedule {
    fn from(config: &CronScheduleConfig) -> Self {
        Self {
            id: config.id.clone(),
            cron: config.cron.clone(),
            worker: config.worker.clone(),
            args: config.args.clone(),
            queue: config.queue.clone(),
            tz: config.tz.clone(),
            task_id: None,
            job_id: None,
        }
    }
}
