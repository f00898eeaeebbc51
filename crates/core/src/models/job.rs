use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// 父批次ID在元数据中的键
pub const META_BATCH_PARENT_ID: &str = "batch_parent_id";
/// 定时计划ID在元数据中的键
pub const META_CRON_SCHEDULE_ID: &str = "cron_schedule_id";
/// 定时实例名义执行时间（Unix秒）在元数据中的键
pub const META_CRON_TIME_AT: &str = "cron_time_at";

/// 任务描述
///
/// 由应用代码创建，或由中间件在派生后继任务（定时实例、批次子任务）时创建。
/// 投递成功后不保留任何状态。
///
/// # 字段说明
///
/// - `id`: 全局唯一的不透明标识
/// - `class`: Worker类标识，执行时据此解析Worker
/// - `args`: 有序参数列表（JSON兼容）
/// - `meta`: 元数据，保存父批次ID、定时计划ID、名义执行时间
/// - `queue`: 队列名，为空时由客户端根据Worker选项或配置补全
/// - `job_retries`: 重投递次数，由投递后端提供，不参与序列化
/// - `reenqueued`: 应用代码手动重新入队后设置，抑制批次后处理
///
/// # 使用示例
///
/// ```rust
/// use taskrelay_core::models::Job;
/// use serde_json::json;
///
/// let job = Job::new("ReportWorker", vec![json!(42), json!("full")])
///     .with_queue("reports");
/// assert_eq!(job.class, "ReportWorker");
/// assert_eq!(job.queue.as_deref(), Some("reports"));
/// assert!(job.parent_batch_id().is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub class: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub meta: Map<String, Value>,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(skip)]
    pub job_retries: u32,
    #[serde(skip)]
    pub reenqueued: bool,
}

impl Job {
    pub fn new<S: Into<String>>(class: S, args: Vec<Value>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            class: class.into(),
            args,
            meta: Map::new(),
            queue: None,
            job_retries: 0,
            reenqueued: false,
        }
    }

    pub fn with_id<S: Into<String>>(mut self, id: S) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_queue<S: Into<String>>(mut self, queue: S) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_meta<S: Into<String>>(mut self, key: S, value: Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.meta.get(key).and_then(Value::as_str)
    }

    pub fn set_meta<S: Into<String>>(&mut self, key: S, value: Value) {
        self.meta.insert(key.into(), value);
    }

    pub fn parent_batch_id(&self) -> Option<&str> {
        self.meta_str(META_BATCH_PARENT_ID)
    }

    pub fn set_parent_batch_id<S: Into<String>>(&mut self, parent_id: S) {
        self.set_meta(META_BATCH_PARENT_ID, Value::String(parent_id.into()));
    }

    pub fn cron_schedule_id(&self) -> Option<&str> {
        self.meta_str(META_CRON_SCHEDULE_ID)
    }

    /// 定时实例的名义执行时间
    pub fn cron_time_at(&self) -> Option<DateTime<Utc>> {
        self.meta
            .get(META_CRON_TIME_AT)
            .and_then(Value::as_i64)
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
    }

    pub fn set_cron_instance<S: Into<String>>(&mut self, schedule_id: S, time_at: DateTime<Utc>) {
        self.set_meta(META_CRON_SCHEDULE_ID, Value::String(schedule_id.into()));
        self.set_meta(META_CRON_TIME_AT, Value::from(time_at.timestamp()));
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
