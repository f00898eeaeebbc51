//! # 数据模型
//!
//! 定义协调层在调度与执行之间传递和持久化的数据结构。
//!
//! ## 核心模型
//!
//! ### Job - 任务描述
//! 交给投递后端的工作单元描述（不是运行中的回调本身）。
//!
//! ### ScheduleContext / ExecutionContext - 中间件上下文
//! 客户端调度链与服务端执行链各自传递的上下文。
//!
//! ### TaskRequest - 投递请求
//! 包装后的HTTP请求描述，由投递后端在之后重放到处理端点。
//!
//! ### CronSchedule - 定时计划
//! 周期任务的配置及其最后一次分发的任务/Job标识。
//!
//! ## 设计原则
//!
//! - 所有时间字段使用 `DateTime<Utc>`
//! - 状态与策略使用封闭枚举，未知名称回退到安全的默认变体
//! - 运行期标记（重新入队、重试次数）不参与序列化
//!
pub mod batch;
pub mod context;
pub mod cron_schedule;
pub mod job;
pub mod task_request;
pub mod unique;

pub use batch::BatchStatus;
pub use context::{ExecutionContext, ScheduleContext};
pub use cron_schedule::CronSchedule;
pub use job::Job;
pub use task_request::{sign_body, verify_signature, HttpRequest, TaskRequest, SIGNATURE_HEADER};
pub use unique::{ConflictStrategy, LockStrategy};
