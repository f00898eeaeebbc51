//! 调度与执行两侧的协调逻辑
//!
//! 中间件链、任务客户端、唯一任务锁、批次任务树和定时实例守卫。
//! 所有跨进程的同步都通过共享键值存储完成。

pub mod batch;
pub mod chains;
pub mod client;
pub mod cron;
pub mod cron_utils;
pub mod middleware;
pub mod unique_job;

pub use batch::{BatchMiddleware, BatchProgress, BatchTracker};
pub use client::JobClient;
pub use cron::{CronGuardMiddleware, CronScheduleStore};
pub use cron_utils::CronScheduler;
pub use middleware::{ClientChain, Endpoint, Middleware, MiddlewareChain, Next, ServerChain};
pub use unique_job::{UniqueJob, UniqueJobLocks};
