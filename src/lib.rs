//! 推送式后台任务的协调层
//!
//! 托管投递后端负责存储、定时与重试；本库在调度和执行两侧提供
//! 唯一任务锁、批次任务树与定时计划，状态保存在共享键值存储中。

pub mod app;

pub use app::{TaskRelay, TaskRelayBuilder};

pub use taskrelay_core::models::{
    BatchStatus, ConflictStrategy, CronSchedule, ExecutionContext, Job, LockStrategy,
};
pub use taskrelay_core::{
    ConfigLoader, KeyValueStore, RelayConfig, RelayError, RelayResult, TaskBackend, Worker,
    WorkerOptions, WorkerRegistry,
};
pub use taskrelay_dispatcher::{BatchProgress, JobClient};
pub use taskrelay_worker::{DeliveryReport, ExecutionOutcome, LocalDelivery};
