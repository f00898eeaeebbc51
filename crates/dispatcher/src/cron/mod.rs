//! 定时计划与定时实例守卫

mod guard;
mod schedule;

pub use guard::{CronGuardMiddleware, CRON_JOB_NAMESPACE, PERFORMED, PROCESSING};
pub use schedule::{CronScheduleStore, CRON_SCHEDULE_INDEX_KEY, CRON_SCHEDULE_NAMESPACE};
