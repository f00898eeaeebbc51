use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use taskrelay_core::config::CronScheduleConfig;
use taskrelay_core::models::{CronSchedule, Job};
use taskrelay_core::{
    store_key, KeyValueStore, KeyValueStoreExt, RelayConfig, RelayError, RelayResult, StoreMutex,
};
use tracing::{debug, info, warn};

use crate::client::JobClient;
use crate::cron_utils::CronScheduler;

pub const CRON_SCHEDULE_NAMESPACE: &str = "cron_schedule";
/// 计划ID集合
pub const CRON_SCHEDULE_INDEX_KEY: &str = "cron_schedule_index";

/// 一次实例分发的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    Dispatched,
    /// 表达式没有后续执行时间
    Exhausted,
    /// 客户端中间件抑制了调度
    Suppressed,
}

/// 定时计划的持久化与实例分发
#[derive(Clone)]
pub struct CronScheduleStore {
    store: Arc<dyn KeyValueStore>,
    mutex: StoreMutex,
    client: Arc<JobClient>,
}

impl CronScheduleStore {
    pub fn new(store: Arc<dyn KeyValueStore>, config: &RelayConfig, client: Arc<JobClient>) -> Self {
        let mutex = StoreMutex::new(store.clone(), &config.store_lock);
        Self {
            store,
            mutex,
            client,
        }
    }

    pub fn key(id: &str) -> String {
        store_key(&[CRON_SCHEDULE_NAMESPACE, id])
    }

    pub async fn find(&self, id: &str) -> RelayResult<Option<CronSchedule>> {
        self.store.get_as(&Self::key(id)).await
    }

    async fn ids(&self) -> RelayResult<Vec<String>> {
        Ok(self
            .store
            .get_as::<Vec<String>>(CRON_SCHEDULE_INDEX_KEY)
            .await?
            .unwrap_or_default())
    }

    pub async fn all(&self) -> RelayResult<Vec<CronSchedule>> {
        let mut schedules = Vec::new();
        for id in self.ids().await? {
            if let Some(schedule) = self.find(&id).await? {
                schedules.push(schedule);
            }
        }
        Ok(schedules)
    }

    async fn update_index(&self, id: &str, present: bool) -> RelayResult<()> {
        let store = self.store.as_ref();
        self.mutex
            .with_lock(CRON_SCHEDULE_INDEX_KEY, move || async move {
                let mut ids: Vec<String> = store
                    .get_as(CRON_SCHEDULE_INDEX_KEY)
                    .await?
                    .unwrap_or_default();
                let known = ids.iter().any(|i| i == id);
                if present && !known {
                    ids.push(id.to_string());
                    ids.sort();
                } else if !present && known {
                    ids.retain(|i| i != id);
                } else {
                    return Ok(());
                }
                store.set_as(CRON_SCHEDULE_INDEX_KEY, &ids, None).await
            })
            .await
    }

    /// 从 `from` 起计算下一次执行时间
    pub fn next_time(
        schedule: &CronSchedule,
        from: DateTime<Utc>,
    ) -> RelayResult<Option<DateTime<Utc>>> {
        let scheduler = CronScheduler::with_timezone(&schedule.cron, schedule.tz.as_deref())?;
        Ok(scheduler.next_execution_time(from))
    }

    /// 构造计划在 `time_at` 的实例任务
    pub fn instance_job(schedule: &CronSchedule, time_at: DateTime<Utc>) -> Job {
        let mut job = Job::new(schedule.worker.clone(), schedule.args.clone());
        job.queue = schedule.queue.clone();
        job.set_cron_instance(schedule.id.clone(), time_at);
        job
    }

    /// 分发 `from` 之后的下一个实例并记录到计划上
    async fn dispatch_next(
        &self,
        schedule: &mut CronSchedule,
        from: DateTime<Utc>,
    ) -> RelayResult<Dispatch> {
        let Some(time_at) = Self::next_time(schedule, from)? else {
            warn!("定时计划 {} 没有后续执行时间", schedule.id);
            return Ok(Dispatch::Exhausted);
        };

        let job = Self::instance_job(schedule, time_at);
        let job_id = job.id.clone();
        match self.client.schedule_at(job, time_at).await? {
            Some(task_id) => {
                info!(
                    "定时计划 {} 已分发实例 {} @ {}",
                    schedule.id,
                    job_id,
                    time_at.format("%Y-%m-%d %H:%M:%S UTC")
                );
                schedule.record_dispatch(task_id, job_id);
                Ok(Dispatch::Dispatched)
            }
            None => {
                warn!("定时计划 {} 的实例调度被抑制", schedule.id);
                Ok(Dispatch::Suppressed)
            }
        }
    }

    /// 持久化计划
    ///
    /// 配置未变化且已有实例时保留分发状态；否则撤销旧任务并重新分发。
    pub async fn save(&self, schedule: CronSchedule) -> RelayResult<CronSchedule> {
        CronScheduler::with_timezone(&schedule.cron, schedule.tz.as_deref())?;

        let key = Self::key(&schedule.id);
        let key_ref = key.as_str();
        let saved = self
            .mutex
            .with_lock(&key, move || async move {
                let mut schedule = schedule;
                let existing = self.find(&schedule.id).await?;

                if let Some(existing) = existing {
                    if !existing.config_changed(&schedule) && existing.job_id.is_some() {
                        debug!("Cron schedule {} unchanged", schedule.id);
                        return Ok(existing);
                    }
                    if let Some(task_id) = existing.task_id.as_deref() {
                        self.client.delete_task(task_id).await?;
                    }
                }

                schedule.task_id = None;
                schedule.job_id = None;
                self.dispatch_next(&mut schedule, Utc::now()).await?;
                self.store.set_as(key_ref, &schedule, None).await?;
                Ok(schedule)
            })
            .await?;

        self.update_index(&saved.id, true).await?;
        Ok(saved)
    }

    pub async fn create<S: Into<String>>(
        &self,
        id: S,
        cron: S,
        worker: S,
        args: Vec<Value>,
    ) -> RelayResult<CronSchedule> {
        self.save(CronSchedule::new(id, cron, worker).with_args(args))
            .await
    }

    /// 删除计划并撤销尚未投递的实例
    pub async fn delete(&self, id: &str) -> RelayResult<bool> {
        let key = Self::key(id);
        let key_ref = key.as_str();
        let deleted = self
            .mutex
            .with_lock(&key, move || async move {
                let Some(existing) = self.find(id).await? else {
                    return Ok(false);
                };
                if let Some(task_id) = existing.task_id.as_deref() {
                    self.client.delete_task(task_id).await?;
                }
                self.store.delete(key_ref).await?;
                Ok(true)
            })
            .await?;

        self.update_index(id, false).await?;
        if deleted {
            info!("定时计划已删除: {}", id);
        }
        Ok(deleted)
    }

    /// 同步配置中的计划：逐个保存，并删除配置中不存在的计划
    pub async fn load_from_config(
        &self,
        configs: &[CronScheduleConfig],
    ) -> RelayResult<Vec<CronSchedule>> {
        let mut saved = Vec::with_capacity(configs.len());
        for config in configs {
            saved.push(self.save(CronSchedule::from(config)).await?);
        }

        for id in self.ids().await? {
            if !configs.iter().any(|c| c.id == id) {
                self.delete(&id).await?;
            }
        }

        info!("已同步 {} 个定时计划", saved.len());
        Ok(saved)
    }

    /// 分发实例的后继
    ///
    /// 只有仍被计划记录为最近分发实例的任务才会分发后继，
    /// 因此同一实例的并发重试最多分发一次。后继被抑制时返回错误，
    /// 计划仍指向当前实例，重试时可以再次分发。
    pub async fn dispatch_successor(&self, job: &Job) -> RelayResult<bool> {
        let Some(schedule_id) = job.cron_schedule_id() else {
            return Ok(false);
        };
        let key = Self::key(schedule_id);
        let key_ref = key.as_str();

        self.mutex
            .with_lock(&key, move || async move {
                let Some(mut schedule) = self.find(schedule_id).await? else {
                    debug!("Cron schedule {} no longer exists", schedule_id);
                    return Ok(false);
                };
                if schedule.job_id.as_deref() != Some(job.id.as_str()) {
                    debug!(
                        "Instance {} is not the latest of schedule {}",
                        job.id, schedule_id
                    );
                    return Ok(false);
                }

                let from = job.cron_time_at().unwrap_or_else(Utc::now);
                match self.dispatch_next(&mut schedule, from).await? {
                    Dispatch::Dispatched => {
                        self.store.set_as(key_ref, &schedule, None).await?;
                        Ok(true)
                    }
                    Dispatch::Exhausted => Ok(false),
                    Dispatch::Suppressed => Err(RelayError::job_failed(format!(
                        "定时计划 {} 的后继实例调度被抑制 (当前实例 {})",
                        schedule_id, job.id
                    ))),
                }
            })
            .await
    }
}
