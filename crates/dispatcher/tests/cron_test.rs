use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use serde_json::{json, Value};
use taskrelay_core::config::CronScheduleConfig;
use taskrelay_core::models::{ConflictStrategy, CronSchedule, ExecutionContext, Job, LockStrategy};
use taskrelay_core::{
    KeyValueStore, RelayConfig, RelayError, RelayResult, Worker, WorkerOptions, WorkerRegistry,
};
use taskrelay_dispatcher::chains::{client_chain, server_chain};
use taskrelay_dispatcher::cron::PERFORMED;
use taskrelay_dispatcher::{
    CronGuardMiddleware, CronScheduleStore, Endpoint, JobClient, ServerChain, UniqueJobLocks,
};
use taskrelay_infrastructure::{InMemoryStore, InMemoryTaskQueue};

#[derive(Default)]
struct TickWorker {
    performed: AtomicUsize,
    failing: AtomicBool,
}

#[async_trait]
impl Worker for TickWorker {
    async fn perform(&self, _ctx: &mut ExecutionContext) -> RelayResult<()> {
        self.performed.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(RelayError::job_failed("upstream timeout"));
        }
        Ok(())
    }
}

/// 带唯一锁的定时任务；可在执行期间把锁改写给另一个持有者
struct LockedTick {
    strategy: LockStrategy,
    performed: AtomicUsize,
    takeover: Mutex<Option<(Arc<dyn KeyValueStore>, String)>>,
}

impl LockedTick {
    fn new(strategy: LockStrategy) -> Arc<Self> {
        Arc::new(Self {
            strategy,
            performed: AtomicUsize::new(0),
            takeover: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Worker for LockedTick {
    fn options(&self) -> WorkerOptions {
        WorkerOptions::default()
            .with_lock(self.strategy)
            .with_conflict(ConflictStrategy::Reject)
    }

    async fn perform(&self, _ctx: &mut ExecutionContext) -> RelayResult<()> {
        self.performed.fetch_add(1, Ordering::SeqCst);
        let takeover = self.takeover.lock().unwrap().take();
        if let Some((store, key)) = takeover {
            store
                .set(&key, &Value::String("other-producer".to_string()), None)
                .await?;
        }
        Ok(())
    }
}

const LOCKED: [(&str, LockStrategy); 4] = [
    ("UntilExecutedTick", LockStrategy::UntilExecuted),
    ("UntilExecutingTick", LockStrategy::UntilExecuting),
    ("WhileExecutingTick", LockStrategy::WhileExecuting),
    ("UntilCompletedTick", LockStrategy::UntilCompleted),
];

struct Perform(Arc<dyn Worker>);

#[async_trait]
impl Endpoint<ExecutionContext> for Perform {
    async fn call(&self, ctx: &mut ExecutionContext) -> RelayResult<()> {
        self.0.perform(ctx).await
    }
}

struct Harness {
    store: Arc<InMemoryStore>,
    queue: Arc<InMemoryTaskQueue>,
    schedules: CronScheduleStore,
    server: ServerChain,
    locks: UniqueJobLocks,
    registry: Arc<WorkerRegistry>,
    worker: Arc<TickWorker>,
    locked: Vec<Arc<LockedTick>>,
}

impl Harness {
    fn new() -> Self {
        let worker = Arc::new(TickWorker::default());
        let mut registry = WorkerRegistry::new()
            .with("Tick", worker.clone())
            .with("Tock", Arc::new(TickWorker::default()));
        let mut locked = Vec::new();
        for (class, strategy) in LOCKED {
            let tick = LockedTick::new(strategy);
            registry = registry.with(class, tick.clone());
            locked.push(tick);
        }
        let registry = Arc::new(registry);
        let config = Arc::new(RelayConfig::default());
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryTaskQueue::new());
        let kv: Arc<dyn KeyValueStore> = store.clone();

        let locks = UniqueJobLocks::new(kv.clone(), config.clone(), registry.clone());
        let client = Arc::new(JobClient::new(
            config.clone(),
            queue.clone(),
            registry.clone(),
            client_chain(&locks),
        ));
        let server = server_chain(kv.clone(), &config, &locks, client.clone());
        let schedules = CronScheduleStore::new(kv, &config, client);

        Self {
            store,
            queue,
            schedules,
            server,
            locks,
            registry,
            worker,
            locked,
        }
    }

    async fn run(&self, job: Job) -> RelayResult<()> {
        let worker = self.registry.resolve(&job.class)?;
        let mut ctx = ExecutionContext::new(job, None);
        self.server.invoke(&mut ctx, &Perform(worker)).await
    }

    fn locked(&self, class: &str) -> &LockedTick {
        let index = LOCKED.iter().position(|(c, _)| *c == class).unwrap();
        &self.locked[index]
    }

    async fn pop_instance(&self) -> Job {
        let mut tasks = self.queue.pop_all().await;
        assert_eq!(tasks.len(), 1);
        tasks.remove(0).request.job().unwrap()
    }

    fn performed(&self) -> usize {
        self.worker.performed.load(Ordering::SeqCst)
    }
}

fn schedule_config(id: &str, cron: &str) -> CronScheduleConfig {
    CronScheduleConfig {
        id: id.to_string(),
        cron: cron.to_string(),
        worker: "Tick".to_string(),
        args: vec![json!("report")],
        queue: None,
        tz: None,
    }
}

#[tokio::test]
async fn test_create_dispatches_first_instance() {
    let harness = Harness::new();
    let before = Utc::now();

    let schedule = harness
        .schedules
        .create("nightly", "0 0 * * *", "Tick", vec![json!(1)])
        .await
        .unwrap();

    let job_id = schedule.job_id.clone().unwrap();
    let task = harness.queue.find(schedule.task_id.as_deref().unwrap()).await.unwrap();
    let job = task.request.job().unwrap();
    assert_eq!(job.id, job_id);
    assert_eq!(job.cron_schedule_id(), Some("nightly"));
    assert!(job.cron_time_at().unwrap() > before);
    assert_eq!(task.request.schedule_time, job.cron_time_at());

    assert_eq!(harness.schedules.find("nightly").await.unwrap(), Some(schedule));
    assert_eq!(harness.schedules.all().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_save_unchanged_keeps_instance() {
    let harness = Harness::new();
    let first = harness
        .schedules
        .save(CronSchedule::new("hourly", "0 * * * *", "Tick"))
        .await
        .unwrap();
    let again = harness
        .schedules
        .save(CronSchedule::new("hourly", "0 * * * *", "Tick"))
        .await
        .unwrap();

    assert_eq!(first.job_id, again.job_id);
    assert_eq!(harness.queue.len().await, 1);
}

#[tokio::test]
async fn test_save_changed_replaces_instance() {
    let harness = Harness::new();
    let first = harness
        .schedules
        .save(CronSchedule::new("sync", "0 * * * *", "Tick"))
        .await
        .unwrap();
    let changed = harness
        .schedules
        .save(CronSchedule::new("sync", "*/5 * * * *", "Tock"))
        .await
        .unwrap();

    assert_ne!(first.job_id, changed.job_id);
    assert!(harness.queue.find(first.task_id.as_deref().unwrap()).await.is_none());
    let tasks = harness.queue.tasks().await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].request.job().unwrap().class, "Tock");
}

#[tokio::test]
async fn test_invalid_expression_is_not_persisted() {
    let harness = Harness::new();
    let err = harness
        .schedules
        .save(CronSchedule::new("broken", "every day", "Tick"))
        .await
        .unwrap_err();

    assert!(matches!(err, RelayError::InvalidCron { .. }));
    assert!(harness.schedules.find("broken").await.unwrap().is_none());
    assert!(harness.store.is_empty().await);
}

#[tokio::test]
async fn test_delete_cancels_pending_instance() {
    let harness = Harness::new();
    harness
        .schedules
        .create("cleanup", "0 3 * * *", "Tick", vec![])
        .await
        .unwrap();

    assert!(harness.schedules.delete("cleanup").await.unwrap());
    assert!(!harness.schedules.delete("cleanup").await.unwrap());
    assert!(harness.queue.is_empty().await);
    assert!(harness.schedules.all().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_load_from_config_syncs_schedules() {
    let harness = Harness::new();
    let configs = vec![
        schedule_config("a", "0 * * * *"),
        schedule_config("b", "30 * * * *"),
    ];
    harness.schedules.load_from_config(&configs).await.unwrap();
    assert_eq!(harness.queue.len().await, 2);

    harness
        .schedules
        .load_from_config(&configs[1..])
        .await
        .unwrap();

    let remaining: Vec<String> = harness
        .schedules
        .all()
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(remaining, vec!["b".to_string()]);
    assert_eq!(harness.queue.len().await, 1);
}

#[tokio::test]
async fn test_concurrent_successor_dispatch_happens_once() {
    let harness = Harness::new();
    harness
        .schedules
        .create("minutely", "* * * * *", "Tick", vec![])
        .await
        .unwrap();
    let instance = harness.pop_instance().await;

    let results = join_all((0..5).map(|_| harness.schedules.dispatch_successor(&instance))).await;
    let dispatched = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();

    assert_eq!(dispatched, 1);
    let successor = harness.pop_instance().await;
    assert!(successor.cron_time_at().unwrap() > instance.cron_time_at().unwrap());
}

#[tokio::test]
async fn test_stale_instance_is_skipped() {
    let harness = Harness::new();
    harness
        .schedules
        .create("minutely", "* * * * *", "Tick", vec![])
        .await
        .unwrap();

    let mut stale = Job::new("Tick", vec![]);
    stale.set_cron_instance("minutely", Utc::now());

    harness.run(stale).await.unwrap();
    assert_eq!(harness.performed(), 0);
    assert_eq!(harness.queue.len().await, 1);
}

#[tokio::test]
async fn test_failed_instance_dispatches_successor_only_after_success() {
    let harness = Harness::new();
    harness
        .schedules
        .create("minutely", "* * * * *", "Tick", vec![])
        .await
        .unwrap();
    let instance = harness.pop_instance().await;
    let flag_key = CronGuardMiddleware::flag_key(&instance.id);

    harness.worker.failing.store(true, Ordering::SeqCst);
    assert!(harness.run(instance.clone()).await.is_err());
    assert!(harness.store.get(&flag_key).await.unwrap().is_some());
    assert!(harness.queue.is_empty().await);

    harness.worker.failing.store(false, Ordering::SeqCst);
    harness.run(instance.clone()).await.unwrap();
    assert_eq!(harness.performed(), 2);
    assert!(harness.store.get(&flag_key).await.unwrap().is_none());

    let successor = harness.pop_instance().await;
    let schedule = harness.schedules.find("minutely").await.unwrap().unwrap();
    assert_eq!(schedule.job_id.as_deref(), Some(successor.id.as_str()));
}

#[tokio::test]
async fn test_retry_runs_after_schedule_moved_on() {
    let harness = Harness::new();
    harness
        .schedules
        .create("minutely", "* * * * *", "Tick", vec![])
        .await
        .unwrap();
    let instance = harness.pop_instance().await;

    harness.worker.failing.store(true, Ordering::SeqCst);
    assert!(harness.run(instance.clone()).await.is_err());

    // 计划被修改，最近分发的实例已不是 instance
    harness
        .schedules
        .save(CronSchedule::new("minutely", "*/2 * * * *", "Tick"))
        .await
        .unwrap();
    let replacement = harness.pop_instance().await;

    harness.worker.failing.store(false, Ordering::SeqCst);
    harness.run(instance).await.unwrap();

    assert_eq!(harness.performed(), 2);
    assert!(harness.queue.is_empty().await);
    let schedule = harness.schedules.find("minutely").await.unwrap().unwrap();
    assert_eq!(schedule.job_id.as_deref(), Some(replacement.id.as_str()));
}

#[tokio::test]
async fn test_locked_schedule_keeps_recurring() {
    for (class, strategy) in LOCKED {
        let harness = Harness::new();
        harness
            .schedules
            .create("locked", "* * * * *", class, vec![json!("report")])
            .await
            .unwrap();
        let mut instance = harness.pop_instance().await;

        for round in 1..=3 {
            harness
                .run(instance.clone())
                .await
                .unwrap_or_else(|e| panic!("{strategy:?} round {round}: {e}"));

            let successor = harness.pop_instance().await;
            assert!(successor.cron_time_at().unwrap() > instance.cron_time_at().unwrap());
            let flag_key = CronGuardMiddleware::flag_key(&instance.id);
            assert!(harness.store.get(&flag_key).await.unwrap().is_none());
            instance = successor;
        }

        assert_eq!(
            harness.locked(class).performed.load(Ordering::SeqCst),
            3,
            "{strategy:?}"
        );
        let schedule = harness.schedules.find("locked").await.unwrap().unwrap();
        assert_eq!(schedule.job_id.as_deref(), Some(instance.id.as_str()));
    }
}

#[tokio::test]
async fn test_until_executed_lock_passes_to_successor() {
    let harness = Harness::new();
    harness
        .schedules
        .create("locked", "* * * * *", "UntilExecutedTick", vec![json!("report")])
        .await
        .unwrap();
    let instance = harness.pop_instance().await;
    let lock = harness.locks.for_job(&instance);
    assert_eq!(lock.owner().await.unwrap().as_deref(), Some(instance.id.as_str()));

    harness.run(instance).await.unwrap();

    let successor = harness.pop_instance().await;
    assert_eq!(lock.owner().await.unwrap().as_deref(), Some(successor.id.as_str()));
}

#[tokio::test]
async fn test_suppressed_successor_is_retried_without_rerunning_body() {
    let harness = Harness::new();
    harness
        .schedules
        .create("locked", "* * * * *", "UntilCompletedTick", vec![json!("report")])
        .await
        .unwrap();
    let instance = harness.pop_instance().await;
    let flag_key = CronGuardMiddleware::flag_key(&instance.id);
    let lock_key = harness.locks.for_job(&instance).lock_key();
    let tick = harness.locked("UntilCompletedTick");

    // 执行期间另一个生产者以相同指纹加锁，后继调度被拒绝
    let kv: Arc<dyn KeyValueStore> = harness.store.clone();
    *tick.takeover.lock().unwrap() = Some((kv, lock_key.clone()));

    let err = harness.run(instance.clone()).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(tick.performed.load(Ordering::SeqCst), 1);
    assert_eq!(
        harness.store.get(&flag_key).await.unwrap(),
        Some(Value::String(PERFORMED.to_string()))
    );
    assert!(harness.queue.is_empty().await);
    let schedule = harness.schedules.find("locked").await.unwrap().unwrap();
    assert_eq!(schedule.job_id.as_deref(), Some(instance.id.as_str()));

    harness.store.delete(&lock_key).await.unwrap();
    harness.run(instance).await.unwrap();

    assert_eq!(tick.performed.load(Ordering::SeqCst), 1);
    assert!(harness.store.get(&flag_key).await.unwrap().is_none());
    let successor = harness.pop_instance().await;
    let schedule = harness.schedules.find("locked").await.unwrap().unwrap();
    assert_eq!(schedule.job_id.as_deref(), Some(successor.id.as_str()));
}
