use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use mockall::mock;
use serde_json::{json, Value};
use taskrelay_core::models::{
    ConflictStrategy, ExecutionContext, Job, LockStrategy, TaskRequest,
};
use taskrelay_core::{
    KeyValueStore, RelayConfig, RelayError, RelayResult, TaskBackend, Worker, WorkerOptions,
    WorkerRegistry,
};
use taskrelay_dispatcher::chains::{client_chain, server_chain};
use taskrelay_dispatcher::{Endpoint, JobClient, ServerChain, UniqueJobLocks};
use taskrelay_infrastructure::{InMemoryStore, InMemoryTaskQueue};

mock! {
    pub Backend {}

    #[async_trait]
    impl TaskBackend for Backend {
        async fn schedule(&self, request: TaskRequest) -> RelayResult<String>;
        async fn delete(&self, task_id: &str) -> RelayResult<bool>;
    }
}

/// 提交请求时让另一个持有者改写唯一锁的后端
struct StealingBackend {
    queue: Arc<InMemoryTaskQueue>,
    target: Mutex<Option<(Arc<dyn KeyValueStore>, String)>>,
}

#[async_trait]
impl TaskBackend for StealingBackend {
    async fn schedule(&self, request: TaskRequest) -> RelayResult<String> {
        let target = self.target.lock().unwrap().take();
        if let Some((store, key)) = target {
            store
                .set(&key, &Value::String("intruder".to_string()), None)
                .await?;
        }
        self.queue.schedule(request).await
    }

    async fn delete(&self, task_id: &str) -> RelayResult<bool> {
        self.queue.delete(task_id).await
    }
}

struct LockedWorker {
    options: WorkerOptions,
    performed: AtomicUsize,
    fail_with: Option<fn() -> RelayError>,
}

impl LockedWorker {
    fn new(options: WorkerOptions) -> Arc<Self> {
        Arc::new(Self {
            options,
            performed: AtomicUsize::new(0),
            fail_with: None,
        })
    }

    fn failing(options: WorkerOptions, fail_with: fn() -> RelayError) -> Arc<Self> {
        Arc::new(Self {
            options,
            performed: AtomicUsize::new(0),
            fail_with: Some(fail_with),
        })
    }

    fn performed(&self) -> usize {
        self.performed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Worker for LockedWorker {
    fn options(&self) -> WorkerOptions {
        self.options.clone()
    }

    /// 只有第一个参数参与唯一性
    fn unique_args(&self, args: &[serde_json::Value]) -> Vec<serde_json::Value> {
        args.iter().take(1).cloned().collect()
    }

    async fn perform(&self, _ctx: &mut ExecutionContext) -> RelayResult<()> {
        self.performed.fetch_add(1, Ordering::SeqCst);
        match self.fail_with {
            Some(make) => Err(make()),
            None => Ok(()),
        }
    }
}

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
    locks: UniqueJobLocks,
    client: Arc<JobClient>,
    server: ServerChain,
    registry: Arc<WorkerRegistry>,
}

impl Harness {
    fn new(registry: WorkerRegistry) -> Self {
        let queue = Arc::new(InMemoryTaskQueue::new());
        Self::with_backend(registry, queue.clone(), queue)
    }

    fn with_backend(
        registry: WorkerRegistry,
        queue: Arc<InMemoryTaskQueue>,
        backend: Arc<dyn TaskBackend>,
    ) -> Self {
        let config = Arc::new(RelayConfig::default());
        let registry = Arc::new(registry);
        let store = Arc::new(InMemoryStore::new());
        let kv: Arc<dyn KeyValueStore> = store.clone();

        let locks = UniqueJobLocks::new(kv.clone(), config.clone(), registry.clone());
        let client = Arc::new(JobClient::new(
            config.clone(),
            backend,
            registry.clone(),
            client_chain(&locks),
        ));
        let server = server_chain(kv, &config, &locks, client.clone());

        Self {
            store,
            queue,
            locks,
            client,
            server,
            registry,
        }
    }

    /// 取出队列中的第一个任务并经过服务端链执行
    async fn execute_next(&self) -> RelayResult<Job> {
        let task = self.queue.pop_all().await.remove(0);
        let job = task.request.job()?;
        let worker = self.registry.resolve(&job.class)?;
        let mut ctx = ExecutionContext::new(job, Some(task.id));
        self.server.invoke(&mut ctx, &Perform(worker)).await?;
        Ok(ctx.job)
    }
}

fn options(lock: LockStrategy) -> WorkerOptions {
    WorkerOptions::default().with_lock(lock)
}

#[tokio::test]
async fn test_lock_is_exclusive_under_contention() {
    let worker = LockedWorker::new(options(LockStrategy::UntilExecuted));
    let harness = Harness::new(WorkerRegistry::new().with("Report", worker));

    let handles: Vec<_> = (0..8)
        .map(|_| harness.locks.for_job(&Job::new("Report", vec![json!(42)])))
        .collect();
    let results = join_all(handles.iter().map(|u| u.lock(Duration::from_secs(60)))).await;

    let acquired: Vec<_> = results.iter().filter(|r| r.is_ok()).collect();
    assert_eq!(acquired.len(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(RelayError::is_lock_error));

    // 持有者重复加锁只刷新过期时间
    let winner = handles
        .iter()
        .zip(&results)
        .find_map(|(u, r)| r.is_ok().then_some(u))
        .unwrap();
    winner.lock(Duration::from_secs(120)).await.unwrap();
    assert_eq!(winner.owner().await.unwrap().as_deref(), Some(winner.job_id()));
}

#[tokio::test]
async fn test_unique_args_scope_the_fingerprint() {
    let worker = LockedWorker::new(options(LockStrategy::UntilExecuted));
    let harness = Harness::new(WorkerRegistry::new().with("Report", worker));

    let a = harness.locks.for_job(&Job::new("Report", vec![json!(1), json!("a")]));
    let b = harness.locks.for_job(&Job::new("Report", vec![json!(1), json!("b")]));
    let c = harness.locks.for_job(&Job::new("Report", vec![json!(2), json!("a")]));

    assert_eq!(a.unique_id(), b.unique_id());
    assert_ne!(a.unique_id(), c.unique_id());
}

#[tokio::test]
async fn test_until_executed_blocks_until_execution_ends() {
    let worker = LockedWorker::new(options(LockStrategy::UntilExecuted));
    let harness = Harness::new(WorkerRegistry::new().with("Report", worker.clone()));

    let first = harness
        .client
        .schedule(Job::new("Report", vec![json!(7)]))
        .await
        .unwrap();
    assert!(first.is_some());

    let second = harness.client.schedule(Job::new("Report", vec![json!(7)])).await;
    assert!(second.unwrap_err().is_lock_error());
    assert_eq!(harness.queue.len().await, 1);

    harness.execute_next().await.unwrap();
    assert_eq!(worker.performed(), 1);

    let third = harness
        .client
        .schedule(Job::new("Report", vec![json!(7)]))
        .await
        .unwrap();
    assert!(third.is_some());
}

#[tokio::test]
async fn test_until_executing_upgrades_provisional_lock() {
    let worker = LockedWorker::new(options(LockStrategy::UntilExecuting));
    let harness = Harness::new(WorkerRegistry::new().with("Report", worker));

    let job = Job::new("Report", vec![json!(1)]);
    let unique = harness.locks.for_job(&job);
    harness.client.schedule(job).await.unwrap().unwrap();

    let ttl = harness.store.ttl(&unique.lock_key()).await.unwrap();
    assert!(ttl > unique.provisional_ttl());

    // 执行开始即释放
    harness.execute_next().await.unwrap();
    assert!(unique.owner().await.unwrap().is_none());
}

#[tokio::test]
async fn test_schedule_conflict_strategies() {
    let reject = LockedWorker::new(
        options(LockStrategy::UntilExecuting).with_conflict(ConflictStrategy::Reject),
    );
    let raise = LockedWorker::new(
        options(LockStrategy::UntilExecuting).with_schedule_conflict(ConflictStrategy::Raise),
    );
    let harness = Harness::new(
        WorkerRegistry::new()
            .with("Rejecting", reject)
            .with("Raising", raise),
    );

    harness.client.schedule(Job::new("Rejecting", vec![json!(1)])).await.unwrap();
    let suppressed = harness
        .client
        .schedule(Job::new("Rejecting", vec![json!(1)]))
        .await
        .unwrap();
    assert!(suppressed.is_none());

    harness.client.schedule(Job::new("Raising", vec![json!(1)])).await.unwrap();
    let raised = harness.client.schedule(Job::new("Raising", vec![json!(1)])).await;
    assert!(raised.unwrap_err().is_lock_error());

    assert_eq!(harness.queue.len().await, 2);
}

#[tokio::test]
async fn test_while_executing_conflict_reschedules() {
    let worker = LockedWorker::new(
        options(LockStrategy::WhileExecuting)
            .with_execute_conflict(ConflictStrategy::Reschedule),
    );
    let harness = Harness::new(WorkerRegistry::new().with("Sync", worker.clone()));

    let job = Job::new("Sync", vec![json!("acct-1")]);
    let job_id = job.id.clone();
    harness.client.schedule(job).await.unwrap();

    // 另一个实例正在执行
    let holder = harness.locks.for_job(&Job::new("Sync", vec![json!("acct-1")]));
    holder.lock(Duration::from_secs(60)).await.unwrap();

    let executed = harness.execute_next().await.unwrap();
    assert!(executed.reenqueued);
    assert_eq!(worker.performed(), 0);

    let task = harness.queue.find_by_job_id(&job_id).await.unwrap();
    assert!(task.request.schedule_time.is_some());

    holder.unlock().await.unwrap();
    harness.execute_next().await.unwrap();
    assert_eq!(worker.performed(), 1);
    assert!(holder.owner().await.unwrap().is_none());
}

#[tokio::test]
async fn test_while_executing_conflict_raise_and_reject() {
    let raise = LockedWorker::new(
        options(LockStrategy::WhileExecuting).with_conflict(ConflictStrategy::Raise),
    );
    let reject = LockedWorker::new(options(LockStrategy::WhileExecuting));
    let harness = Harness::new(
        WorkerRegistry::new()
            .with("Raising", raise.clone())
            .with("Rejecting", reject.clone()),
    );

    for class in ["Raising", "Rejecting"] {
        harness
            .locks
            .for_job(&Job::new(class, vec![json!(1)]))
            .lock(Duration::from_secs(60))
            .await
            .unwrap();
        harness.client.schedule(Job::new(class, vec![json!(1)])).await.unwrap();

        let result = harness.execute_next().await;
        if class == "Raising" {
            assert!(result.unwrap_err().is_lock_error());
        } else {
            result.unwrap();
        }
    }

    assert_eq!(raise.performed(), 0);
    assert_eq!(reject.performed(), 0);
    assert!(harness.queue.is_empty().await);
}

#[tokio::test]
async fn test_until_completed_keeps_lock_for_retries() {
    let flaky = LockedWorker::failing(options(LockStrategy::UntilCompleted), || {
        RelayError::job_failed("flaky")
    });
    let dead = LockedWorker::failing(options(LockStrategy::UntilCompleted), || {
        RelayError::dead("gone")
    });
    let harness = Harness::new(
        WorkerRegistry::new()
            .with("Flaky", flaky)
            .with("Dead", dead),
    );

    let flaky_job = Job::new("Flaky", vec![json!(1)]);
    let flaky_lock = harness.locks.for_job(&flaky_job);
    harness.client.schedule(flaky_job.clone()).await.unwrap();
    assert!(harness.execute_next().await.is_err());
    assert_eq!(flaky_lock.owner().await.unwrap().as_deref(), Some(flaky_job.id.as_str()));

    let dead_job = Job::new("Dead", vec![json!(1)]);
    let dead_lock = harness.locks.for_job(&dead_job);
    harness.client.schedule(dead_job).await.unwrap();
    assert!(harness.execute_next().await.unwrap_err().is_dead());
    assert!(dead_lock.owner().await.unwrap().is_none());
}

#[tokio::test]
async fn test_backend_failure_releases_lock() {
    let mut backend = MockBackend::new();
    backend
        .expect_schedule()
        .times(2)
        .returning(|_| Err(RelayError::backend("unavailable")));

    let harness = Harness::with_backend(
        WorkerRegistry::new()
            .with("Executing", LockedWorker::new(options(LockStrategy::UntilExecuting)))
            .with("Executed", LockedWorker::new(options(LockStrategy::UntilExecuted))),
        Arc::new(InMemoryTaskQueue::new()),
        Arc::new(backend),
    );

    for class in ["Executing", "Executed"] {
        let job = Job::new(class, vec![json!(1)]);
        let unique = harness.locks.for_job(&job);

        let err = harness.client.schedule(job).await.unwrap_err();
        assert!(matches!(err, RelayError::Backend(_)));
        assert!(unique.owner().await.unwrap().is_none());
    }
    assert!(harness.store.is_empty().await);
}

#[tokio::test]
async fn test_lock_per_batch_scopes_fingerprint_to_parent() {
    let scoped = LockedWorker::new(options(LockStrategy::UntilExecuted).with_lock_per_batch(true));
    let global = LockedWorker::new(options(LockStrategy::UntilExecuted));
    let harness = Harness::new(
        WorkerRegistry::new()
            .with("Scoped", scoped)
            .with("Global", global),
    );
    let child = |class: &str, parent: &str| {
        let mut job = Job::new(class, vec![json!(1)]);
        job.set_parent_batch_id(parent);
        job
    };

    assert_ne!(
        harness.locks.for_job(&child("Scoped", "batch-a")).unique_id(),
        harness.locks.for_job(&child("Scoped", "batch-b")).unique_id()
    );
    assert_eq!(
        harness.locks.for_job(&child("Global", "batch-a")).unique_id(),
        harness.locks.for_job(&child("Global", "batch-b")).unique_id()
    );

    // 不同父批次下的相同参数互不冲突，同一父批次内冲突
    let client = &harness.client;
    assert!(client.schedule(child("Scoped", "batch-a")).await.unwrap().is_some());
    assert!(client.schedule(child("Scoped", "batch-b")).await.unwrap().is_some());
    let same_parent = client.schedule(child("Scoped", "batch-a")).await;
    assert!(same_parent.unwrap_err().is_lock_error());

    assert!(client.schedule(child("Global", "batch-a")).await.unwrap().is_some());
    let other_parent = client.schedule(child("Global", "batch-b")).await;
    assert!(other_parent.unwrap_err().is_lock_error());

    assert_eq!(harness.queue.len().await, 3);
}

#[tokio::test]
async fn test_failed_lock_upgrade_keeps_schedule() {
    let worker = LockedWorker::new(options(LockStrategy::UntilExecuting));
    let queue = Arc::new(InMemoryTaskQueue::new());
    let backend = Arc::new(StealingBackend {
        queue: queue.clone(),
        target: Mutex::new(None),
    });
    let harness = Harness::with_backend(
        WorkerRegistry::new().with("Report", worker),
        queue,
        backend.clone(),
    );

    let job = Job::new("Report", vec![json!(1)]);
    let unique = harness.locks.for_job(&job);
    let kv: Arc<dyn KeyValueStore> = harness.store.clone();
    *backend.target.lock().unwrap() = Some((kv, unique.lock_key()));

    // 提交期间锁被抢走，升级失败只记录日志
    let task_id = harness.client.schedule(job).await.unwrap();
    assert!(task_id.is_some());
    assert!(harness.queue.find(task_id.as_deref().unwrap()).await.is_some());
    assert_eq!(unique.owner().await.unwrap().as_deref(), Some("intruder"));
}
