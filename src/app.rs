use std::sync::Arc;

use anyhow::{Context, Result};
use taskrelay_core::models::{CronSchedule, Job};
use taskrelay_core::{
    init_logging, KeyValueStore, RelayConfig, TaskBackend, Worker, WorkerRegistry,
};
use taskrelay_dispatcher::chains::{client_chain, server_chain};
use taskrelay_dispatcher::{BatchTracker, CronScheduleStore, JobClient, UniqueJobLocks};
use taskrelay_infrastructure::{InMemoryStore, InMemoryTaskQueue, RedisStore};
use taskrelay_worker::{ExecutionOutcome, LocalDelivery, Processor};
use tracing::{info, warn};

/// 存储后端选择
enum StoreChoice {
    Memory,
    Redis,
    Custom(Arc<dyn KeyValueStore>),
}

/// 应用构建器
///
/// 未指定投递后端时使用进程内队列，可以通过 [`TaskRelay::local_delivery`] 执行。
pub struct TaskRelayBuilder {
    config: RelayConfig,
    registry: WorkerRegistry,
    store: StoreChoice,
    backend: Option<Arc<dyn TaskBackend>>,
    init_logging: bool,
}

impl TaskRelayBuilder {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            registry: WorkerRegistry::new(),
            store: StoreChoice::Memory,
            backend: None,
            init_logging: false,
        }
    }

    pub fn worker<S: Into<String>>(mut self, class: S, worker: Arc<dyn Worker>) -> Self {
        self.registry.register(class, worker);
        self
    }

    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = StoreChoice::Custom(store);
        self
    }

    /// 使用配置中的Redis地址作为共享存储
    pub fn redis_store(mut self) -> Self {
        self.store = StoreChoice::Redis;
        self
    }

    pub fn backend(mut self, backend: Arc<dyn TaskBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_logging(mut self) -> Self {
        self.init_logging = true;
        self
    }

    pub async fn build(self) -> Result<TaskRelay> {
        if self.init_logging {
            // 订阅者已存在时沿用已有的
            if let Err(e) = init_logging(&self.config.logging) {
                warn!("日志系统已初始化，跳过: {}", e);
            }
        }

        let config = Arc::new(self.config);
        let registry = Arc::new(self.registry);

        let store: Arc<dyn KeyValueStore> = match self.store {
            StoreChoice::Memory => Arc::new(InMemoryStore::new()),
            StoreChoice::Redis => Arc::new(
                RedisStore::connect(&config.redis, &config.namespace)
                    .await
                    .context("连接Redis存储失败")?,
            ),
            StoreChoice::Custom(store) => store,
        };

        let mut local_queue = None;
        let backend: Arc<dyn TaskBackend> = match self.backend {
            Some(backend) => backend,
            None => {
                let queue = Arc::new(InMemoryTaskQueue::new());
                local_queue = Some(queue.clone());
                queue
            }
        };

        let locks = UniqueJobLocks::new(store.clone(), config.clone(), registry.clone());
        let client = Arc::new(JobClient::new(
            config.clone(),
            backend,
            registry.clone(),
            client_chain(&locks),
        ));
        let processor = Arc::new(Processor::new(
            config.clone(),
            registry.clone(),
            client.clone(),
            server_chain(store.clone(), &config, &locks, client.clone()),
        ));
        let schedules = CronScheduleStore::new(store.clone(), &config, client.clone());
        let tracker = BatchTracker::new(store.clone(), &config, registry.clone());

        info!(
            "协调层已初始化: 命名空间 {}, 已注册 {} 个Worker",
            config.namespace,
            registry.classes().len()
        );

        Ok(TaskRelay {
            config,
            store,
            client,
            processor,
            schedules,
            tracker,
            local_queue,
        })
    }
}

/// 组装完成的协调层
pub struct TaskRelay {
    config: Arc<RelayConfig>,
    store: Arc<dyn KeyValueStore>,
    client: Arc<JobClient>,
    processor: Arc<Processor>,
    schedules: CronScheduleStore,
    tracker: BatchTracker,
    local_queue: Option<Arc<InMemoryTaskQueue>>,
}

impl TaskRelay {
    pub fn builder(config: RelayConfig) -> TaskRelayBuilder {
        TaskRelayBuilder::new(config)
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn client(&self) -> &Arc<JobClient> {
        &self.client
    }

    pub fn processor(&self) -> &Arc<Processor> {
        &self.processor
    }

    pub fn schedules(&self) -> &CronScheduleStore {
        &self.schedules
    }

    pub fn batches(&self) -> &BatchTracker {
        &self.tracker
    }

    pub async fn schedule(&self, job: Job) -> Result<Option<String>> {
        Ok(self.client.schedule(job).await?)
    }

    /// 处理端点：执行一次投递回来的请求体
    pub async fn process(&self, body: &str, retries: u32, task_id: Option<String>) -> ExecutionOutcome {
        self.processor.process(body, retries, task_id).await
    }

    /// 同步配置文件中声明的定时计划
    pub async fn sync_cron_schedules(&self) -> Result<Vec<CronSchedule>> {
        let schedules = self
            .schedules
            .load_from_config(&self.config.cron.schedules)
            .await
            .context("同步定时计划失败")?;
        Ok(schedules)
    }

    /// 使用进程内队列时返回对应的本地投递器
    pub fn local_delivery(&self) -> Option<LocalDelivery> {
        self.local_queue
            .as_ref()
            .map(|queue| LocalDelivery::new(queue.clone(), self.processor.clone(), &self.config))
    }

    pub fn local_queue(&self) -> Option<&Arc<InMemoryTaskQueue>> {
        self.local_queue.as_ref()
    }
}
