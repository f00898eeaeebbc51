//! 默认中间件链
//!
//! 客户端：唯一锁。服务端由外到内：批次、唯一锁、定时实例守卫。
//! 守卫在唯一锁内侧，分发后继前自行移交锁。

use std::sync::Arc;

use taskrelay_core::{KeyValueStore, RelayConfig};

use crate::batch::{BatchMiddleware, BatchTracker};
use crate::client::JobClient;
use crate::cron::{CronGuardMiddleware, CronScheduleStore};
use crate::middleware::{ClientChain, ServerChain};
use crate::unique_job::{UniqueJobClientMiddleware, UniqueJobLocks, UniqueJobServerMiddleware};

pub fn client_chain(locks: &UniqueJobLocks) -> ClientChain {
    let locks = locks.clone();
    let mut chain = ClientChain::new();
    chain.add(move || UniqueJobClientMiddleware::new(locks.clone()));
    chain
}

pub fn server_chain(
    store: Arc<dyn KeyValueStore>,
    config: &RelayConfig,
    locks: &UniqueJobLocks,
    client: Arc<JobClient>,
) -> ServerChain {
    let tracker = BatchTracker::new(store.clone(), config, client.registry().clone());
    let schedules = CronScheduleStore::new(store.clone(), config, client.clone());
    let flag_ttl = config.cron.flag_ttl();
    let locks = locks.clone();

    let mut chain = ServerChain::new();
    {
        let client = client.clone();
        chain.add(move || BatchMiddleware::new(tracker.clone(), client.clone()));
    }
    {
        let locks = locks.clone();
        chain.add(move || UniqueJobServerMiddleware::new(locks.clone(), client.clone()));
    }
    chain.add(move || {
        CronGuardMiddleware::new(store.clone(), schedules.clone(), locks.clone(), flag_ttl)
    });
    chain
}
