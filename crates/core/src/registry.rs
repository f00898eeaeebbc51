use std::collections::HashMap;
use std::sync::Arc;

use crate::traits::{Worker, WorkerOptions};
use crate::{RelayError, RelayResult};

/// Worker注册表
///
/// 类标识到Worker实现的封闭映射，启动前构建完成，之后只读共享。
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    workers: HashMap<String, Arc<dyn Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            workers: HashMap::new(),
        }
    }

    pub fn register<S: Into<String>>(&mut self, class: S, worker: Arc<dyn Worker>) -> &mut Self {
        self.workers.insert(class.into(), worker);
        self
    }

    pub fn with<S: Into<String>>(mut self, class: S, worker: Arc<dyn Worker>) -> Self {
        self.register(class, worker);
        self
    }

    pub fn get(&self, class: &str) -> Option<Arc<dyn Worker>> {
        self.workers.get(class).cloned()
    }

    /// 解析Worker，未注册的类为不可重试的终态错误
    pub fn resolve(&self, class: &str) -> RelayResult<Arc<dyn Worker>> {
        self.get(class)
            .ok_or_else(|| RelayError::InvalidWorker(class.to_string()))
    }

    /// 未注册的类返回默认选项
    pub fn options(&self, class: &str) -> WorkerOptions {
        self.workers
            .get(class)
            .map(|w| w.options())
            .unwrap_or_default()
    }

    pub fn contains(&self, class: &str) -> bool {
        self.workers.contains_key(class)
    }

    pub fn classes(&self) -> Vec<String> {
        let mut classes: Vec<String> = self.workers.keys().cloned().collect();
        classes.sort();
        classes
    }
}
