use std::path::{Path, PathBuf};

use ::config::{Config, Environment, File};
use tracing::{debug, info};

use crate::models::ConflictStrategy;
use crate::{RelayError, RelayResult};

use super::RelayConfig;

/// 配置加载器
///
/// 加载顺序（后者覆盖前者）：内置默认值、可选的配置文件、环境变量。
pub struct ConfigLoader {
    file: Option<PathBuf>,
    env_prefix: String,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            file: None,
            env_prefix: "TASKRELAY".to_string(),
        }
    }

    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.file = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_env_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    pub fn load(&self) -> RelayResult<RelayConfig> {
        let defaults = Config::try_from(&RelayConfig::default())
            .map_err(|e| RelayError::config_error(format!("默认配置无效: {e}")))?;

        let mut builder = Config::builder().add_source(defaults);

        if let Some(path) = &self.file {
            debug!("Loading configuration file: {}", path.display());
            builder = builder.add_source(File::from(path.as_path()).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(&self.env_prefix)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: RelayConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| RelayError::config_error(format!("配置加载失败: {e}")))?;

        validate(&config)?;
        info!(
            namespace = %config.namespace,
            default_queue = %config.default_queue,
            "Configuration loaded"
        );
        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// 校验配置的一致性
pub fn validate(config: &RelayConfig) -> RelayResult<()> {
    if config.namespace.trim().is_empty() {
        return Err(RelayError::config_error("namespace 不能为空"));
    }
    if config.processor_url.trim().is_empty() {
        return Err(RelayError::config_error("processor_url 不能为空"));
    }
    if config.default_queue.trim().is_empty() {
        return Err(RelayError::config_error("default_queue 不能为空"));
    }

    let unique = &config.unique_job;
    if unique.lock_ttl_secs == 0 {
        return Err(RelayError::config_error("unique_job.lock_ttl_secs 必须大于0"));
    }
    if unique.provisional_lock_ttl_secs == 0 || unique.provisional_lock_ttl_secs >= unique.lock_ttl_secs {
        return Err(RelayError::config_error(
            "unique_job.provisional_lock_ttl_secs 必须大于0且小于 lock_ttl_secs",
        ));
    }
    if ConflictStrategy::parse(&unique.on_conflict).is_none() {
        return Err(RelayError::config_error(format!(
            "未知的冲突策略: {}",
            unique.on_conflict
        )));
    }

    let lock = &config.store_lock;
    if lock.ttl_ms == 0 || lock.retry_interval_ms == 0 {
        return Err(RelayError::config_error(
            "store_lock.ttl_ms 和 store_lock.retry_interval_ms 必须大于0",
        ));
    }

    for schedule in &config.cron.schedules {
        if schedule.id.trim().is_empty() || schedule.worker.trim().is_empty() {
            return Err(RelayError::config_error(format!(
                "定时计划缺少 id 或 worker: {schedule:?}"
            )));
        }
    }

    Ok(())
}
