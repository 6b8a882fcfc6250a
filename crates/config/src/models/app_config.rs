use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    api_observability::{ApiConfig, ObservabilityConfig},
    broadcast::BroadcastConfig,
    database::DatabaseConfig,
    queue::QueueConfig,
    worker::{RecoveryConfig, RetryConfig, TaskDefaultsConfig, WorkerConfig},
};
use crate::validation::ConfigValidator;

/// 默认配置文件搜索路径
const DEFAULT_CONFIG_PATHS: [&str; 2] = ["config/taskq.toml", "taskq.toml"];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub retry: RetryConfig,
    pub tasks: TaskDefaultsConfig,
    pub recovery: RecoveryConfig,
    pub broadcast: BroadcastConfig,
    pub api: ApiConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 加载配置：显式文件（不存在则报错）或默认路径，之后叠加 `TASKQ_` 前缀的环境变量，
    /// 例如 `TASKQ_WORKER__POOL_SIZE=8`
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else if let Some(path) = DEFAULT_CONFIG_PATHS
            .iter()
            .find(|path| Path::new(path).exists())
        {
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix("TASKQ")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }
}

impl ConfigValidator for AppConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        self.database.validate()?;
        self.queue.validate()?;
        self.worker.validate()?;
        self.retry.validate()?;
        self.tasks.validate()?;
        self.recovery.validate()?;
        self.broadcast.validate()?;
        self.api.validate()?;
        self.observability.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{OverflowPolicy, QueueBackend};
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue.backend, QueueBackend::Memory);
        assert_eq!(config.broadcast.overflow_policy, OverflowPolicy::DropOldest);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [worker]
            pool_size = 16

            [retry]
            base_delay_ms = 500
            max_delay_ms = 60000
            jitter_factor = 0.0
            "#,
        )
        .expect("partial config should parse");

        assert_eq!(config.worker.pool_size, 16);
        assert_eq!(config.worker.worker_id_prefix, "worker");
        assert_eq!(config.retry.base_delay_ms, 500);
        assert_eq!(config.tasks.default_max_retries, 3);
    }

    #[test]
    fn test_bundled_config_file_parses() {
        let config = AppConfig::from_toml(include_str!("../../../../config/taskq.toml"))
            .expect("bundled config should be valid");
        assert_eq!(config.worker.pool_size, 4);
        assert!(config.api.enabled);
        assert_eq!(config.queue.backend, QueueBackend::Memory);
    }

    #[test]
    fn test_invalid_toml_is_rejected() {
        let result = AppConfig::from_toml(
            r#"
            [worker]
            pool_size = 0
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = AppConfig::default();
        let serialized = config.to_toml().expect("serialize");
        let parsed = AppConfig::from_toml(&serialized).expect("parse");
        assert_eq!(parsed.worker.pool_size, config.worker.pool_size);
        assert_eq!(parsed.database.url, config.database.url);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            r#"
            [database]
            url = "memory"

            [queue]
            backend = "memory"
            key_prefix = "ingest"
            "#
        )
        .expect("write config");

        let path = file.path().to_string_lossy().to_string();
        let config = AppConfig::load(Some(&path)).expect("load config");
        assert!(config.database.is_memory());
        assert_eq!(config.queue.key_prefix, "ingest");
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(AppConfig::load(Some("/definitely/not/here/taskq.toml")).is_err());
    }
}
