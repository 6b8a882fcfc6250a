use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueueBackend {
    /// 进程内优先级队列，仅适用于单实例部署
    #[default]
    Memory,
    /// Redis 有序集合，多个调度实例共享
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub backend: QueueBackend,
    pub redis_url: Option<String>,
    pub key_prefix: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::Memory,
            redis_url: None,
            key_prefix: "taskq".to_string(),
        }
    }
}

impl ConfigValidator for QueueConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_not_empty(&self.key_prefix, "queue.key_prefix")?;
        if self.backend == QueueBackend::Redis {
            match &self.redis_url {
                Some(url) => ValidationUtils::validate_url(url, "queue.redis_url")?,
                None => {
                    return Err(crate::ConfigError::Validation(
                        "queue.redis_url is required when queue.backend = redis".to_string(),
                    ))
                }
            }
        }
        Ok(())
    }
}
