pub mod memory_queue;
pub mod redis_queue;

use std::sync::Arc;

use taskq_config::{QueueBackend, QueueConfig};
use taskq_domain::ports::TaskQueue;
use taskq_errors::{EngineError, EngineResult};
use tracing::info;

pub use self::memory_queue::InMemoryTaskQueue;
pub use self::redis_queue::RedisTaskQueue;

/// 根据配置创建队列后端
pub async fn create_task_queue(config: &QueueConfig) -> EngineResult<Arc<dyn TaskQueue>> {
    match config.backend {
        QueueBackend::Memory => {
            info!("使用内存队列");
            Ok(Arc::new(InMemoryTaskQueue::new()))
        }
        QueueBackend::Redis => {
            let url = config
                .redis_url
                .as_deref()
                .ok_or_else(|| EngineError::config_error("Redis队列需要配置 queue.redis_url"))?;
            info!("使用Redis队列: prefix={}", config.key_prefix);
            Ok(Arc::new(
                RedisTaskQueue::connect(url, &config.key_prefix).await?,
            ))
        }
    }
}
