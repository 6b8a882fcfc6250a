use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

/// Worker 池配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub pool_size: usize,
    pub worker_id_prefix: String,
    /// 队列为空时的最短等待时间（毫秒）
    pub idle_poll_min_ms: u64,
    /// 队列为空时的最长等待时间（毫秒），等待时间在两者之间指数增长
    pub idle_poll_max_ms: u64,
    /// 执行期间检查存储中的取消状态的间隔（毫秒）
    pub cancel_poll_interval_ms: u64,
    pub shutdown_timeout_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            worker_id_prefix: "worker".to_string(),
            idle_poll_min_ms: 50,
            idle_poll_max_ms: 2_000,
            cancel_poll_interval_ms: 1_000,
            shutdown_timeout_seconds: 30,
        }
    }
}

impl ConfigValidator for WorkerConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_count(self.pool_size, "worker.pool_size", 1024)?;
        ValidationUtils::validate_not_empty(&self.worker_id_prefix, "worker.worker_id_prefix")?;
        ValidationUtils::validate_range_ms(
            self.idle_poll_min_ms,
            self.idle_poll_max_ms,
            "worker.idle_poll_ms",
        )?;
        if self.cancel_poll_interval_ms == 0 {
            return Err(crate::ConfigError::Validation(
                "worker.cancel_poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        ValidationUtils::validate_timeout_seconds(
            self.shutdown_timeout_seconds,
            "worker.shutdown_timeout_seconds",
        )?;
        Ok(())
    }
}

/// 重试退避配置：`delay = base * 2^retry_count`，上限为 `max_delay_ms`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// 随机抖动比例（0.0-1.0）
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 300_000,
            jitter_factor: 0.1,
        }
    }
}

impl ConfigValidator for RetryConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_range_ms(self.base_delay_ms, self.max_delay_ms, "retry.delay_ms")?;
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(crate::ConfigError::Validation(format!(
                "retry.jitter_factor must be within [0, 1], got {}",
                self.jitter_factor
            )));
        }
        Ok(())
    }
}

/// 提交任务时的默认值与上限
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskDefaultsConfig {
    pub default_timeout_seconds: u64,
    pub max_timeout_seconds: u64,
    pub default_max_retries: u32,
    pub max_retries_limit: u32,
}

impl Default for TaskDefaultsConfig {
    fn default() -> Self {
        Self {
            default_timeout_seconds: 300,
            max_timeout_seconds: 3_600,
            default_max_retries: 3,
            max_retries_limit: 10,
        }
    }
}

impl ConfigValidator for TaskDefaultsConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_timeout_seconds(
            self.default_timeout_seconds,
            "tasks.default_timeout_seconds",
        )?;
        ValidationUtils::validate_timeout_seconds(
            self.max_timeout_seconds,
            "tasks.max_timeout_seconds",
        )?;
        if self.default_timeout_seconds > self.max_timeout_seconds {
            return Err(crate::ConfigError::Validation(
                "tasks.default_timeout_seconds must not exceed tasks.max_timeout_seconds"
                    .to_string(),
            ));
        }
        if self.max_retries_limit > 100 {
            return Err(crate::ConfigError::Validation(
                "tasks.max_retries_limit must be less than or equal to 100".to_string(),
            ));
        }
        if self.default_max_retries > self.max_retries_limit {
            return Err(crate::ConfigError::Validation(
                "tasks.default_max_retries must not exceed tasks.max_retries_limit".to_string(),
            ));
        }
        Ok(())
    }
}

/// 恢复扫描配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub sweep_interval_seconds: u64,
    /// 判定任务卡死前在超时时间之外额外等待的时间
    pub stuck_grace_seconds: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            sweep_interval_seconds: 15,
            stuck_grace_seconds: 30,
        }
    }
}

impl ConfigValidator for RecoveryConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_timeout_seconds(
            self.sweep_interval_seconds,
            "recovery.sweep_interval_seconds",
        )
    }
}
