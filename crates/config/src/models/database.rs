use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

/// 任务记录存储配置
///
/// `url` 为 `memory` 时使用进程内存储，否则按 sqlx 的 SQLite 连接串解析，
/// 例如 `sqlite://data/taskq.db?mode=rwc`。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://taskq.db?mode=rwc".to_string(),
            max_connections: 8,
            busy_timeout_ms: 5_000,
        }
    }
}

impl DatabaseConfig {
    pub fn is_memory(&self) -> bool {
        self.url.eq_ignore_ascii_case("memory")
    }
}

impl ConfigValidator for DatabaseConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_not_empty(&self.url, "database.url")?;
        if !self.is_memory() && !self.url.starts_with("sqlite:") {
            return Err(crate::ConfigError::Validation(format!(
                "database.url must be 'memory' or a sqlite: URL, got '{}'",
                self.url
            )));
        }
        ValidationUtils::validate_count(
            self.max_connections as usize,
            "database.max_connections",
            100,
        )?;
        if self.busy_timeout_ms == 0 {
            return Err(crate::ConfigError::Validation(
                "database.busy_timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
