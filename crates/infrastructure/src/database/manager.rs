use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use taskq_config::DatabaseConfig;
use taskq_errors::{EngineError, EngineResult};
use tracing::{debug, info};

/// SQLite 连接池管理
///
/// `memory` 地址映射为单连接的内存数据库，连接常驻以保证数据不丢失
pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    pub async fn new(config: &DatabaseConfig) -> EngineResult<Self> {
        let busy_timeout = Duration::from_millis(config.busy_timeout_ms);

        let pool = if config.is_memory() {
            let options = SqliteConnectOptions::from_str("sqlite::memory:")?
                .busy_timeout(busy_timeout)
                .foreign_keys(true);
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            let options = SqliteConnectOptions::from_str(&config.url)?
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .busy_timeout(busy_timeout)
                .foreign_keys(true);
            SqlitePoolOptions::new()
                .max_connections(config.max_connections)
                .acquire_timeout(Duration::from_secs(30))
                .connect_with(options)
                .await?
        };

        info!(
            "数据库连接池已创建: {} (max_connections={})",
            if config.is_memory() { "memory" } else { config.url.as_str() },
            config.max_connections
        );
        Ok(Self { pool })
    }

    /// 连接并执行嵌入的迁移脚本
    pub async fn connect_and_migrate(config: &DatabaseConfig) -> EngineResult<Self> {
        let manager = Self::new(config).await?;
        manager.migrate().await?;
        Ok(manager)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> EngineResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| EngineError::Migration(e.to_string()))?;
        debug!("数据库迁移完成");
        Ok(())
    }

    pub async fn health_check(&self) -> EngineResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
