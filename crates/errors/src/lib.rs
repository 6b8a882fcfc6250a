use thiserror::Error;
use uuid::Uuid;

/// 任务引擎错误类型
///
/// 按照调用方的处理方式划分：校验/未找到/冲突属于永久性错误，直接返回给调用方；
/// 数据库与队列错误属于基础设施错误，调用方可以重试；执行类错误只在 Worker 内部流转，
/// 最终写入任务的 `error_message`，不会向上传播。
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("数据验证失败: {0}")]
    Validation(String),

    #[error("任务未找到: {id}")]
    TaskNotFound { id: Uuid },

    #[error("任务 {id} 当前状态为 {current}，无法执行 {operation}")]
    Conflict {
        id: Uuid,
        current: String,
        operation: String,
    },

    #[error("任务执行错误: {0}")]
    Execution(String),

    #[error("任务执行超时")]
    ExecutionTimeout,

    #[error("任务已取消")]
    Canceled,

    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库迁移失败: {0}")]
    Migration(String),

    #[error("队列错误: {0}")]
    Queue(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }
    pub fn task_not_found(id: Uuid) -> Self {
        Self::TaskNotFound { id }
    }
    pub fn conflict(id: Uuid, current: impl ToString, operation: impl Into<String>) -> Self {
        Self::Conflict {
            id,
            current: current.to_string(),
            operation: operation.into(),
        }
    }
    pub fn execution<S: Into<String>>(msg: S) -> Self {
        Self::Execution(msg.into())
    }
    pub fn queue<S: Into<String>>(msg: S) -> Self {
        Self::Queue(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// 基础设施类错误，调用方或对账任务可以重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Database(_) | EngineError::Queue(_) | EngineError::Migration(_)
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::TaskNotFound { .. })
    }

    /// 稳定的错误码，供 API 层与客户端区分错误类别
    pub fn error_code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "VALIDATION_ERROR",
            EngineError::TaskNotFound { .. } => "TASK_NOT_FOUND",
            EngineError::Conflict { .. } => "CONFLICT",
            EngineError::Execution(_) => "EXECUTION_ERROR",
            EngineError::ExecutionTimeout => "TIMEOUT",
            EngineError::Canceled => "CANCELED",
            EngineError::Database(_) | EngineError::Migration(_) => "DATABASE_UNAVAILABLE",
            EngineError::Queue(_) => "QUEUE_UNAVAILABLE",
            EngineError::Serialization(_) => "SERIALIZATION_ERROR",
            EngineError::Configuration(_) => "CONFIGURATION_ERROR",
            EngineError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<redis::RedisError> for EngineError {
    fn from(err: redis::RedisError) -> Self {
        EngineError::Queue(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for EngineError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        EngineError::Migration(err.to_string())
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Internal(err.to_string())
    }
}
