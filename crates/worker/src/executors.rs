//! 内置执行器

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use taskq_domain::{
    entities::Payload,
    ports::{ExecutionContext, ProgressReporter, TaskExecutor},
};
use taskq_errors::{EngineError, EngineResult};
use tracing::debug;

/// 单次健康检查允许的最长模拟耗时
const MAX_HEALTH_CHECK_DELAY_MS: u64 = 60_000;

/// `health_check` 任务执行器
///
/// 回显 payload 中的 `message`，可选的 `delay_ms` 用于模拟耗时，期间响应取消。
#[derive(Debug, Default, Clone)]
pub struct HealthCheckExecutor;

impl HealthCheckExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TaskExecutor for HealthCheckExecutor {
    fn name(&self) -> &str {
        "health_check"
    }

    fn description(&self) -> &str {
        "回显消息的健康检查任务"
    }

    async fn execute(
        &self,
        context: ExecutionContext,
        payload: Payload,
        progress: ProgressReporter,
    ) -> EngineResult<Payload> {
        let message = match payload.get("message") {
            None => "ok".to_string(),
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => {
                return Err(EngineError::execution(format!(
                    "message 字段必须是字符串，实际为 {other}"
                )))
            }
        };
        let delay_ms = payload
            .get("delay_ms")
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
            .min(MAX_HEALTH_CHECK_DELAY_MS);

        debug!(task_id = %context.task_id, "执行健康检查: {}", message);
        progress.report(10, Some("开始健康检查".into())).await;

        if delay_ms > 0 {
            tokio::select! {
                _ = context.cancelled() => return Err(EngineError::Canceled),
                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
            }
        }
        progress.report(100, Some("健康检查完成".into())).await;

        let result = json!({
            "status": "healthy",
            "message": message,
            "worker_id": context.worker_id,
            "attempt": context.attempt,
            "checked_at": Utc::now(),
        });
        match result {
            serde_json::Value::Object(map) => Ok(map),
            _ => Err(EngineError::Internal("健康检查结果不是对象".into())),
        }
    }
}
