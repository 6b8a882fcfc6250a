//! 执行结果处理与重试退避

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use taskq_config::RetryConfig;
use taskq_domain::{
    entities::{Payload, Task, TaskStatus},
    value_objects::{StatusTransition, TaskUpdate},
};
use taskq_errors::{EngineError, EngineResult};
use taskq_infrastructure::MetricsCollector;
use tracing::{info, warn};

use crate::claim::ClaimCoordinator;
use crate::lifecycle::TaskLifecycle;

/// 指数退避策略：`base * 2^retry_count`，不超过上限，再叠加随机抖动
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
    jitter_factor: f64,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration, jitter_factor: f64) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.jitter_factor,
        )
    }

    /// 不含抖动的退避时间，retry_count 为本次失败前已重试的次数
    pub fn base_delay(&self, retry_count: u32) -> Duration {
        let factor = 2u64.checked_pow(retry_count).unwrap_or(u64::MAX);
        let base_ms = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
    }

    pub fn delay(&self, retry_count: u32) -> Duration {
        let capped = self.base_delay(retry_count);
        if self.jitter_factor == 0.0 {
            return capped;
        }
        let capped_ms = capped.as_millis() as f64;
        let jitter = capped_ms * self.jitter_factor * (rand::random::<f64>() - 0.5) * 2.0;
        let max_ms = self.max.as_millis() as f64;
        Duration::from_millis((capped_ms + jitter).clamp(0.0, max_ms) as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry {
        retry_count: u32,
        delay: Duration,
        scheduled_for: DateTime<Utc>,
    },
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Error,
    Timeout,
    Panic,
    /// 恢复扫描发现的卡死任务
    Stuck,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Error => "error",
            FailureKind::Timeout => "timeout",
            FailureKind::Panic => "panic",
            FailureKind::Stuck => "stuck",
        }
    }
}

/// 一次执行失败，最终写入任务的 error_message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ExecutionFailure {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Error,
            message: message.into(),
        }
    }

    pub fn timeout(timeout: Duration) -> Self {
        Self {
            kind: FailureKind::Timeout,
            message: format!("任务执行超时（{}ms）", timeout.as_millis()),
        }
    }

    pub fn panic(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Panic,
            message: format!("执行器崩溃: {}", message.into()),
        }
    }

    pub fn stuck(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Stuck,
            message: message.into(),
        }
    }
}

impl From<&EngineError> for ExecutionFailure {
    fn from(err: &EngineError) -> Self {
        match err {
            EngineError::ExecutionTimeout => Self {
                kind: FailureKind::Timeout,
                message: err.to_string(),
            },
            EngineError::Execution(message) => Self::error(message.clone()),
            other => Self::error(other.to_string()),
        }
    }
}

/// 把执行结果转换为终态或重试转换
pub struct TaskRetryService {
    lifecycle: Arc<TaskLifecycle>,
    coordinator: Arc<ClaimCoordinator>,
    policy: BackoffPolicy,
}

impl TaskRetryService {
    pub fn new(
        lifecycle: Arc<TaskLifecycle>,
        coordinator: Arc<ClaimCoordinator>,
        policy: BackoffPolicy,
    ) -> Self {
        Self {
            lifecycle,
            coordinator,
            policy,
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn decide(&self, task: &Task, now: DateTime<Utc>) -> RetryDecision {
        if !task.can_retry() {
            return RetryDecision::Exhausted;
        }
        let delay = self.policy.delay(task.retry_count);
        let scheduled_for = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(now);
        RetryDecision::Retry {
            retry_count: task.retry_count + 1,
            delay,
            scheduled_for,
        }
    }

    /// processing -> completed
    pub async fn complete(&self, task: &Task, result: Payload, actor: &str) -> EngineResult<Task> {
        let at = finish_time(task, self.lifecycle.now());
        let completed = self
            .lifecycle
            .transition(
                task.id,
                TaskStatus::Processing,
                StatusTransition::new(TaskStatus::Completed, actor, at)
                    .with_update(
                        TaskUpdate::new()
                            .progress(100)
                            .result(Some(result))
                            .completed_at(Some(at)),
                    )
                    .with_message("任务执行成功"),
            )
            .await?;
        info!(task_id = %task.id, worker_id = actor, "任务执行完成");
        Ok(completed)
    }

    /// 执行失败：还有重试次数时进入 retrying 并按退避时间重新入队，否则进入 failed
    pub async fn handle_failure(
        &self,
        task: &Task,
        failure: &ExecutionFailure,
        actor: &str,
    ) -> EngineResult<Task> {
        let now = self.lifecycle.now();
        match failure.kind {
            FailureKind::Timeout => MetricsCollector::record_task_timeout(task.task_type.as_str()),
            FailureKind::Panic => MetricsCollector::record_executor_panic(task.task_type.as_str()),
            FailureKind::Error | FailureKind::Stuck => {}
        }

        match self.decide(task, now) {
            RetryDecision::Retry {
                retry_count,
                delay,
                scheduled_for,
            } => {
                let retrying = self
                    .lifecycle
                    .transition(
                        task.id,
                        TaskStatus::Processing,
                        StatusTransition::new(TaskStatus::Retrying, actor, now)
                            .with_update(
                                TaskUpdate::new()
                                    .retry_count(retry_count)
                                    .error_message(Some(failure.message.clone())),
                            )
                            .with_message(format!(
                                "{}，第 {}/{} 次重试将在 {}ms 后执行",
                                failure.kind.as_str(),
                                retry_count,
                                task.max_retries,
                                delay.as_millis()
                            )),
                    )
                    .await?;
                MetricsCollector::record_task_retry(task.task_type.as_str());
                warn!(
                    task_id = %task.id,
                    retry_count,
                    "任务执行失败，等待重试: {}", failure.message
                );
                self.requeue(&retrying, scheduled_for, actor).await
            }
            RetryDecision::Exhausted => {
                let at = finish_time(task, now);
                let failed = self
                    .lifecycle
                    .transition(
                        task.id,
                        TaskStatus::Processing,
                        StatusTransition::new(TaskStatus::Failed, actor, at)
                            .with_update(
                                TaskUpdate::new()
                                    .error_message(Some(failure.message.clone()))
                                    .completed_at(Some(at)),
                            )
                            .with_message(format!("重试次数已用尽（{}）", task.max_retries)),
                    )
                    .await?;
                warn!(task_id = %task.id, "任务最终失败: {}", failure.message);
                Ok(failed)
            }
        }
    }

    /// retrying -> queued，写入新的 scheduled_for 并放回队列
    ///
    /// 入队失败时任务已经是 queued，恢复扫描会重新入队。
    pub async fn requeue(
        &self,
        task: &Task,
        scheduled_for: DateTime<Utc>,
        actor: &str,
    ) -> EngineResult<Task> {
        let queued = self
            .lifecycle
            .transition(
                task.id,
                TaskStatus::Retrying,
                StatusTransition::new(TaskStatus::Queued, actor, self.lifecycle.now())
                    .with_update(
                        TaskUpdate::new()
                            .progress(0)
                            .worker_id(None)
                            .scheduled_for(Some(scheduled_for)),
                    )
                    .with_message("退避结束后重新排队"),
            )
            .await?;
        if let Err(e) = self.coordinator.enqueue(&queued).await {
            warn!(task_id = %task.id, "重新入队失败，等待恢复扫描: {}", e);
        }
        Ok(queued)
    }
}

/// 结束时间不早于开始时间
fn finish_time(task: &Task, now: DateTime<Utc>) -> DateTime<Utc> {
    match task.started_at {
        Some(started) if started > now => started,
        _ => now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_is_capped() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_millis(1_000), 0.0);
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(4), Duration::from_millis(1_000));
        assert_eq!(policy.delay(80), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = BackoffPolicy::new(Duration::from_millis(1_000), Duration::from_secs(60), 0.1);
        for _ in 0..100 {
            let delay = policy.delay(0).as_millis();
            assert!((900..=1_100).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn test_failure_from_engine_error() {
        let failure = ExecutionFailure::from(&EngineError::ExecutionTimeout);
        assert_eq!(failure.kind, FailureKind::Timeout);

        let failure = ExecutionFailure::from(&EngineError::execution("boom"));
        assert_eq!(failure.kind, FailureKind::Error);
        assert_eq!(failure.message, "boom");
    }
}
