//! 单次任务执行
//!
//! 负责一次已领取任务的完整执行：查找执行器、建立取消令牌与进度中继、
//! 在超时/取消/存储轮询之间等待执行结束，最后把结果交给重试服务落库。

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use taskq_dispatcher::{CancellationRegistry, ExecutionFailure, TaskLifecycle, TaskRetryService};
use taskq_domain::{
    entities::{Payload, Task, TaskStatus},
    ports::ExecutionContext,
};
use taskq_errors::EngineError;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::progress::ProgressRelay;
use crate::registry::ExecutorRegistry;

/// 执行结束后等待进度中继写完缓冲上报的上限
const PROGRESS_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Succeeded(Payload),
    Failed(ExecutionFailure),
    /// 执行期间任务被取消或被其他路径接管，本次结果不落库
    Abandoned(String),
}

impl ExecutionOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionOutcome::Succeeded(_) => "succeeded",
            ExecutionOutcome::Failed(_) => "failed",
            ExecutionOutcome::Abandoned(_) => "abandoned",
        }
    }
}

pub struct TaskRunner {
    registry: Arc<ExecutorRegistry>,
    lifecycle: Arc<TaskLifecycle>,
    retry: Arc<TaskRetryService>,
    cancellations: Arc<CancellationRegistry>,
    cancel_poll_interval: Duration,
}

impl TaskRunner {
    pub fn new(
        registry: Arc<ExecutorRegistry>,
        lifecycle: Arc<TaskLifecycle>,
        retry: Arc<TaskRetryService>,
        cancellations: Arc<CancellationRegistry>,
        cancel_poll_interval: Duration,
    ) -> Self {
        Self {
            registry,
            lifecycle,
            retry,
            cancellations,
            cancel_poll_interval: cancel_poll_interval.max(Duration::from_millis(1)),
        }
    }

    pub fn registry(&self) -> &Arc<ExecutorRegistry> {
        &self.registry
    }

    /// 执行并提交结果，返回本次执行是否成功完成
    pub async fn run(&self, task: &Task, worker_id: &str) -> bool {
        let outcome = self.execute(task, worker_id).await;
        self.commit(task, worker_id, outcome).await
    }

    /// 执行已处于 processing 的任务，不修改任务状态
    pub async fn execute(&self, task: &Task, worker_id: &str) -> ExecutionOutcome {
        let Some(executor) = self.registry.get(task.task_type.as_str()).await else {
            warn!(task_id = %task.id, "未找到任务类型 {} 的执行器", task.task_type);
            return ExecutionOutcome::Failed(ExecutionFailure::error(format!(
                "未注册的任务类型: {}",
                task.task_type
            )));
        };

        let token = self.cancellations.register(task.id);
        let context = ExecutionContext::new(task, worker_id, self.deadline(task), token.clone());
        let (reporter, relay) =
            ProgressRelay::spawn(self.lifecycle.clone(), task.id, worker_id.to_string());
        let payload = task.payload.clone();
        let mut handle =
            tokio::spawn(async move { executor.execute(context, payload, reporter).await });

        info!(
            task_id = %task.id,
            worker_id,
            attempt = task.retry_count + 1,
            "开始执行任务 {}", task.task_type
        );

        let timeout = tokio::time::sleep(task.timeout());
        tokio::pin!(timeout);
        let mut poll = tokio::time::interval(self.cancel_poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        poll.tick().await;

        let outcome = loop {
            tokio::select! {
                joined = &mut handle => break match joined {
                    Ok(Ok(result)) => ExecutionOutcome::Succeeded(result),
                    Ok(Err(EngineError::Canceled)) if token.is_cancelled() => {
                        ExecutionOutcome::Abandoned("执行器已响应取消".into())
                    }
                    Ok(Err(e)) => ExecutionOutcome::Failed(ExecutionFailure::from(&e)),
                    Err(e) if e.is_panic() => {
                        ExecutionOutcome::Failed(ExecutionFailure::panic(panic_message(e.into_panic())))
                    }
                    Err(e) => ExecutionOutcome::Failed(ExecutionFailure::error(format!("执行被中断: {e}"))),
                },
                _ = &mut timeout => {
                    token.cancel();
                    handle.abort();
                    break ExecutionOutcome::Failed(ExecutionFailure::timeout(task.timeout()));
                }
                _ = token.cancelled() => {
                    handle.abort();
                    break ExecutionOutcome::Abandoned("任务已被取消".into());
                }
                _ = poll.tick() => {
                    if let Some(reason) = self.lost_ownership(task, worker_id).await {
                        token.cancel();
                        handle.abort();
                        break ExecutionOutcome::Abandoned(reason);
                    }
                }
            }
        };

        self.cancellations.unregister(task.id);
        relay.finish(PROGRESS_DRAIN_TIMEOUT).await;
        debug!(task_id = %task.id, outcome = outcome.label(), "任务执行结束");
        outcome
    }

    /// 提交执行结果；任务已被取消或接管时冲突被视为正常情况
    pub async fn commit(&self, task: &Task, worker_id: &str, outcome: ExecutionOutcome) -> bool {
        let committed = match outcome {
            ExecutionOutcome::Succeeded(result) => {
                self.retry.complete(task, result, worker_id).await.map(|_| true)
            }
            ExecutionOutcome::Failed(failure) => self
                .retry
                .handle_failure(task, &failure, worker_id)
                .await
                .map(|_| false),
            ExecutionOutcome::Abandoned(reason) => {
                info!(task_id = %task.id, worker_id, "放弃本次执行结果: {}", reason);
                return false;
            }
        };
        match committed {
            Ok(succeeded) => succeeded,
            Err(e) if e.is_conflict() || e.is_not_found() => {
                info!(task_id = %task.id, worker_id, "任务状态已变化，丢弃本次执行结果: {}", e);
                false
            }
            Err(e) => {
                // 任务保持 processing，由卡死扫描接管
                error!(task_id = %task.id, worker_id, "提交执行结果失败: {}", e);
                false
            }
        }
    }

    fn deadline(&self, task: &Task) -> DateTime<Utc> {
        let now = self.lifecycle.now();
        chrono::Duration::from_std(task.timeout())
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// 存储中的任务已不再由本次执行持有时返回原因
    async fn lost_ownership(&self, task: &Task, worker_id: &str) -> Option<String> {
        match self.lifecycle.get(task.id).await {
            Ok(current)
                if current.status == TaskStatus::Processing
                    && current.worker_id.as_deref() == Some(worker_id) =>
            {
                None
            }
            Ok(current) => Some(format!("任务状态已变为 {}", current.status)),
            Err(e) if e.is_not_found() => Some("任务记录已不存在".into()),
            Err(e) => {
                warn!(task_id = %task.id, "检查任务状态失败: {}", e);
                None
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "未知错误".to_string()
    }
}
