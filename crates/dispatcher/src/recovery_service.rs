//! 恢复扫描
//!
//! 启动时执行一次，之后按固定间隔执行：
//! - 超过超时时间加宽限期仍处于 processing 的任务按超时失败走重试流程；
//! - 退避已结束但仍停留在 retrying 的任务转为 queued；
//! - 所有 queued 任务重新放入队列（幂等），进程重启后内存队列由此恢复；
//! - 到期的延迟条目转为就绪。

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use taskq_config::RecoveryConfig;
use taskq_domain::{entities::TaskStatus, ports::QueueEntry};
use taskq_errors::EngineResult;
use taskq_infrastructure::MetricsCollector;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cancellation::CancellationRegistry;
use crate::claim::ClaimCoordinator;
use crate::lifecycle::TaskLifecycle;
use crate::retry_service::{ExecutionFailure, TaskRetryService};

const RECOVERY_ACTOR: &str = "recovery";
/// 每轮每种状态最多处理的任务数
const SWEEP_BATCH_SIZE: u32 = 1_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub stuck_recovered: usize,
    pub retrying_requeued: usize,
    pub queued_repushed: usize,
    pub promoted: usize,
}

impl RecoveryReport {
    pub fn total(&self) -> usize {
        self.stuck_recovered + self.retrying_requeued + self.queued_repushed + self.promoted
    }
}

pub struct RecoveryService {
    lifecycle: Arc<TaskLifecycle>,
    coordinator: Arc<ClaimCoordinator>,
    retry: Arc<TaskRetryService>,
    cancellations: Arc<CancellationRegistry>,
    config: RecoveryConfig,
}

impl RecoveryService {
    pub fn new(
        lifecycle: Arc<TaskLifecycle>,
        coordinator: Arc<ClaimCoordinator>,
        retry: Arc<TaskRetryService>,
        cancellations: Arc<CancellationRegistry>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            lifecycle,
            coordinator,
            retry,
            cancellations,
            config,
        }
    }

    pub async fn run_once(&self) -> EngineResult<RecoveryReport> {
        let report = RecoveryReport {
            stuck_recovered: self.recover_stuck_tasks().await?,
            retrying_requeued: self.requeue_retrying_tasks().await?,
            queued_repushed: self.repush_queued_tasks().await?,
            promoted: self.coordinator.promote_due().await?,
        };
        MetricsCollector::record_recovered("stuck", report.stuck_recovered);
        MetricsCollector::record_recovered("retrying", report.retrying_requeued);
        MetricsCollector::record_recovered("queued", report.queued_repushed);
        self.coordinator.depth().await?;
        Ok(report)
    }

    async fn recover_stuck_tasks(&self) -> EngineResult<usize> {
        let now = self.lifecycle.now();
        let grace = Duration::from_secs(self.config.stuck_grace_seconds);
        let processing = self
            .lifecycle
            .repository()
            .find_by_status(TaskStatus::Processing, SWEEP_BATCH_SIZE)
            .await?;

        let mut recovered = 0;
        for task in processing.into_iter().filter(|t| t.is_stuck(now, grace)) {
            warn!(
                task_id = %task.id,
                worker_id = task.worker_id.as_deref().unwrap_or("-"),
                "检测到卡死任务"
            );
            // 本进程内仍在执行的话通知其放弃
            self.cancellations.cancel(task.id);
            let failure = ExecutionFailure::stuck(format!(
                "任务执行超时（{}ms），执行方未在宽限期内提交结果",
                task.timeout_ms
            ));
            match self.retry.handle_failure(&task, &failure, RECOVERY_ACTOR).await {
                Ok(_) => recovered += 1,
                Err(e) if e.is_conflict() || e.is_not_found() => {
                    debug!(task_id = %task.id, "卡死任务已被其他路径处理: {}", e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(recovered)
    }

    async fn requeue_retrying_tasks(&self) -> EngineResult<usize> {
        let now = self.lifecycle.now();
        let retrying = self
            .lifecycle
            .repository()
            .find_by_status(TaskStatus::Retrying, SWEEP_BATCH_SIZE)
            .await?;

        let mut requeued = 0;
        for task in retrying {
            let backoff = self
                .retry
                .policy()
                .base_delay(task.retry_count.saturating_sub(1));
            let elapsed = chrono::Duration::from_std(backoff)
                .ok()
                .and_then(|d| task.updated_at.checked_add_signed(d))
                .is_some_and(|due| due <= now);
            if !elapsed {
                continue;
            }
            match self.retry.requeue(&task, now, RECOVERY_ACTOR).await {
                Ok(_) => requeued += 1,
                Err(e) if e.is_conflict() || e.is_not_found() => {
                    debug!(task_id = %task.id, "重试任务已被其他路径处理: {}", e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(requeued)
    }

    async fn repush_queued_tasks(&self) -> EngineResult<usize> {
        let queued = self
            .lifecycle
            .repository()
            .find_by_status(TaskStatus::Queued, SWEEP_BATCH_SIZE)
            .await?;

        let queue = self.coordinator.queue();
        let mut pushed = 0;
        for task in queued {
            // 按原始就绪时间入队，保持同优先级内的先后顺序
            let entry = QueueEntry::new(task.id, task.priority, task.eligible_at());
            if queue.push(entry).await? {
                pushed += 1;
            }
        }
        if pushed > 0 {
            self.coordinator.notify();
        }
        Ok(pushed)
    }

    /// 启动周期扫描，第一次扫描立即执行
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let period = Duration::from_secs(self.config.sweep_interval_seconds.max(1));
        tokio::spawn(async move {
            info!("恢复扫描已启动，间隔 {:?}", period);
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => match self.run_once().await {
                        Ok(report) if report.total() > 0 => info!("恢复扫描完成: {:?}", report),
                        Ok(_) => debug!("恢复扫描完成，无需处理"),
                        Err(e) => error!("恢复扫描失败: {}", e),
                    },
                }
            }
            info!("恢复扫描已停止");
        })
    }
}
