//! 领取协调
//!
//! 从队列原子弹出条目，再以 `queued` 为前提把存储中的任务转为 `processing`。
//! 条件更新是跨进程唯一的协调点：弹出的条目如果已被取消或被其他实例处理，直接丢弃；
//! 存储不可用时把条目放回队列，避免任务丢失。

use std::sync::Arc;
use std::time::Duration;

use taskq_domain::{
    entities::{Task, TaskStatus},
    ports::{QueueEntry, TaskQueue},
    value_objects::{StatusTransition, TaskUpdate},
};
use taskq_errors::EngineResult;
use taskq_infrastructure::MetricsCollector;
use tokio::sync::Notify;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::lifecycle::TaskLifecycle;

pub struct ClaimCoordinator {
    lifecycle: Arc<TaskLifecycle>,
    queue: Arc<dyn TaskQueue>,
    wakeup: Notify,
}

impl ClaimCoordinator {
    pub fn new(lifecycle: Arc<TaskLifecycle>, queue: Arc<dyn TaskQueue>) -> Self {
        Self {
            lifecycle,
            queue,
            wakeup: Notify::new(),
        }
    }

    pub fn queue(&self) -> &Arc<dyn TaskQueue> {
        &self.queue
    }

    /// 把任务放入队列并唤醒空闲的 Worker，返回从 1 开始的排队位置估计
    pub async fn enqueue(&self, task: &Task) -> EngineResult<usize> {
        let now = self.lifecycle.now();
        let entry = QueueEntry::for_task(task, now);
        if !self.queue.push(entry).await? {
            debug!(task_id = %task.id, "任务已在队列中");
        }
        let ahead = self.queue.len_before(&entry, now).await?;
        self.notify();
        Ok(ahead + 1)
    }

    pub async fn remove(&self, task_id: Uuid) -> EngineResult<bool> {
        self.queue.remove(task_id).await
    }

    /// 领取下一个可执行的任务
    ///
    /// 返回 None 表示当前没有就绪任务。
    pub async fn claim_next(&self, worker_id: &str) -> EngineResult<Option<Task>> {
        loop {
            let now = self.lifecycle.now();
            let Some(entry) = self.queue.pop_ready(now).await? else {
                return Ok(None);
            };

            let transition = StatusTransition::new(TaskStatus::Processing, worker_id, now)
                .with_update(
                    TaskUpdate::new()
                        .worker_id(Some(worker_id.to_string()))
                        .started_at(Some(now)),
                )
                .with_message(format!("由 {worker_id} 领取"));

            match self
                .lifecycle
                .transition(entry.task_id, TaskStatus::Queued, transition)
                .await
            {
                Ok(task) => {
                    debug!(task_id = %task.id, worker_id, "任务已领取");
                    MetricsCollector::record_task_claimed(task.task_type.as_str());
                    return Ok(Some(task));
                }
                Err(e) if e.is_conflict() || e.is_not_found() => {
                    // 已取消或已被其他实例领取
                    debug!(task_id = %entry.task_id, "丢弃失效的队列条目: {}", e);
                    MetricsCollector::record_claim_discarded();
                }
                Err(e) => {
                    warn!(task_id = %entry.task_id, "领取时存储不可用，条目放回队列: {}", e);
                    if let Err(push_err) = self.queue.push(entry).await {
                        error!(
                            task_id = %entry.task_id,
                            "条目放回队列失败，等待恢复扫描重新入队: {}", push_err
                        );
                    }
                    return Err(e);
                }
            }
        }
    }

    /// 把到期的延迟条目转为就绪，有转移时唤醒 Worker
    pub async fn promote_due(&self) -> EngineResult<usize> {
        let promoted = self.queue.promote_due(self.lifecycle.now()).await?;
        if promoted > 0 {
            self.notify();
        }
        Ok(promoted)
    }

    pub async fn depth(&self) -> EngineResult<usize> {
        let depth = self.queue.len().await?;
        MetricsCollector::set_queue_depth(depth);
        Ok(depth)
    }

    pub fn notify(&self) {
        self.wakeup.notify_waiters();
    }

    /// 等待新任务入队的通知，超时返回 false
    pub async fn wait_for_work(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wakeup.notified())
            .await
            .is_ok()
    }
}
