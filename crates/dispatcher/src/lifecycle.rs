//! 任务状态写入与事件发布
//!
//! 所有状态/进度变更都经由这里：先提交到存储，提交成功后再广播，订阅者看到的永远是已持久化的状态。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use taskq_domain::{
    entities::{Task, TaskStatus},
    events::StatusUpdateEvent,
    ports::Clock,
    repositories::TaskRepository,
    value_objects::{StatusTransition, TransitionOutcome},
};
use taskq_errors::EngineResult;
use taskq_infrastructure::{MetricsCollector, StatusBroadcaster};
use tracing::debug;
use uuid::Uuid;

pub struct TaskLifecycle {
    repo: Arc<dyn TaskRepository>,
    broadcaster: Arc<StatusBroadcaster>,
    clock: Arc<dyn Clock>,
}

impl TaskLifecycle {
    pub fn new(
        repo: Arc<dyn TaskRepository>,
        broadcaster: Arc<StatusBroadcaster>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repo,
            broadcaster,
            clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub fn repository(&self) -> &Arc<dyn TaskRepository> {
        &self.repo
    }

    pub fn broadcaster(&self) -> &Arc<StatusBroadcaster> {
        &self.broadcaster
    }

    pub async fn create(&self, task: &Task) -> EngineResult<Task> {
        let outcome = self.repo.create(task).await?;
        self.publish(&outcome);
        Ok(outcome.task)
    }

    pub async fn get(&self, id: Uuid) -> EngineResult<Task> {
        self.repo
            .get(id)
            .await?
            .ok_or_else(|| taskq_errors::EngineError::task_not_found(id))
    }

    /// 条件状态转换，成功后广播事件并记录终态指标
    pub async fn transition(
        &self,
        id: Uuid,
        expected: TaskStatus,
        transition: StatusTransition,
    ) -> EngineResult<Task> {
        let outcome = self.repo.update_status(id, expected, transition).await?;
        debug!(
            task_id = %id,
            from = %expected,
            to = %outcome.task.status,
            "任务状态已更新"
        );
        if outcome.task.is_terminal() {
            record_finished(&outcome.task);
        }
        self.publish(&outcome);
        Ok(outcome.task)
    }

    pub async fn progress(
        &self,
        id: Uuid,
        progress: u8,
        actor: &str,
        message: Option<String>,
    ) -> EngineResult<Task> {
        let outcome = self
            .repo
            .update_progress(id, progress, actor, message, self.now())
            .await?;
        self.publish(&outcome);
        Ok(outcome.task)
    }

    fn publish(&self, outcome: &TransitionOutcome) {
        let event = StatusUpdateEvent::from_entry(&outcome.task, &outcome.entry);
        self.broadcaster.publish(&event);
    }
}

fn record_finished(task: &Task) {
    let seconds = match (task.started_at, task.completed_at) {
        (Some(started), Some(completed)) => (completed - started)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or_default(),
        _ => 0.0,
    };
    MetricsCollector::record_task_finished(task.task_type.as_str(), task.status.as_str(), seconds);
}
