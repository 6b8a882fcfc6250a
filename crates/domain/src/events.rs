//! 状态更新事件
//!
//! 每次持久化的状态或进度变更都会产生一个事件，由广播器推送给订阅者

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::{Task, TaskHistoryEntry, TaskStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdateEvent {
    pub task_id: Uuid,
    pub tenant_id: String,
    pub task_type: String,
    /// 创建事件没有旧状态
    pub old_status: Option<TaskStatus>,
    pub new_status: TaskStatus,
    pub progress: u8,
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl StatusUpdateEvent {
    /// 由更新后的任务和对应审计记录构造事件
    pub fn from_entry(task: &Task, entry: &TaskHistoryEntry) -> Self {
        Self {
            task_id: task.id,
            tenant_id: task.tenant_id.clone(),
            task_type: task.task_type.as_str().to_string(),
            old_status: entry.old_status,
            new_status: entry.new_status,
            progress: entry.new_progress,
            message: entry.message.clone(),
            timestamp: entry.created_at,
        }
    }

    /// 任务当前状态的快照，订阅已结束的任务时使用
    pub fn snapshot(task: &Task) -> Self {
        Self {
            task_id: task.id,
            tenant_id: task.tenant_id.clone(),
            task_type: task.task_type.as_str().to_string(),
            old_status: Some(task.status),
            new_status: task.status,
            progress: task.progress,
            message: task.error_message.clone(),
            timestamp: task.updated_at,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.new_status.is_terminal()
    }

    pub fn event_type(&self) -> &'static str {
        match self.old_status {
            None => "created",
            Some(old) if old == self.new_status && old.is_terminal() => "snapshot",
            Some(old) if old == self.new_status => "progress",
            Some(_) => "status_changed",
        }
    }
}

/// 订阅过滤条件，所有已设置的字段必须同时匹配
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    pub task_id: Option<Uuid>,
    pub tenant_id: Option<String>,
    pub task_type: Option<String>,
    pub status: Option<TaskStatus>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_task(task_id: Uuid) -> Self {
        Self {
            task_id: Some(task_id),
            ..Default::default()
        }
    }

    pub fn for_tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: Some(tenant_id.into()),
            ..Default::default()
        }
    }

    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, event: &StatusUpdateEvent) -> bool {
        self.task_id.map_or(true, |id| id == event.task_id)
            && self
                .tenant_id
                .as_deref()
                .map_or(true, |t| t == event.tenant_id)
            && self
                .task_type
                .as_deref()
                .map_or(true, |t| t == event.task_type)
            && self.status.map_or(true, |s| s == event.new_status)
    }

    /// 单任务订阅在该任务进入终态后结束，与其余过滤条件无关
    pub fn ends_with(&self, event: &StatusUpdateEvent) -> bool {
        self.task_id == Some(event.task_id) && event.is_terminal()
    }
}
