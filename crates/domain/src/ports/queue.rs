use std::cmp::Ordering;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taskq_errors::EngineResult;
use uuid::Uuid;

use crate::entities::{Task, TaskPriority};

/// 队列条目，只保存调度所需的最少信息，任务本体以存储为准
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub task_id: Uuid,
    pub priority: TaskPriority,
    pub eligible_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn new(task_id: Uuid, priority: TaskPriority, eligible_at: DateTime<Utc>) -> Self {
        Self {
            task_id,
            priority,
            eligible_at,
        }
    }

    /// 重试或重新入队时 eligible_at 取当前时间与计划时间的较大者
    pub fn for_task(task: &Task, now: DateTime<Utc>) -> Self {
        let eligible_at = match task.scheduled_for {
            Some(at) if at > now => at,
            _ => now,
        };
        Self::new(task.id, task.priority, eligible_at)
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.eligible_at <= now
    }

    /// 调度顺序：优先级高者在前，同优先级按 eligible_at 先后
    pub fn dispatch_order(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.eligible_at.cmp(&other.eligible_at))
    }
}

/// 优先级队列抽象
///
/// 实现必须保证同一个 task_id 在队列中至多出现一次，并且 `pop_ready` 对并发调用者
/// 是原子的：同一条目不会被两个调用者同时取走。
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// 入队；条目已存在时返回 false 且不做修改
    async fn push(&self, entry: QueueEntry) -> EngineResult<bool>;

    /// 先把到期的延迟条目转入就绪集，再弹出调度顺序最靠前的就绪条目
    async fn pop_ready(&self, now: DateTime<Utc>) -> EngineResult<Option<QueueEntry>>;

    async fn remove(&self, task_id: Uuid) -> EngineResult<bool>;

    /// 把 eligible_at <= now 的延迟条目转入就绪集，返回转移数量
    async fn promote_due(&self, now: DateTime<Utc>) -> EngineResult<usize>;

    /// 条目总数，含延迟条目
    async fn len(&self) -> EngineResult<usize>;

    async fn ready_len(&self, now: DateTime<Utc>) -> EngineResult<usize>;

    /// 排在 entry 之前的就绪条目数
    async fn len_before(&self, entry: &QueueEntry, now: DateTime<Utc>) -> EngineResult<usize>;

    async fn contains(&self, task_id: Uuid) -> EngineResult<bool>;

    fn backend_name(&self) -> &'static str;
}
