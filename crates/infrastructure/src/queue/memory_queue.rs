use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use taskq_domain::{entities::TaskPriority, ports::QueueEntry, ports::TaskQueue};
use taskq_errors::EngineResult;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// 就绪集排序键：优先级降序，同优先级按 eligible_at、入队序号升序
type ReadyKey = (Reverse<u8>, DateTime<Utc>, u64, Uuid);
/// 延迟集排序键
type DelayedKey = (DateTime<Utc>, u64, Uuid);

#[derive(Debug, Clone, Copy)]
enum Slot {
    Ready(ReadyKey),
    Delayed(DelayedKey),
}

#[derive(Debug, Default)]
struct QueueState {
    ready: BTreeSet<ReadyKey>,
    delayed: BTreeSet<DelayedKey>,
    priorities: HashMap<Uuid, TaskPriority>,
    index: HashMap<Uuid, Slot>,
    seq: u64,
}

impl QueueState {
    fn ready_key(priority: TaskPriority, eligible_at: DateTime<Utc>, seq: u64, id: Uuid) -> ReadyKey {
        (Reverse(priority.rank()), eligible_at, seq, id)
    }

    fn promote_due(&mut self, now: DateTime<Utc>) -> usize {
        let mut promoted = 0;
        while let Some(&key) = self.delayed.first() {
            let (eligible_at, seq, id) = key;
            if eligible_at > now {
                break;
            }
            self.delayed.remove(&key);
            let priority = self.priorities.get(&id).copied().unwrap_or_default();
            let ready = Self::ready_key(priority, eligible_at, seq, id);
            self.ready.insert(ready);
            self.index.insert(id, Slot::Ready(ready));
            promoted += 1;
        }
        promoted
    }

    fn remove(&mut self, id: Uuid) -> bool {
        let Some(slot) = self.index.remove(&id) else {
            return false;
        };
        match slot {
            Slot::Ready(key) => {
                self.ready.remove(&key);
            }
            Slot::Delayed(key) => {
                self.delayed.remove(&key);
            }
        }
        self.priorities.remove(&id);
        true
    }
}

/// 进程内优先级队列
///
/// 单实例部署使用；多进程部署需要共享队列（Redis）。
#[derive(Debug, Default)]
pub struct InMemoryTaskQueue {
    state: Mutex<QueueState>,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn push(&self, entry: QueueEntry) -> EngineResult<bool> {
        let mut state = self.state.lock().await;
        if state.index.contains_key(&entry.task_id) {
            debug!("任务已在队列中，忽略重复入队: {}", entry.task_id);
            return Ok(false);
        }
        state.seq += 1;
        let key = (entry.eligible_at, state.seq, entry.task_id);
        state.delayed.insert(key);
        state.priorities.insert(entry.task_id, entry.priority);
        state.index.insert(entry.task_id, Slot::Delayed(key));
        Ok(true)
    }

    async fn pop_ready(&self, now: DateTime<Utc>) -> EngineResult<Option<QueueEntry>> {
        let mut state = self.state.lock().await;
        state.promote_due(now);
        let Some((Reverse(rank), eligible_at, _, id)) = state.ready.pop_first() else {
            return Ok(None);
        };
        state.index.remove(&id);
        let priority = state
            .priorities
            .remove(&id)
            .or_else(|| TaskPriority::from_rank(rank))
            .unwrap_or_default();
        Ok(Some(QueueEntry::new(id, priority, eligible_at)))
    }

    async fn remove(&self, task_id: Uuid) -> EngineResult<bool> {
        Ok(self.state.lock().await.remove(task_id))
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        Ok(self.state.lock().await.promote_due(now))
    }

    async fn len(&self) -> EngineResult<usize> {
        Ok(self.state.lock().await.index.len())
    }

    async fn ready_len(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        let mut state = self.state.lock().await;
        state.promote_due(now);
        Ok(state.ready.len())
    }

    async fn len_before(&self, entry: &QueueEntry, now: DateTime<Utc>) -> EngineResult<usize> {
        let mut state = self.state.lock().await;
        state.promote_due(now);
        let key = match state.index.get(&entry.task_id) {
            Some(Slot::Ready(key)) => *key,
            Some(Slot::Delayed((_, seq, _))) => {
                QueueState::ready_key(entry.priority, entry.eligible_at, *seq, entry.task_id)
            }
            None => QueueState::ready_key(entry.priority, entry.eligible_at, u64::MAX, entry.task_id),
        };
        Ok(state.ready.range(..key).count())
    }

    async fn contains(&self, task_id: Uuid) -> EngineResult<bool> {
        Ok(self.state.lock().await.index.contains_key(&task_id))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
