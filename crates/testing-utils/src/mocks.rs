//! 测试替身
//!
//! `InMemoryTaskRepository` 完整实现仓储语义（条件更新、历史、分页、聚合），
//! 并可切换为“不可用”以模拟数据库故障；`MockTaskQueue` 由 mockall 生成。

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mockall::mock;
use taskq_domain::{
    entities::{Task, TaskHistoryEntry, TaskStatus},
    ports::{QueueEntry, TaskQueue},
    repositories::TaskRepository,
    value_objects::{
        Page, SortField, SortOrder, StatusTransition, TaskAggregate, TaskQuery, TransitionOutcome,
    },
};
use taskq_errors::{EngineError, EngineResult};
use uuid::Uuid;

/// 模拟数据库不可用
pub fn database_unavailable() -> EngineError {
    EngineError::Database(sqlx::Error::PoolTimedOut)
}

/// 模拟队列不可用
pub fn queue_unavailable() -> EngineError {
    EngineError::queue("connection refused")
}

#[derive(Debug, Default)]
struct RepoState {
    tasks: HashMap<Uuid, Task>,
    history: Vec<TaskHistoryEntry>,
    next_history_id: i64,
}

impl RepoState {
    fn push_history(&mut self, mut entry: TaskHistoryEntry) -> TaskHistoryEntry {
        self.next_history_id += 1;
        entry.id = self.next_history_id;
        self.history.push(entry.clone());
        entry
    }
}

#[derive(Debug, Default)]
pub struct InMemoryTaskRepository {
    state: Mutex<RepoState>,
    unavailable: AtomicBool,
    progress_delay_ms: AtomicU64,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// 切换为不可用后所有操作返回数据库错误
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// 每次进度写入前等待的时间，模拟慢存储
    pub fn set_progress_delay(&self, delay: Duration) {
        self.progress_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        self.state.lock().unwrap().tasks.len()
    }

    pub fn all_tasks(&self) -> Vec<Task> {
        self.state.lock().unwrap().tasks.values().cloned().collect()
    }

    /// 绕过状态机直接写入，用于构造测试前置状态
    pub fn insert_raw(&self, task: Task) {
        self.state.lock().unwrap().tasks.insert(task.id, task);
    }

    fn check_available(&self) -> EngineResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(database_unavailable())
        } else {
            Ok(())
        }
    }
}

fn compare(a: &Task, b: &Task, field: SortField) -> CmpOrdering {
    match field {
        SortField::CreatedAt => a.created_at.cmp(&b.created_at),
        SortField::UpdatedAt => a.updated_at.cmp(&b.updated_at),
        SortField::Priority => a.priority.rank().cmp(&b.priority.rank()),
        SortField::Status => a.status.as_str().cmp(b.status.as_str()),
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn create(&self, task: &Task) -> EngineResult<TransitionOutcome> {
        self.check_available()?;
        let mut state = self.state.lock().unwrap();
        if state.tasks.contains_key(&task.id) {
            return Err(EngineError::validation(format!("任务已存在: {}", task.id)));
        }
        state.tasks.insert(task.id, task.clone());
        let entry = state.push_history(TaskHistoryEntry {
            id: 0,
            task_id: task.id,
            old_status: None,
            new_status: task.status,
            old_progress: task.progress,
            new_progress: task.progress,
            actor: "system".to_string(),
            message: Some("任务已创建".to_string()),
            created_at: task.created_at,
        });
        Ok(TransitionOutcome {
            task: task.clone(),
            entry,
        })
    }

    async fn get(&self, id: Uuid) -> EngineResult<Option<Task>> {
        self.check_available()?;
        Ok(self.state.lock().unwrap().tasks.get(&id).cloned())
    }

    async fn list(&self, query: &TaskQuery) -> EngineResult<Page<Task>> {
        self.check_available()?;
        let state = self.state.lock().unwrap();
        let mut items: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| query.filter.matches(t))
            .cloned()
            .collect();
        items.sort_by(|a, b| {
            let ord = compare(a, b, query.sort_by).then_with(|| a.created_at.cmp(&b.created_at));
            match query.order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            }
        });

        let page_size = query.page_size.clamp(1, TaskQuery::MAX_PAGE_SIZE);
        let page = query.page.max(1);
        let total = items.len() as u64;
        let offset = (page as usize - 1) * page_size as usize;
        let items = items
            .into_iter()
            .skip(offset)
            .take(page_size as usize)
            .collect();
        Ok(Page {
            items,
            total,
            page,
            page_size,
        })
    }

    async fn update_status(
        &self,
        id: Uuid,
        expected: TaskStatus,
        transition: StatusTransition,
    ) -> EngineResult<TransitionOutcome> {
        self.check_available()?;
        if !expected.can_transition_to(transition.to) {
            return Err(EngineError::validation(format!(
                "非法的状态转换: {expected} -> {}",
                transition.to
            )));
        }
        let mut state = self.state.lock().unwrap();
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| EngineError::task_not_found(id))?;
        if task.status != expected {
            return Err(EngineError::conflict(
                id,
                task.status,
                format!("{expected} -> {}", transition.to),
            ));
        }
        let old_progress = task.progress;
        task.status = transition.to;
        transition.update.apply(task);
        task.updated_at = transition.at.max(task.created_at);
        let updated = task.clone();

        let entry = state.push_history(TaskHistoryEntry {
            id: 0,
            task_id: id,
            old_status: Some(expected),
            new_status: updated.status,
            old_progress,
            new_progress: updated.progress,
            actor: transition.actor,
            message: transition.message,
            created_at: updated.updated_at,
        });
        Ok(TransitionOutcome {
            task: updated,
            entry,
        })
    }

    async fn update_progress(
        &self,
        id: Uuid,
        progress: u8,
        actor: &str,
        message: Option<String>,
        at: DateTime<Utc>,
    ) -> EngineResult<TransitionOutcome> {
        let delay = self.progress_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.check_available()?;
        let mut state = self.state.lock().unwrap();
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| EngineError::task_not_found(id))?;
        if task.status != TaskStatus::Processing {
            return Err(EngineError::conflict(id, task.status, "update_progress"));
        }
        if progress < task.progress {
            return Err(EngineError::validation(format!(
                "进度不能回退: 当前 {}，请求 {}",
                task.progress, progress
            )));
        }
        let old_progress = task.progress;
        task.progress = progress;
        task.updated_at = at.max(task.updated_at);
        let updated = task.clone();

        let entry = state.push_history(TaskHistoryEntry {
            id: 0,
            task_id: id,
            old_status: Some(updated.status),
            new_status: updated.status,
            old_progress,
            new_progress: progress,
            actor: actor.to_string(),
            message,
            created_at: updated.updated_at,
        });
        Ok(TransitionOutcome {
            task: updated,
            entry,
        })
    }

    async fn append_history(&self, entry: &TaskHistoryEntry) -> EngineResult<TaskHistoryEntry> {
        self.check_available()?;
        Ok(self.state.lock().unwrap().push_history(entry.clone()))
    }

    async fn history(&self, task_id: Uuid) -> EngineResult<Vec<TaskHistoryEntry>> {
        self.check_available()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .history
            .iter()
            .filter(|h| h.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn find_by_status(&self, status: TaskStatus, limit: u32) -> EngineResult<Vec<Task>> {
        self.check_available()?;
        let state = self.state.lock().unwrap();
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks.truncate(limit as usize);
        Ok(tasks)
    }

    async fn aggregate(&self, tenant_id: Option<&str>) -> EngineResult<TaskAggregate> {
        self.check_available()?;
        let state = self.state.lock().unwrap();
        let mut aggregate = TaskAggregate::default();
        let mut durations = Vec::new();
        for task in state
            .tasks
            .values()
            .filter(|t| tenant_id.map_or(true, |tenant| t.tenant_id == tenant))
        {
            aggregate.record(
                task.task_type.as_str(),
                task.priority,
                &task.tenant_id,
                task.status,
                1,
            );
            if task.status == TaskStatus::Completed {
                if let (Some(started), Some(completed)) = (task.started_at, task.completed_at) {
                    durations.push((completed - started).num_milliseconds() as f64);
                }
            }
        }
        if !durations.is_empty() {
            aggregate.avg_processing_ms = Some(durations.iter().sum::<f64>() / durations.len() as f64);
        }
        Ok(aggregate)
    }

    async fn count_completed_since(
        &self,
        tenant_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> EngineResult<u64> {
        self.check_available()?;
        let state = self.state.lock().unwrap();
        Ok(state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Completed)
            .filter(|t| t.completed_at.is_some_and(|at| at >= since))
            .filter(|t| tenant_id.map_or(true, |tenant| t.tenant_id == tenant))
            .count() as u64)
    }

    async fn health_check(&self) -> EngineResult<()> {
        self.check_available()
    }
}

mock! {
    pub TaskQueue {}

    #[async_trait]
    impl TaskQueue for TaskQueue {
        async fn push(&self, entry: QueueEntry) -> EngineResult<bool>;
        async fn pop_ready(&self, now: DateTime<Utc>) -> EngineResult<Option<QueueEntry>>;
        async fn remove(&self, task_id: Uuid) -> EngineResult<bool>;
        async fn promote_due(&self, now: DateTime<Utc>) -> EngineResult<usize>;
        async fn len(&self) -> EngineResult<usize>;
        async fn ready_len(&self, now: DateTime<Utc>) -> EngineResult<usize>;
        async fn len_before(&self, entry: &QueueEntry, now: DateTime<Utc>) -> EngineResult<usize>;
        async fn contains(&self, task_id: Uuid) -> EngineResult<bool>;
        fn backend_name(&self) -> &'static str;
    }
}
