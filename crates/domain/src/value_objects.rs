use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::{Payload, Task, TaskHistoryEntry, TaskPriority, TaskStatus};

/// 任务提交请求
///
/// priority 保持字符串形式，非法取值在校验阶段作为 ValidationError 返回，
/// 这样批量提交时单个条目的错误不会让整批请求反序列化失败。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubmitTaskRequest {
    pub task_type: String,
    pub tenant_id: String,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub payload: Option<Payload>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl SubmitTaskRequest {
    pub fn new(task_type: impl Into<String>, tenant_id: impl Into<String>, payload: Payload) -> Self {
        Self {
            task_type: task_type.into(),
            tenant_id: tenant_id.into(),
            payload: Some(payload),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = Some(priority.as_str().to_string());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }
}

/// 提交回执
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub progress: u8,
    /// 入队时排在该任务之前的就绪条目数，仅作参考
    pub queue_position: usize,
    pub created_at: DateTime<Utc>,
    pub scheduled_for: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItemResult {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt: Option<SubmitReceipt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl BatchItemResult {
    pub fn is_success(&self) -> bool {
        self.receipt.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSubmitResult {
    pub total_submitted: usize,
    pub total_failed: usize,
    pub items: Vec<BatchItemResult>,
}

impl BatchSubmitResult {
    pub fn push_success(&mut self, index: usize, receipt: SubmitReceipt) {
        self.total_submitted += 1;
        self.items.push(BatchItemResult {
            index,
            receipt: Some(receipt),
            error: None,
            error_code: None,
        });
    }

    pub fn push_failure(&mut self, index: usize, error: &taskq_errors::EngineError) {
        self.total_failed += 1;
        self.items.push(BatchItemResult {
            index,
            receipt: None,
            error: Some(error.to_string()),
            error_code: Some(error.error_code().to_string()),
        });
    }
}

/// 任务详情查询结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDetails {
    pub task: Task,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<TaskHistoryEntry>>,
}

/// 任务列表过滤条件
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskFilter {
    pub tenant_id: Option<String>,
    pub task_type: Option<String>,
    pub status: Option<TaskStatus>,
    pub priority: Option<TaskPriority>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        self.tenant_id.as_deref().map_or(true, |t| t == task.tenant_id)
            && self
                .task_type
                .as_deref()
                .map_or(true, |t| t == task.task_type.as_str())
            && self.status.map_or(true, |s| s == task.status)
            && self.priority.map_or(true, |p| p == task.priority)
            && self.created_after.map_or(true, |at| task.created_at >= at)
            && self.created_before.map_or(true, |at| task.created_at <= at)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    CreatedAt,
    UpdatedAt,
    Priority,
    Status,
}

impl SortField {
    pub fn column(&self) -> &'static str {
        match self {
            SortField::CreatedAt => "created_at",
            SortField::UpdatedAt => "updated_at",
            SortField::Priority => "priority",
            SortField::Status => "status",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// 列表查询：过滤、排序与分页
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskQuery {
    pub filter: TaskFilter,
    pub sort_by: SortField,
    pub order: SortOrder,
    pub page: u32,
    pub page_size: u32,
}

impl TaskQuery {
    pub const MAX_PAGE_SIZE: u32 = 200;

    pub fn offset(&self) -> u64 {
        u64::from(self.page.max(1) - 1) * u64::from(self.page_size)
    }
}

impl Default for TaskQuery {
    fn default() -> Self {
        Self {
            filter: TaskFilter::default(),
            sort_by: SortField::default(),
            order: SortOrder::default(),
            page: 1,
            page_size: 20,
        }
    }
}

/// 分页结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

impl<T> Page<T> {
    pub fn total_pages(&self) -> u64 {
        if self.page_size == 0 {
            0
        } else {
            self.total.div_ceil(u64::from(self.page_size))
        }
    }
}

/// 随状态转换一起写入的字段
///
/// 外层 `Option` 表示“是否修改”，内层 `Option` 表示写入的值本身可以为空。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub progress: Option<u8>,
    pub result: Option<Option<Payload>>,
    pub error_message: Option<Option<String>>,
    pub retry_count: Option<u32>,
    pub worker_id: Option<Option<String>>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
    pub scheduled_for: Option<Option<DateTime<Utc>>>,
}

impl TaskUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress.min(100));
        self
    }

    pub fn result(mut self, result: Option<Payload>) -> Self {
        self.result = Some(result);
        self
    }

    pub fn error_message(mut self, message: Option<String>) -> Self {
        self.error_message = Some(message);
        self
    }

    pub fn retry_count(mut self, count: u32) -> Self {
        self.retry_count = Some(count);
        self
    }

    pub fn worker_id(mut self, worker_id: Option<String>) -> Self {
        self.worker_id = Some(worker_id);
        self
    }

    pub fn started_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn completed_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.completed_at = Some(at);
        self
    }

    pub fn scheduled_for(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn apply(&self, task: &mut Task) {
        if let Some(progress) = self.progress {
            task.progress = progress;
        }
        if let Some(result) = &self.result {
            task.result = result.clone();
        }
        if let Some(message) = &self.error_message {
            task.error_message = message.clone();
        }
        if let Some(count) = self.retry_count {
            task.retry_count = count;
        }
        if let Some(worker_id) = &self.worker_id {
            task.worker_id = worker_id.clone();
        }
        if let Some(at) = self.started_at {
            task.started_at = at;
        }
        if let Some(at) = self.completed_at {
            task.completed_at = at;
        }
        if let Some(at) = self.scheduled_for {
            task.scheduled_for = at;
        }
    }
}

/// 一次状态转换请求
#[derive(Debug, Clone, PartialEq)]
pub struct StatusTransition {
    pub to: TaskStatus,
    pub update: TaskUpdate,
    pub actor: String,
    pub message: Option<String>,
    pub at: DateTime<Utc>,
}

impl StatusTransition {
    pub fn new(to: TaskStatus, actor: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            to,
            update: TaskUpdate::default(),
            actor: actor.into(),
            message: None,
            at,
        }
    }

    pub fn with_update(mut self, update: TaskUpdate) -> Self {
        self.update = update;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// 状态转换成功后的结果：更新后的任务与对应审计记录
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionOutcome {
    pub task: Task,
    pub entry: TaskHistoryEntry,
}

/// 各状态计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub queued: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub canceled: u64,
    pub retrying: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: TaskStatus, n: u64) {
        match status {
            TaskStatus::Queued => self.queued += n,
            TaskStatus::Processing => self.processing += n,
            TaskStatus::Completed => self.completed += n,
            TaskStatus::Failed => self.failed += n,
            TaskStatus::Canceled => self.canceled += n,
            TaskStatus::Retrying => self.retrying += n,
        }
    }

    pub fn get(&self, status: TaskStatus) -> u64 {
        match status {
            TaskStatus::Queued => self.queued,
            TaskStatus::Processing => self.processing,
            TaskStatus::Completed => self.completed,
            TaskStatus::Failed => self.failed,
            TaskStatus::Canceled => self.canceled,
            TaskStatus::Retrying => self.retrying,
        }
    }

    pub fn total(&self) -> u64 {
        self.queued + self.processing + self.completed + self.failed + self.canceled + self.retrying
    }

    /// completed / (completed + failed)，没有终态样本时为 None
    pub fn success_rate(&self) -> Option<f64> {
        let finished = self.completed + self.failed;
        if finished == 0 {
            None
        } else {
            Some(self.completed as f64 / finished as f64)
        }
    }
}

/// 存储层聚合结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskAggregate {
    pub counts: StatusCounts,
    pub by_type: BTreeMap<String, StatusCounts>,
    pub by_priority: BTreeMap<String, StatusCounts>,
    pub by_tenant: BTreeMap<String, StatusCounts>,
    /// 已完成任务 started_at 到 completed_at 的平均耗时
    pub avg_processing_ms: Option<f64>,
}

impl TaskAggregate {
    pub fn record(
        &mut self,
        task_type: &str,
        priority: TaskPriority,
        tenant_id: &str,
        status: TaskStatus,
        n: u64,
    ) {
        self.counts.add(status, n);
        self.by_type
            .entry(task_type.to_string())
            .or_default()
            .add(status, n);
        self.by_priority
            .entry(priority.as_str().to_string())
            .or_default()
            .add(status, n);
        self.by_tenant
            .entry(tenant_id.to_string())
            .or_default()
            .add(status, n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::TaskType;

    #[test]
    fn test_update_apply() {
        let now = Utc::now();
        let mut task = Task::new(TaskType::HEALTH_CHECK, "t1", Payload::new(), now);
        task.worker_id = Some("worker-1".into());
        task.error_message = Some("boom".into());

        TaskUpdate::new()
            .progress(150)
            .retry_count(2)
            .worker_id(None)
            .error_message(None)
            .apply(&mut task);

        assert_eq!(task.progress, 100);
        assert_eq!(task.retry_count, 2);
        assert!(task.worker_id.is_none());
        assert!(task.error_message.is_none());
    }

    #[test]
    fn test_filter_matches() {
        let now = Utc::now();
        let task = Task::new(TaskType::HEALTH_CHECK, "tenant-a", Payload::new(), now);

        assert!(TaskFilter::default().matches(&task));
        let filter = TaskFilter {
            tenant_id: Some("tenant-a".into()),
            status: Some(TaskStatus::Queued),
            ..Default::default()
        };
        assert!(filter.matches(&task));
        let filter = TaskFilter {
            task_type: Some("document_processing".into()),
            ..Default::default()
        };
        assert!(!filter.matches(&task));
    }

    #[test]
    fn test_counts_and_aggregate() {
        let mut agg = TaskAggregate::default();
        agg.record("a", TaskPriority::High, "t1", TaskStatus::Completed, 3);
        agg.record("a", TaskPriority::Low, "t2", TaskStatus::Failed, 1);
        agg.record("b", TaskPriority::High, "t1", TaskStatus::Queued, 2);

        assert_eq!(agg.counts.total(), 6);
        assert_eq!(agg.by_type["a"].total(), 4);
        assert_eq!(agg.by_priority["high"].get(TaskStatus::Queued), 2);
        assert_eq!(agg.by_tenant["t1"].completed, 3);
        assert_eq!(agg.counts.success_rate(), Some(0.75));
        assert_eq!(StatusCounts::default().success_rate(), None);
    }

    #[test]
    fn test_query_offset_and_pages() {
        let query = TaskQuery {
            page: 3,
            page_size: 10,
            ..Default::default()
        };
        assert_eq!(query.offset(), 20);

        let page: Page<u8> = Page {
            items: vec![],
            total: 21,
            page: 1,
            page_size: 10,
        };
        assert_eq!(page.total_pages(), 3);
    }

    #[test]
    fn test_submit_request_deserialize_defaults() {
        let req: SubmitTaskRequest = serde_json::from_value(serde_json::json!({
            "task_type": "health_check",
            "tenant_id": "t1",
            "payload": {"message": "hi"}
        }))
        .unwrap();
        assert!(req.priority.is_none());
        assert!(req.max_retries.is_none());
        assert_eq!(req.payload.unwrap()["message"], "hi");
    }
}
