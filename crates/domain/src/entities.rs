use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taskq_errors::EngineError;
use uuid::Uuid;

/// 任务负载与结果均为不透明的键值映射
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// 任务状态
///
/// 状态机：
/// - queued -> processing | canceled
/// - processing -> completed | failed | retrying | canceled
/// - retrying -> queued | canceled
/// - failed -> queued (仅限人工重试)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Canceled,
    Retrying,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Queued,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Canceled,
        TaskStatus::Retrying,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
            TaskStatus::Retrying => "retrying",
        }
    }

    /// completed / failed / canceled 为终态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Canceled
        )
    }

    pub fn is_cancelable(&self) -> bool {
        matches!(
            self,
            TaskStatus::Queued | TaskStatus::Processing | TaskStatus::Retrying
        )
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Queued, Canceled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Retrying)
                | (Processing, Canceled)
                | (Retrying, Queued)
                | (Retrying, Canceled)
                | (Failed, Queued)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "queued" => Ok(TaskStatus::Queued),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "canceled" | "cancelled" => Ok(TaskStatus::Canceled),
            "retrying" => Ok(TaskStatus::Retrying),
            _ => Err(EngineError::validation(format!("无效的任务状态: {s}"))),
        }
    }
}

/// 任务优先级，排序即调度先后：Critical > High > Normal > Low
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl TaskPriority {
    pub const ALL: [TaskPriority; 4] = [
        TaskPriority::Critical,
        TaskPriority::High,
        TaskPriority::Normal,
        TaskPriority::Low,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Normal => "normal",
            TaskPriority::High => "high",
            TaskPriority::Critical => "critical",
        }
    }

    /// 数值越大越先调度
    pub fn rank(&self) -> u8 {
        match self {
            TaskPriority::Low => 0,
            TaskPriority::Normal => 1,
            TaskPriority::High => 2,
            TaskPriority::Critical => 3,
        }
    }

    pub fn from_rank(rank: u8) -> Option<Self> {
        match rank {
            0 => Some(TaskPriority::Low),
            1 => Some(TaskPriority::Normal),
            2 => Some(TaskPriority::High),
            3 => Some(TaskPriority::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskPriority {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(TaskPriority::Low),
            "normal" => Ok(TaskPriority::Normal),
            "high" => Ok(TaskPriority::High),
            "critical" => Ok(TaskPriority::Critical),
            _ => Err(EngineError::validation(format!("无效的任务优先级: {s}"))),
        }
    }
}

/// 任务类型标识
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskType(String);

impl TaskType {
    pub const DOCUMENT_PROCESSING: &'static str = "document_processing";
    pub const BATCH_PROCESSING: &'static str = "batch_processing";
    pub const KNOWLEDGE_INDEXING: &'static str = "knowledge_indexing";
    pub const EMBEDDING_GENERATION: &'static str = "embedding_generation";
    pub const VECTOR_STORAGE: &'static str = "vector_storage";
    pub const HEALTH_CHECK: &'static str = "health_check";

    pub const WELL_KNOWN: [&'static str; 6] = [
        Self::DOCUMENT_PROCESSING,
        Self::BATCH_PROCESSING,
        Self::KNOWLEDGE_INDEXING,
        Self::EMBEDDING_GENERATION,
        Self::VECTOR_STORAGE,
        Self::HEALTH_CHECK,
    ];

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskType {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TaskType {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// 任务实体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub tenant_id: String,
    pub payload: Payload,
    pub result: Option<Payload>,
    pub progress: u8,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error_message: Option<String>,
    pub worker_id: Option<String>,
    pub timeout_ms: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        task_type: impl Into<TaskType>,
        tenant_id: impl Into<String>,
        payload: Payload,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type: task_type.into(),
            status: TaskStatus::Queued,
            priority: TaskPriority::Normal,
            tenant_id: tenant_id.into(),
            payload,
            result: None,
            progress: 0,
            retry_count: 0,
            max_retries: 3,
            error_message: None,
            worker_id: None,
            timeout_ms: 300_000,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            scheduled_for: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// 重试次数用尽后不再自动重试
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// 任务最早可被领取的时间
    pub fn eligible_at(&self) -> DateTime<Utc> {
        match self.scheduled_for {
            Some(at) if at > self.created_at => at,
            _ => self.created_at,
        }
    }

    /// 处理中的任务超过超时时间加宽限期即视为卡死
    pub fn is_stuck(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        if self.status != TaskStatus::Processing {
            return false;
        }
        match self.started_at {
            Some(started) => chrono::Duration::from_std(self.timeout() + grace)
                .ok()
                .and_then(|limit| started.checked_add_signed(limit))
                .is_some_and(|deadline| deadline < now),
            None => false,
        }
    }
}

/// 状态变更审计记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskHistoryEntry {
    pub id: i64,
    pub task_id: Uuid,
    pub old_status: Option<TaskStatus>,
    pub new_status: TaskStatus,
    pub old_progress: u8,
    pub new_progress: u8,
    pub actor: String,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Worker运行状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Idle,
    Busy,
    Stopping,
    Stopped,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Busy => "busy",
            WorkerState::Stopping => "stopping",
            WorkerState::Stopped => "stopped",
        }
    }
}

/// Worker簿记信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub worker_id: String,
    pub state: WorkerState,
    pub current_task: Option<Uuid>,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// 已处理任务的平均耗时（毫秒）
    pub average_task_ms: f64,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl WorkerInfo {
    pub fn new(worker_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            worker_id: worker_id.into(),
            state: WorkerState::Idle,
            current_task: None,
            processed: 0,
            succeeded: 0,
            failed: 0,
            average_task_ms: 0.0,
            started_at: now,
            last_heartbeat: now,
        }
    }

    /// 记录一次执行结束，更新计数与滑动平均耗时
    pub fn record_finished(&mut self, succeeded: bool, elapsed_ms: f64, now: DateTime<Utc>) {
        self.processed += 1;
        if succeeded {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        self.average_task_ms += (elapsed_ms - self.average_task_ms) / self.processed as f64;
        self.current_task = None;
        self.last_heartbeat = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Canceled.is_terminal());
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
        assert!(!TaskStatus::Retrying.is_terminal());
    }

    #[test]
    fn test_worker_average_task_time() {
        let now = Utc::now();
        let mut info = WorkerInfo::new("worker-1", now);
        info.record_finished(true, 100.0, now);
        info.record_finished(false, 300.0, now);
        assert_eq!(info.processed, 2);
        assert_eq!(info.succeeded, 1);
        assert_eq!(info.failed, 1);
        assert!((info.average_task_ms - 200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_transitions() {
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Processing));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Retrying));
        assert!(TaskStatus::Retrying.can_transition_to(TaskStatus::Queued));
        assert!(TaskStatus::Failed.can_transition_to(TaskStatus::Queued));

        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Queued));
        assert!(!TaskStatus::Canceled.can_transition_to(TaskStatus::Queued));
        assert!(!TaskStatus::Queued.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Canceled));
    }

    #[test]
    fn test_priority_order() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
        for p in TaskPriority::ALL {
            assert_eq!(TaskPriority::from_rank(p.rank()), Some(p));
        }
    }

    #[test]
    fn test_parse_status_and_priority() {
        assert_eq!("QUEUED".parse::<TaskStatus>().unwrap(), TaskStatus::Queued);
        assert_eq!(
            "cancelled".parse::<TaskStatus>().unwrap(),
            TaskStatus::Canceled
        );
        assert!("bogus".parse::<TaskStatus>().is_err());
        assert_eq!(
            "critical".parse::<TaskPriority>().unwrap(),
            TaskPriority::Critical
        );
        let err = "urgent".parse::<TaskPriority>().unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_eligible_at_and_stuck() {
        let now = Utc::now();
        let mut task = Task::new(TaskType::HEALTH_CHECK, "t1", Payload::new(), now);
        assert_eq!(task.eligible_at(), now);

        let later = now + chrono::Duration::seconds(30);
        task.scheduled_for = Some(later);
        assert_eq!(task.eligible_at(), later);

        task.status = TaskStatus::Processing;
        task.timeout_ms = 1_000;
        task.started_at = Some(now);
        let grace = Duration::from_secs(1);
        assert!(!task.is_stuck(now + chrono::Duration::milliseconds(1_500), grace));
        assert!(task.is_stuck(now + chrono::Duration::seconds(3), grace));
    }

    #[test]
    fn test_status_serde() {
        let json = serde_json::to_string(&TaskStatus::Retrying).unwrap();
        assert_eq!(json, "\"retrying\"");
        let p: TaskPriority = serde_json::from_str("\"high\"").unwrap();
        assert_eq!(p, TaskPriority::High);
    }
}
