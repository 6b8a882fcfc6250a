//! 领域仓储抽象
//!
//! 定义任务存储的抽象接口，所有状态变更都必须通过条件更新完成

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use taskq_errors::EngineResult;
use uuid::Uuid;

use crate::entities::{Task, TaskHistoryEntry, TaskStatus};
use crate::value_objects::{Page, StatusTransition, TaskAggregate, TaskQuery, TransitionOutcome};

/// 任务仓储抽象
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// 持久化新任务，并写入一条 None -> queued 的审计记录
    async fn create(&self, task: &Task) -> EngineResult<TransitionOutcome>;

    async fn get(&self, id: Uuid) -> EngineResult<Option<Task>>;

    async fn list(&self, query: &TaskQuery) -> EngineResult<Page<Task>>;

    /// 条件状态转换
    ///
    /// 仅当当前状态等于 `expected` 时生效，状态、附带字段与审计记录在同一事务内写入。
    /// 当前状态不符时返回 `Conflict`，任务不存在时返回 `TaskNotFound`。
    async fn update_status(
        &self,
        id: Uuid,
        expected: TaskStatus,
        transition: StatusTransition,
    ) -> EngineResult<TransitionOutcome>;

    /// 仅 processing 状态可更新进度，且不允许回退；成功时同样写入一条审计记录
    async fn update_progress(
        &self,
        id: Uuid,
        progress: u8,
        actor: &str,
        message: Option<String>,
        at: DateTime<Utc>,
    ) -> EngineResult<TransitionOutcome>;

    async fn append_history(&self, entry: &TaskHistoryEntry) -> EngineResult<TaskHistoryEntry>;

    /// 按写入顺序返回审计记录
    async fn history(&self, id: Uuid) -> EngineResult<Vec<TaskHistoryEntry>>;

    /// 按 created_at 升序返回指定状态的任务
    async fn find_by_status(&self, status: TaskStatus, limit: u32) -> EngineResult<Vec<Task>>;

    async fn aggregate(&self, tenant_id: Option<&str>) -> EngineResult<TaskAggregate>;

    /// completed_at 不早于 since 的已完成任务数，用于吞吐量统计
    async fn count_completed_since(
        &self,
        tenant_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> EngineResult<u64>;

    async fn health_check(&self) -> EngineResult<()>;
}
