use async_trait::async_trait;
use chrono::{DateTime, Utc};
use taskq_errors::EngineResult;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::entities::{Payload, Task};

/// 执行上下文，随每次执行尝试创建
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub task_id: Uuid,
    pub task_type: String,
    pub tenant_id: String,
    /// 从 1 开始的执行尝试序号
    pub attempt: u32,
    pub worker_id: String,
    pub deadline: DateTime<Utc>,
    cancellation: CancellationToken,
}

impl ExecutionContext {
    pub fn new(
        task: &Task,
        worker_id: impl Into<String>,
        deadline: DateTime<Utc>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            task_id: task.id,
            task_type: task.task_type.as_str().to_string(),
            tenant_id: task.tenant_id.clone(),
            attempt: task.retry_count + 1,
            worker_id: worker_id.into(),
            deadline,
            cancellation,
        }
    }

    /// 协作式取消：执行器应在合适的检查点调用
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// 等待取消信号，适合与业务 future 一起 select
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }
}

/// 执行器上报的原始进度，数值在中继时才被截断到 [0, 100]
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub task_id: Uuid,
    pub progress: i64,
    pub message: Option<String>,
}

pub fn clamp_progress(progress: i64) -> u8 {
    progress.clamp(0, 100) as u8
}

/// 进度上报句柄
///
/// 执行器通过消息传递上报进度，由 Worker 侧的中继负责持久化与广播
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    task_id: Uuid,
    sender: mpsc::Sender<ProgressUpdate>,
}

impl ProgressReporter {
    pub fn channel(task_id: Uuid, capacity: usize) -> (Self, mpsc::Receiver<ProgressUpdate>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { task_id, sender }, receiver)
    }

    /// 返回 false 表示中继已关闭（任务已结束或被取消）
    pub async fn report(&self, progress: i64, message: Option<String>) -> bool {
        self.sender
            .send(ProgressUpdate {
                task_id: self.task_id,
                progress,
                message,
            })
            .await
            .is_ok()
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }
}

/// 任务执行器
///
/// 执行器是外部提供的业务逻辑，引擎只负责调度、超时、取消和结果持久化。
/// 返回 Err 会按重试策略处理，panic 会被捕获并视为一次失败。
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    async fn execute(
        &self,
        context: ExecutionContext,
        payload: Payload,
        progress: ProgressReporter,
    ) -> EngineResult<Payload>;
}
