//! 任务控制器
//!
//! 提交、查询、取消、重试、进度上报与订阅的统一入口，HTTP 适配层与嵌入方都通过它操作任务。

use std::str::FromStr;
use std::sync::Arc;

use taskq_config::TaskDefaultsConfig;
use taskq_domain::{
    entities::{Task, TaskPriority, TaskStatus},
    events::{EventFilter, StatusUpdateEvent},
    ports::{clamp_progress, TaskTypeCatalog},
    value_objects::{
        BatchSubmitResult, Page, StatusTransition, SubmitReceipt, SubmitTaskRequest, TaskDetails,
        TaskQuery, TaskUpdate,
    },
};
use taskq_errors::{EngineError, EngineResult};
use taskq_infrastructure::{MetricsCollector, Subscription};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::cancellation::CancellationRegistry;
use crate::claim::ClaimCoordinator;
use crate::lifecycle::TaskLifecycle;
use crate::statistics::{StatisticsAggregator, TaskStatistics};

/// 并发修改导致条件更新失败时的重读次数
const MAX_CAS_ATTEMPTS: usize = 3;

/// 查询单个任务时的可选内容
#[derive(Debug, Clone, Copy)]
pub struct GetTaskOptions {
    pub include_result: bool,
    pub include_history: bool,
}

impl Default for GetTaskOptions {
    fn default() -> Self {
        Self {
            include_result: true,
            include_history: false,
        }
    }
}

pub struct TaskController {
    lifecycle: Arc<TaskLifecycle>,
    coordinator: Arc<ClaimCoordinator>,
    cancellations: Arc<CancellationRegistry>,
    catalog: Arc<dyn TaskTypeCatalog>,
    statistics: Arc<StatisticsAggregator>,
    defaults: TaskDefaultsConfig,
}

impl TaskController {
    pub fn new(
        lifecycle: Arc<TaskLifecycle>,
        coordinator: Arc<ClaimCoordinator>,
        cancellations: Arc<CancellationRegistry>,
        catalog: Arc<dyn TaskTypeCatalog>,
        statistics: Arc<StatisticsAggregator>,
        defaults: TaskDefaultsConfig,
    ) -> Self {
        Self {
            lifecycle,
            coordinator,
            cancellations,
            catalog,
            statistics,
            defaults,
        }
    }

    /// 校验提交请求并构造任务，不做任何持久化
    pub async fn validate(&self, request: &SubmitTaskRequest) -> EngineResult<Task> {
        let task_type = request.task_type.trim();
        if task_type.is_empty() {
            return Err(EngineError::validation("task_type 不能为空"));
        }
        if !self.catalog.supports(task_type).await {
            return Err(EngineError::validation(format!("不支持的任务类型: {task_type}")));
        }
        let tenant_id = request.tenant_id.trim();
        if tenant_id.is_empty() {
            return Err(EngineError::validation("tenant_id 不能为空"));
        }
        let priority = match request.priority.as_deref() {
            Some(p) => TaskPriority::from_str(p)?,
            None => TaskPriority::default(),
        };
        let payload = request
            .payload
            .clone()
            .ok_or_else(|| EngineError::validation("payload 不能为空"))?;

        let max_retries = request
            .max_retries
            .unwrap_or(self.defaults.default_max_retries);
        if max_retries > self.defaults.max_retries_limit {
            return Err(EngineError::validation(format!(
                "max_retries 不能超过 {}",
                self.defaults.max_retries_limit
            )));
        }

        let max_timeout_ms = self.defaults.max_timeout_seconds.saturating_mul(1000);
        let timeout_ms = request
            .timeout_ms
            .unwrap_or(self.defaults.default_timeout_seconds.saturating_mul(1000));
        if timeout_ms == 0 || timeout_ms > max_timeout_ms {
            return Err(EngineError::validation(format!(
                "timeout_ms 必须在 1 到 {max_timeout_ms} 之间"
            )));
        }

        let mut task = Task::new(task_type, tenant_id, payload, self.lifecycle.now());
        task.priority = priority;
        task.max_retries = max_retries;
        task.timeout_ms = timeout_ms;
        task.scheduled_for = request.scheduled_for;
        Ok(task)
    }

    /// 提交单个任务
    ///
    /// 任务写入存储后即视为已受理；入队失败时返回的排队位置为 0，由恢复扫描补入队列。
    #[instrument(skip(self, request), fields(task_type = %request.task_type, tenant_id = %request.tenant_id))]
    pub async fn submit(&self, request: SubmitTaskRequest) -> EngineResult<SubmitReceipt> {
        let task = match self.validate(&request).await {
            Ok(task) => task,
            Err(e) => {
                MetricsCollector::record_submit_rejected("validation");
                return Err(e);
            }
        };
        self.persist(task).await
    }

    async fn persist(&self, task: Task) -> EngineResult<SubmitReceipt> {
        let created = self.lifecycle.create(&task).await?;
        MetricsCollector::record_task_submitted(created.task_type.as_str(), created.priority.as_str());

        let queue_position = match self.coordinator.enqueue(&created).await {
            Ok(position) => position,
            Err(e) => {
                warn!(task_id = %created.id, "任务已保存但入队失败，等待恢复扫描: {}", e);
                0
            }
        };
        info!(
            task_id = %created.id,
            priority = %created.priority,
            queue_position,
            "任务已提交"
        );
        Ok(receipt(&created, queue_position))
    }

    /// 批量提交
    ///
    /// `fail_on_first_error` 为 true 时先整体校验，任一校验失败则整批拒绝；
    /// 持久化过程中遇到基础设施错误则停止处理剩余任务，已提交的任务保留。
    pub async fn submit_batch(
        &self,
        requests: Vec<SubmitTaskRequest>,
        fail_on_first_error: bool,
    ) -> EngineResult<BatchSubmitResult> {
        let mut result = BatchSubmitResult::default();

        if fail_on_first_error {
            let mut tasks = Vec::with_capacity(requests.len());
            for (index, request) in requests.iter().enumerate() {
                match self.validate(request).await {
                    Ok(task) => tasks.push(task),
                    Err(EngineError::Validation(msg)) => {
                        MetricsCollector::record_submit_rejected("validation");
                        return Err(EngineError::validation(format!("第 {index} 个任务: {msg}")));
                    }
                    Err(e) => return Err(e),
                }
            }
            for (index, task) in tasks.into_iter().enumerate() {
                match self.persist(task).await {
                    Ok(receipt) => result.push_success(index, receipt),
                    Err(e) => {
                        warn!("批量提交在第 {} 个任务处中止: {}", index, e);
                        result.push_failure(index, &e);
                        break;
                    }
                }
            }
        } else {
            for (index, request) in requests.into_iter().enumerate() {
                match self.submit(request).await {
                    Ok(receipt) => result.push_success(index, receipt),
                    Err(e) => result.push_failure(index, &e),
                }
            }
        }

        debug!(
            "批量提交完成: 成功 {}，失败 {}",
            result.total_submitted, result.total_failed
        );
        Ok(result)
    }

    pub async fn get(&self, id: Uuid, options: GetTaskOptions) -> EngineResult<TaskDetails> {
        let mut task = self.lifecycle.get(id).await?;
        if !options.include_result {
            task.result = None;
        }
        let history = if options.include_history {
            Some(self.lifecycle.repository().history(id).await?)
        } else {
            None
        };
        Ok(TaskDetails { task, history })
    }

    pub async fn list(&self, query: &TaskQuery) -> EngineResult<Page<Task>> {
        if query.page == 0 {
            return Err(EngineError::validation("page 从 1 开始"));
        }
        self.lifecycle.repository().list(query).await
    }

    /// 取消任务
    ///
    /// 排队中或等待重试的任务直接取消并移出队列；执行中的任务先提交取消状态，
    /// 再通知执行它的 Worker，该次执行之后的结果会被丢弃。终态任务返回冲突错误。
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: Uuid, actor: &str) -> EngineResult<Task> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let task = self.lifecycle.get(id).await?;
            if !task.status.is_cancelable() {
                return Err(EngineError::conflict(id, task.status, "cancel"));
            }

            let now = self.lifecycle.now();
            let at = task.started_at.map_or(now, |started| started.max(now));
            let transition = StatusTransition::new(TaskStatus::Canceled, actor, now)
                .with_update(TaskUpdate::new().completed_at(Some(at)))
                .with_message(format!("由 {actor} 取消"));

            match self.lifecycle.transition(id, task.status, transition).await {
                Ok(canceled) => {
                    match task.status {
                        TaskStatus::Processing => {
                            if !self.cancellations.cancel(id) {
                                debug!(task_id = %id, "任务不在本进程执行，由执行方轮询发现取消");
                            }
                        }
                        _ => {
                            if let Err(e) = self.coordinator.remove(id).await {
                                // 条目留在队列中也不会被执行，领取时条件更新会失败
                                warn!(task_id = %id, "移出队列失败: {}", e);
                            }
                        }
                    }
                    info!(task_id = %id, from = %task.status, "任务已取消");
                    return Ok(canceled);
                }
                Err(e) if e.is_conflict() && attempt < MAX_CAS_ATTEMPTS => {
                    debug!(task_id = %id, "取消时状态已变化，重新读取");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// 人工重试：只允许 failed 任务，重置执行相关字段后重新排队
    #[instrument(skip(self))]
    pub async fn retry(&self, id: Uuid, actor: &str) -> EngineResult<SubmitReceipt> {
        let task = self.lifecycle.get(id).await?;
        if task.status != TaskStatus::Failed {
            return Err(EngineError::conflict(id, task.status, "retry"));
        }

        let transition = StatusTransition::new(TaskStatus::Queued, actor, self.lifecycle.now())
            .with_update(
                TaskUpdate::new()
                    .progress(0)
                    .retry_count(0)
                    .result(None)
                    .error_message(None)
                    .worker_id(None)
                    .started_at(None)
                    .completed_at(None)
                    .scheduled_for(None),
            )
            .with_message(format!("由 {actor} 手动重试"));
        let queued = self
            .lifecycle
            .transition(id, TaskStatus::Failed, transition)
            .await?;

        let queue_position = match self.coordinator.enqueue(&queued).await {
            Ok(position) => position,
            Err(e) => {
                warn!(task_id = %id, "重试任务入队失败，等待恢复扫描: {}", e);
                0
            }
        };
        info!(task_id = %id, "任务已重新排队");
        Ok(receipt(&queued, queue_position))
    }

    /// 上报进度，数值先截断到 [0, 100]，低于已记录的进度会被拒绝
    pub async fn update_progress(
        &self,
        id: Uuid,
        progress: i64,
        message: Option<String>,
        actor: &str,
    ) -> EngineResult<Task> {
        self.lifecycle
            .progress(id, clamp_progress(progress), actor, message)
            .await
    }

    /// 订阅状态事件
    ///
    /// 单任务订阅会先确认任务存在；订阅时任务已处于终态则只收到一个快照事件。
    pub async fn subscribe(&self, filter: EventFilter) -> EngineResult<Subscription> {
        let mut subscription = self.lifecycle.broadcaster().subscribe(filter.clone());
        if let Some(task_id) = filter.task_id {
            let task = self.lifecycle.get(task_id).await?;
            if task.is_terminal() {
                subscription.prepend(StatusUpdateEvent::snapshot(&task));
            }
        }
        Ok(subscription)
    }

    pub async fn statistics(&self, tenant_id: Option<&str>) -> EngineResult<TaskStatistics> {
        self.statistics.collect(tenant_id).await
    }

    pub async fn task_types(&self) -> Vec<String> {
        self.catalog.task_types().await
    }

    pub async fn health_check(&self) -> EngineResult<()> {
        self.lifecycle.repository().health_check().await?;
        self.coordinator.queue().len().await?;
        Ok(())
    }
}

fn receipt(task: &Task, queue_position: usize) -> SubmitReceipt {
    SubmitReceipt {
        task_id: task.id,
        status: task.status,
        progress: task.progress,
        queue_position,
        created_at: task.created_at,
        scheduled_for: task.scheduled_for,
    }
}
