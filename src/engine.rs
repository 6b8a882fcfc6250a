//! 任务引擎组装
//!
//! 把存储、队列、广播器、调度核心和 Worker 池按配置装配到一起，
//! 并提供显式的启动与停止。

use std::sync::Arc;
use std::time::Duration;

use taskq_config::AppConfig;
use taskq_dispatcher::{
    BackoffPolicy, CancellationRegistry, ClaimCoordinator, RecoveryService, StatisticsAggregator,
    TaskController, TaskLifecycle, TaskRetryService,
};
use taskq_domain::{
    ports::{Clock, SystemClock, TaskExecutor, TaskQueue},
    repositories::TaskRepository,
};
use taskq_errors::{EngineError, EngineResult};
use taskq_infrastructure::{
    create_task_queue, DatabaseManager, SqliteTaskRepository, StatusBroadcaster,
};
use taskq_worker::{ExecutorRegistry, TaskRunner, WorkerPool};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 引擎构建器
///
/// 未显式提供的组件按配置创建：存储使用 `database.url` 指向的 SQLite，
/// 队列使用 `queue.backend`，时钟使用系统时钟。
pub struct TaskEngineBuilder {
    config: AppConfig,
    repository: Option<Arc<dyn TaskRepository>>,
    queue: Option<Arc<dyn TaskQueue>>,
    clock: Option<Arc<dyn Clock>>,
    executors: Vec<Arc<dyn TaskExecutor>>,
}

impl TaskEngineBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            repository: None,
            queue: None,
            clock: None,
            executors: Vec::new(),
        }
    }

    pub fn repository(mut self, repository: Arc<dyn TaskRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn queue(mut self, queue: Arc<dyn TaskQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// 注册业务执行器，同名执行器以最后一次注册为准
    pub fn executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executors.push(executor);
        self
    }

    pub async fn build(self) -> EngineResult<TaskEngine> {
        let config = self.config;

        let (repository, database) = match self.repository {
            Some(repository) => (repository, None),
            None => {
                let manager = DatabaseManager::connect_and_migrate(&config.database).await?;
                let repository: Arc<dyn TaskRepository> =
                    Arc::new(SqliteTaskRepository::new(manager.pool().clone()));
                (repository, Some(manager))
            }
        };
        let queue = match self.queue {
            Some(queue) => queue,
            None => create_task_queue(&config.queue).await?,
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let broadcaster = StatusBroadcaster::new(&config.broadcast);
        let lifecycle = Arc::new(TaskLifecycle::new(
            repository.clone(),
            broadcaster,
            clock.clone(),
        ));
        let coordinator = Arc::new(ClaimCoordinator::new(lifecycle.clone(), queue.clone()));
        let retry = Arc::new(TaskRetryService::new(
            lifecycle.clone(),
            coordinator.clone(),
            BackoffPolicy::from_config(&config.retry),
        ));
        let cancellations = Arc::new(CancellationRegistry::new());

        let registry = Arc::new(ExecutorRegistry::with_builtin().await);
        for executor in self.executors {
            let name = executor.name().to_string();
            if registry.register(executor).await.is_some() {
                warn!("执行器 {} 被重复注册，使用最后一次注册的实现", name);
            }
        }

        let statistics = Arc::new(StatisticsAggregator::new(repository, queue, clock));
        let controller = Arc::new(TaskController::new(
            lifecycle.clone(),
            coordinator.clone(),
            cancellations.clone(),
            registry.clone(),
            statistics.clone(),
            config.tasks.clone(),
        ));
        let recovery = Arc::new(RecoveryService::new(
            lifecycle.clone(),
            coordinator.clone(),
            retry.clone(),
            cancellations.clone(),
            config.recovery.clone(),
        ));

        let runner = Arc::new(TaskRunner::new(
            registry.clone(),
            lifecycle.clone(),
            retry,
            cancellations,
            Duration::from_millis(config.worker.cancel_poll_interval_ms),
        ));
        let pool = WorkerPool::new(config.worker.clone(), runner, &lifecycle, coordinator);
        statistics.attach_worker_pool(pool.clone());

        Ok(TaskEngine {
            config,
            database,
            lifecycle,
            controller,
            registry,
            recovery,
            pool,
            background: Mutex::new(None),
        })
    }
}

struct Background {
    shutdown: CancellationToken,
    recovery: JoinHandle<()>,
}

/// 任务引擎
///
/// `start` 先执行一次恢复扫描（补齐内存队列、接管卡住的任务），
/// 再启动周期扫描和 Worker 池；`stop` 按相反顺序停止。
pub struct TaskEngine {
    config: AppConfig,
    database: Option<DatabaseManager>,
    lifecycle: Arc<TaskLifecycle>,
    controller: Arc<TaskController>,
    registry: Arc<ExecutorRegistry>,
    recovery: Arc<RecoveryService>,
    pool: Arc<WorkerPool>,
    background: Mutex<Option<Background>>,
}

impl TaskEngine {
    pub fn builder(config: AppConfig) -> TaskEngineBuilder {
        TaskEngineBuilder::new(config)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn controller(&self) -> Arc<TaskController> {
        self.controller.clone()
    }

    pub fn lifecycle(&self) -> &Arc<TaskLifecycle> {
        &self.lifecycle
    }

    pub fn registry(&self) -> &Arc<ExecutorRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn recovery(&self) -> &Arc<RecoveryService> {
        &self.recovery
    }

    pub async fn is_running(&self) -> bool {
        self.background.lock().await.is_some()
    }

    pub async fn start(&self) -> EngineResult<()> {
        let mut background = self.background.lock().await;
        if background.is_some() {
            return Err(EngineError::Internal("任务引擎已在运行".to_string()));
        }

        let report = self.recovery.run_once().await?;
        if report.total() > 0 {
            info!("启动恢复完成: {:?}", report);
        }

        let shutdown = CancellationToken::new();
        let recovery = self.recovery.clone().spawn(shutdown.child_token());
        if let Err(e) = self.pool.start().await {
            shutdown.cancel();
            if let Err(join_error) = recovery.await {
                warn!("恢复扫描任务异常退出: {}", join_error);
            }
            return Err(e);
        }

        *background = Some(Background { shutdown, recovery });
        info!(
            "任务引擎已启动: pool_size={}, queue={:?}",
            self.config.worker.pool_size,
            self.config.queue.backend
        );
        Ok(())
    }

    /// 停止引擎；未启动时直接返回
    pub async fn stop(&self) -> EngineResult<()> {
        let Some(background) = self.background.lock().await.take() else {
            return Ok(());
        };

        info!("正在停止任务引擎");
        let pool_result = self.pool.stop().await;
        background.shutdown.cancel();
        if let Err(e) = background.recovery.await {
            warn!("恢复扫描任务异常退出: {}", e);
        }
        pool_result?;
        info!("任务引擎已停止");
        Ok(())
    }

    /// 停止引擎并关闭数据库连接
    pub async fn shutdown(self) -> EngineResult<()> {
        self.stop().await?;
        if let Some(database) = &self.database {
            database.close().await;
        }
        Ok(())
    }
}
