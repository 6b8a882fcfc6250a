#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use taskq_config::{BroadcastConfig, TaskDefaultsConfig, WorkerConfig};
use taskq_dispatcher::{
    BackoffPolicy, CancellationRegistry, ClaimCoordinator, StatisticsAggregator, TaskController,
    TaskLifecycle, TaskRetryService,
};
use taskq_domain::{
    entities::{Task, TaskStatus},
    ports::{SystemClock, TaskExecutor, TaskQueue},
    value_objects::SubmitTaskRequest,
};
use taskq_infrastructure::{InMemoryTaskQueue, StatusBroadcaster};
use taskq_testing_utils::{wait_for_status, InMemoryTaskRepository};
use taskq_worker::{ExecutorRegistry, TaskRunner, WorkerPool};

pub const WAIT: Duration = Duration::from_secs(10);

pub fn worker_config(pool_size: usize) -> WorkerConfig {
    WorkerConfig {
        pool_size,
        worker_id_prefix: "test".to_string(),
        idle_poll_min_ms: 5,
        idle_poll_max_ms: 50,
        cancel_poll_interval_ms: 50,
        shutdown_timeout_seconds: 5,
    }
}

pub struct PoolHarness {
    pub repo: Arc<InMemoryTaskRepository>,
    pub lifecycle: Arc<TaskLifecycle>,
    pub coordinator: Arc<ClaimCoordinator>,
    pub cancellations: Arc<CancellationRegistry>,
    pub registry: Arc<ExecutorRegistry>,
    pub statistics: Arc<StatisticsAggregator>,
    pub controller: TaskController,
    pub pool: Arc<WorkerPool>,
}

impl PoolHarness {
    pub async fn new(config: WorkerConfig, executors: Vec<Arc<dyn TaskExecutor>>) -> Self {
        let repo = Arc::new(InMemoryTaskRepository::new());
        let queue: Arc<dyn TaskQueue> = Arc::new(InMemoryTaskQueue::new());
        let broadcaster = StatusBroadcaster::new(&BroadcastConfig::default());
        let lifecycle = Arc::new(TaskLifecycle::new(
            repo.clone(),
            broadcaster,
            Arc::new(SystemClock),
        ));
        let coordinator = Arc::new(ClaimCoordinator::new(lifecycle.clone(), queue.clone()));
        let retry = Arc::new(TaskRetryService::new(
            lifecycle.clone(),
            coordinator.clone(),
            BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(100), 0.0),
        ));
        let cancellations = Arc::new(CancellationRegistry::new());

        let registry = Arc::new(ExecutorRegistry::with_builtin().await);
        for executor in executors {
            registry.register(executor).await;
        }

        let statistics = Arc::new(StatisticsAggregator::new(
            repo.clone(),
            queue,
            Arc::new(SystemClock),
        ));
        let controller = TaskController::new(
            lifecycle.clone(),
            coordinator.clone(),
            cancellations.clone(),
            registry.clone(),
            statistics.clone(),
            TaskDefaultsConfig::default(),
        );

        let runner = Arc::new(TaskRunner::new(
            registry.clone(),
            lifecycle.clone(),
            retry,
            cancellations.clone(),
            Duration::from_millis(config.cancel_poll_interval_ms),
        ));
        let pool = WorkerPool::new(config, runner, &lifecycle, coordinator.clone());
        statistics.attach_worker_pool(pool.clone());

        Self {
            repo,
            lifecycle,
            coordinator,
            cancellations,
            registry,
            statistics,
            controller,
            pool,
        }
    }

    pub async fn submit(&self, request: SubmitTaskRequest) -> uuid::Uuid {
        self.controller.submit(request).await.unwrap().task_id
    }

    pub async fn wait_for(&self, id: uuid::Uuid, status: TaskStatus) -> Task {
        match wait_for_status(self.repo.as_ref(), id, status, WAIT).await {
            Some(task) => task,
            None => {
                let current = self.lifecycle.get(id).await.unwrap();
                panic!("task {id} never reached {status}, current: {}", current.status);
            }
        }
    }
}
