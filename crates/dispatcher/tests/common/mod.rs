#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use taskq_config::{BroadcastConfig, RecoveryConfig, TaskDefaultsConfig};
use taskq_dispatcher::{
    BackoffPolicy, CancellationRegistry, ClaimCoordinator, RecoveryService, StatisticsAggregator,
    TaskController, TaskLifecycle, TaskRetryService,
};
use taskq_domain::{
    entities::Task,
    ports::{StaticTaskTypeCatalog, TaskQueue},
    repositories::TaskRepository,
    value_objects::SubmitTaskRequest,
};
use taskq_infrastructure::{InMemoryTaskQueue, StatusBroadcaster};
use taskq_testing_utils::{InMemoryTaskRepository, ManualClock};

pub struct Harness {
    pub repo: Arc<InMemoryTaskRepository>,
    pub queue: Arc<dyn TaskQueue>,
    pub clock: Arc<ManualClock>,
    pub broadcaster: Arc<StatusBroadcaster>,
    pub lifecycle: Arc<TaskLifecycle>,
    pub coordinator: Arc<ClaimCoordinator>,
    pub retry: Arc<TaskRetryService>,
    pub cancellations: Arc<CancellationRegistry>,
    pub controller: TaskController,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_queue(Arc::new(InMemoryTaskQueue::new()))
    }

    pub fn with_queue(queue: Arc<dyn TaskQueue>) -> Self {
        let repo = Arc::new(InMemoryTaskRepository::new());
        let clock = Arc::new(ManualClock::starting_now());
        let broadcaster = StatusBroadcaster::new(&BroadcastConfig::default());
        let lifecycle = Arc::new(TaskLifecycle::new(
            repo.clone(),
            broadcaster.clone(),
            clock.clone(),
        ));
        let coordinator = Arc::new(ClaimCoordinator::new(lifecycle.clone(), queue.clone()));
        let retry = Arc::new(TaskRetryService::new(
            lifecycle.clone(),
            coordinator.clone(),
            BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60), 0.0),
        ));
        let cancellations = Arc::new(CancellationRegistry::new());
        let statistics = Arc::new(StatisticsAggregator::new(
            repo.clone(),
            queue.clone(),
            clock.clone(),
        ));
        let controller = TaskController::new(
            lifecycle.clone(),
            coordinator.clone(),
            cancellations.clone(),
            Arc::new(StaticTaskTypeCatalog::well_known()),
            statistics,
            TaskDefaultsConfig::default(),
        );
        Self {
            repo,
            queue,
            clock,
            broadcaster,
            lifecycle,
            coordinator,
            retry,
            cancellations,
            controller,
        }
    }

    pub fn recovery(&self, config: RecoveryConfig) -> RecoveryService {
        RecoveryService::new(
            self.lifecycle.clone(),
            self.coordinator.clone(),
            self.retry.clone(),
            self.cancellations.clone(),
            config,
        )
    }

    pub async fn submit(&self, request: SubmitTaskRequest) -> Task {
        let receipt = self.controller.submit(request).await.unwrap();
        self.task(receipt.task_id).await
    }

    pub async fn task(&self, id: uuid::Uuid) -> Task {
        self.repo.get(id).await.unwrap().unwrap()
    }

    /// 领取下一个就绪任务
    pub async fn claim(&self, worker_id: &str) -> Option<Task> {
        self.coordinator.claim_next(worker_id).await.unwrap()
    }
}
