#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use taskq::{AppConfig, TaskEngine};
use taskq_config::{
    ApiConfig, DatabaseConfig, ObservabilityConfig, RecoveryConfig, RetryConfig, WorkerConfig,
};
use taskq_domain::{
    entities::{Payload, Task, TaskStatus},
    ports::{ExecutionContext, ProgressReporter, TaskExecutor},
};
use taskq_errors::EngineResult;
use taskq_testing_utils::wait_for_status;
use uuid::Uuid;

pub const WAIT: Duration = Duration::from_secs(15);

/// 文件型 SQLite、内存队列、快速轮询和退避的测试配置
pub fn test_config(db_path: &Path, pool_size: usize) -> AppConfig {
    AppConfig {
        database: DatabaseConfig {
            url: format!("sqlite://{}", db_path.display()),
            max_connections: 8,
            busy_timeout_ms: 30_000,
        },
        worker: WorkerConfig {
            pool_size,
            worker_id_prefix: "it".to_string(),
            idle_poll_min_ms: 5,
            idle_poll_max_ms: 50,
            cancel_poll_interval_ms: 50,
            shutdown_timeout_seconds: 5,
        },
        retry: RetryConfig {
            base_delay_ms: 10,
            max_delay_ms: 100,
            jitter_factor: 0.0,
        },
        recovery: RecoveryConfig {
            sweep_interval_seconds: 1,
            stuck_grace_seconds: 30,
        },
        api: ApiConfig {
            enabled: false,
            ..Default::default()
        },
        observability: ObservabilityConfig {
            metrics_enabled: false,
            ..Default::default()
        },
        ..Default::default()
    }
}

pub async fn wait_for(engine: &TaskEngine, id: Uuid, status: TaskStatus) -> Task {
    let repo = engine.lifecycle().repository().clone();
    match wait_for_status(repo.as_ref(), id, status, WAIT).await {
        Some(task) => task,
        None => {
            let current = engine.lifecycle().get(id).await.unwrap();
            panic!("task {id} never reached {status}, current: {}", current.status);
        }
    }
}

/// 记录执行顺序和次数的执行器，payload 中的 label 作为标识
#[derive(Default)]
pub struct RecordingExecutor {
    order: Mutex<Vec<String>>,
}

impl RecordingExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn order(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskExecutor for RecordingExecutor {
    fn name(&self) -> &str {
        "recording"
    }

    async fn execute(
        &self,
        _context: ExecutionContext,
        payload: Payload,
        _progress: ProgressReporter,
    ) -> EngineResult<Payload> {
        let label = payload["label"].as_str().unwrap_or_default().to_string();
        self.order.lock().unwrap().push(label);
        Ok(Payload::new())
    }
}
