use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use taskq_dispatcher::TaskController;

use crate::handlers::{
    events::{events, task_events},
    system::{get_stats, health_check, metrics},
    tasks::{
        cancel_task, get_task, list_tasks, retry_task, submit_batch, submit_task, task_types,
        update_progress,
    },
};

/// API应用状态
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<TaskController>,
    /// 未安装 Prometheus recorder 时为 None，`/metrics` 返回 404
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(controller: Arc<TaskController>) -> Self {
        Self {
            controller,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

/// 创建API路由
pub fn create_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        // 任务提交与控制
        .route("/api/tasks", get(list_tasks).post(submit_task))
        .route("/api/tasks/batch", post(submit_batch))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/cancel", post(cancel_task))
        .route("/api/tasks/{id}/retry", post(retry_task))
        .route("/api/tasks/{id}/progress", post(update_progress))
        // 状态订阅
        .route("/api/tasks/{id}/events", get(task_events))
        .route("/api/events", get(events))
        .route("/api/stats", get(get_stats))
        .route("/api/task-types", get(task_types))
        .with_state(state)
}
