//! # TaskQ API
//!
//! 任务引擎的 HTTP 适配层，基于 Axum 把 [`TaskController`] 暴露为 REST 接口，
//! 状态订阅通过 Server-Sent Events 推送。
//!
//! ## API 端点
//!
//! - `POST /api/tasks` - 提交任务
//! - `POST /api/tasks/batch` - 批量提交
//! - `GET /api/tasks` - 按租户/类型/状态/优先级/时间过滤并分页
//! - `GET /api/tasks/{id}` - 任务详情，`include_history=true` 附带状态历史
//! - `POST /api/tasks/{id}/cancel` - 取消任务
//! - `POST /api/tasks/{id}/retry` - 重新执行失败的任务
//! - `POST /api/tasks/{id}/progress` - 执行方上报进度
//! - `GET /api/tasks/{id}/events` - 单任务事件流
//! - `GET /api/events` - 过滤后的事件流
//! - `GET /api/stats` - 统计信息
//! - `GET /health`、`GET /metrics`
//!
//! ## 错误响应
//!
//! ```json
//! {
//!   "error": {
//!     "message": "任务未找到: 6f1c...",
//!     "type": "TASK_NOT_FOUND",
//!     "code": 404,
//!     "retryable": false,
//!     "timestamp": "2024-01-01T00:00:00Z"
//!   }
//! }
//! ```
//!
//! [`TaskController`]: taskq_dispatcher::TaskController

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod response;
pub mod routes;

use axum::Router;
use taskq_config::ApiConfig;
use tower::ServiceBuilder;

use middleware::{cors_layer, request_logging, trace_layer};
pub use routes::{create_routes, AppState};

/// 创建完整的API应用
pub fn create_app(state: AppState, config: &ApiConfig) -> Router {
    let router = create_routes(state).layer(
        ServiceBuilder::new()
            .layer(trace_layer())
            .layer(axum::middleware::from_fn(request_logging)),
    );
    if config.cors_enabled {
        router.layer(cors_layer())
    } else {
        router
    }
}
