use axum::{
    extract::{rejection::QueryRejection, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::{
    error::{ApiError, ApiResult},
    response::success,
    routes::AppState,
};

#[derive(Debug, Default, Deserialize)]
pub struct StatsParams {
    pub tenant_id: Option<String>,
}

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let (status, health) = match state.controller.health_check().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(e) => {
            warn!("健康检查失败: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
        }
    };
    (
        status,
        Json(json!({
            "status": health,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "service": "taskq",
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
}

pub async fn get_stats(
    State(state): State<AppState>,
    params: Result<Query<StatsParams>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(params) = params?;
    let stats = state
        .controller
        .statistics(params.tenant_id.as_deref())
        .await?;
    Ok(success(stats))
}

/// Prometheus 文本格式的指标
pub async fn metrics(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let handle = state.metrics.as_ref().ok_or(ApiError::NotFound)?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    ))
}
