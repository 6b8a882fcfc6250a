use std::str::FromStr;

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use taskq_dispatcher::GetTaskOptions;
use taskq_domain::{
    entities::{TaskPriority, TaskStatus},
    value_objects::{SortField, SortOrder, SubmitTaskRequest, TaskFilter, TaskQuery},
};
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    response::{created, success, PaginatedResponse},
    routes::AppState,
};

/// API 发起的操作在历史中记录的执行方
const API_ACTOR: &str = "api";

#[derive(Debug, Deserialize)]
pub struct BatchSubmitBody {
    pub tasks: Vec<SubmitTaskRequest>,
    #[serde(default)]
    pub fail_on_first_error: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListTasksParams {
    pub tenant_id: Option<String>,
    pub task_type: Option<String>,
    pub status: Option<String>,
    pub priority: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub sort_by: Option<SortField>,
    pub order: Option<SortOrder>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

impl ListTasksParams {
    fn into_query(self) -> ApiResult<TaskQuery> {
        let defaults = TaskQuery::default();
        Ok(TaskQuery {
            filter: TaskFilter {
                tenant_id: self.tenant_id,
                task_type: self.task_type,
                status: self.status.as_deref().map(TaskStatus::from_str).transpose()?,
                priority: self
                    .priority
                    .as_deref()
                    .map(TaskPriority::from_str)
                    .transpose()?,
                created_after: self.created_after,
                created_before: self.created_before,
            },
            sort_by: self.sort_by.unwrap_or(defaults.sort_by),
            order: self.order.unwrap_or(defaults.order),
            page: self.page.unwrap_or(defaults.page),
            page_size: self
                .page_size
                .unwrap_or(defaults.page_size)
                .clamp(1, TaskQuery::MAX_PAGE_SIZE),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct GetTaskParams {
    pub include_result: Option<bool>,
    pub include_history: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct ProgressBody {
    pub progress: i64,
    #[serde(default)]
    pub message: Option<String>,
    /// 上报方标识，缺省为 api
    #[serde(default)]
    pub reporter: Option<String>,
}

pub async fn submit_task(
    State(state): State<AppState>,
    body: Result<Json<SubmitTaskRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = body?;
    let receipt = state.controller.submit(request).await?;
    Ok(created(receipt))
}

pub async fn submit_batch(
    State(state): State<AppState>,
    body: Result<Json<BatchSubmitBody>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(batch) = body?;
    if batch.tasks.is_empty() {
        return Err(ApiError::BadRequest("tasks 不能为空".into()));
    }
    let result = state
        .controller
        .submit_batch(batch.tasks, batch.fail_on_first_error)
        .await?;
    Ok(success(result))
}

pub async fn list_tasks(
    State(state): State<AppState>,
    params: Result<Query<ListTasksParams>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(params) = params?;
    let page = state.controller.list(&params.into_query()?).await?;
    Ok(success(PaginatedResponse::from(page)))
}

pub async fn get_task(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
    params: Result<Query<GetTaskParams>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Path(id) = id?;
    let Query(params) = params?;
    let defaults = GetTaskOptions::default();
    let options = GetTaskOptions {
        include_result: params.include_result.unwrap_or(defaults.include_result),
        include_history: params.include_history.unwrap_or(defaults.include_history),
    };
    let details = state.controller.get(id, options).await?;
    Ok(success(details))
}

pub async fn cancel_task(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<impl IntoResponse> {
    let Path(id) = id?;
    let task = state.controller.cancel(id, API_ACTOR).await?;
    Ok(success(task))
}

pub async fn retry_task(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<impl IntoResponse> {
    let Path(id) = id?;
    let receipt = state.controller.retry(id, API_ACTOR).await?;
    Ok(success(receipt))
}

pub async fn update_progress(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
    body: Result<Json<ProgressBody>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Path(id) = id?;
    let Json(body) = body?;
    let reporter = body.reporter.unwrap_or_else(|| API_ACTOR.to_string());
    let task = state
        .controller
        .update_progress(id, body.progress, body.message, &reporter)
        .await?;
    Ok(success(task))
}

pub async fn task_types(State(state): State<AppState>) -> impl IntoResponse {
    success(state.controller.task_types().await)
}
