//! Server-Sent Events 状态订阅

use std::str::FromStr;

use axum::{
    extract::{
        rejection::{PathRejection, QueryRejection},
        Path, Query, State,
    },
    response::sse::{Event, KeepAlive, Sse},
};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use taskq_domain::{entities::TaskStatus, events::EventFilter};
use taskq_infrastructure::Subscription;
use uuid::Uuid;

use crate::{error::ApiResult, routes::AppState};

#[derive(Debug, Default, Deserialize)]
pub struct EventParams {
    pub tenant_id: Option<String>,
    pub task_type: Option<String>,
    pub status: Option<String>,
}

/// 单任务事件流，任务进入终态后结束
pub async fn task_events(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, axum::Error>>>> {
    let Path(id) = id?;
    let subscription = state.controller.subscribe(EventFilter::for_task(id)).await?;
    Ok(into_sse(subscription))
}

/// 按租户/类型/状态过滤的事件流，客户端断开时注销
pub async fn events(
    State(state): State<AppState>,
    params: Result<Query<EventParams>, QueryRejection>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, axum::Error>>>> {
    let Query(params) = params?;
    let filter = EventFilter {
        task_id: None,
        tenant_id: params.tenant_id,
        task_type: params.task_type,
        status: params.status.as_deref().map(TaskStatus::from_str).transpose()?,
    };
    let subscription = state.controller.subscribe(filter).await?;
    Ok(into_sse(subscription))
}

fn into_sse(subscription: Subscription) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let stream = subscription
        .into_stream()
        .map(|event| Event::default().event(event.event_type()).json_data(&event));
    Sse::new(stream).keep_alive(KeepAlive::default())
}
