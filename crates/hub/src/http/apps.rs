use axum::extract::{Path, Query, State};
use axum::Json;
use quay_common::api::{AppSummary, DeployRequest, TaskStatusUpdate, TaskView, UpdateAppRequest};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::app_state::AppState;
use crate::error::ApiResult;
use crate::services::rollout;

pub async fn deploy(
    State(state): State<AppState>,
    Json(req): Json<DeployRequest>,
) -> ApiResult<Json<AppSummary>> {
    let summary = rollout::deploy(state.db()?, req).await?;
    Ok(Json(summary))
}

pub async fn list_apps(State(state): State<AppState>) -> ApiResult<Json<Vec<AppSummary>>> {
    let apps = rollout::list_apps(state.db()?).await?;
    Ok(Json(apps))
}

pub async fn update_app(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
    Json(req): Json<UpdateAppRequest>,
) -> ApiResult<Json<AppSummary>> {
    let summary = rollout::update_app(state.db()?, &app_id, req).await?;
    Ok(Json(summary))
}

pub async fn delete_app(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
) -> ApiResult<Json<Value>> {
    rollout::delete_app(state.db()?, &app_id).await?;
    Ok(Json(json!({ "status": "terminated" })))
}

pub async fn backup_state(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let snapshot = rollout::backup_state(state.db()?).await?;
    Ok(Json(snapshot))
}

#[derive(Debug, Deserialize)]
pub struct TaskFilter {
    pub node_id: Option<String>,
    pub status: Option<String>,
}

pub async fn list_tasks(
    State(state): State<AppState>,
    Query(filter): Query<TaskFilter>,
) -> ApiResult<Json<Vec<TaskView>>> {
    let tasks = rollout::list_tasks(
        state.db()?,
        filter.node_id.as_deref(),
        filter.status.as_deref(),
    )
    .await?;
    Ok(Json(tasks))
}

pub async fn update_task_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Json(update): Json<TaskStatusUpdate>,
) -> ApiResult<Json<Value>> {
    rollout::update_task_status(state.db()?, &task_id, &update.status).await?;
    Ok(Json(json!({ "status": "ok" })))
}
