use std::time::Duration;

use axum::extract::{Path, State};
use axum::Json;
use base64::{engine::general_purpose, Engine as _};
use quay_common::api::{ExecRequest, ExecResponse, NodeInfo, RenameNodeRequest};
use serde_json::{json, Value};

use crate::app_state::AppState;
use crate::dispatch::DispatchError;
use crate::error::{ApiResult, AppError};
use crate::services;

pub async fn list_nodes(State(state): State<AppState>) -> ApiResult<Json<Vec<NodeInfo>>> {
    let nodes = services::nodes::list_nodes(&state).await?;
    Ok(Json(nodes))
}

pub async fn rename_node(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    Json(req): Json<RenameNodeRequest>,
) -> ApiResult<Json<Value>> {
    services::nodes::rename_node(&state, &node_id, &req.name).await?;
    Ok(Json(json!({ "status": "ok" })))
}

pub async fn exec_command(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    Json(req): Json<ExecRequest>,
) -> ApiResult<Json<ExecResponse>> {
    let command = req.command.trim();
    if command.is_empty() {
        return Err(AppError::invalid_argument("command is required"));
    }
    let timeout = req.timeout_secs.map(Duration::from_secs);

    let reply = state
        .dispatcher
        .execute(node_id.trim(), command, req.args, timeout)
        .await
        .map_err(|err| match err {
            DispatchError::NotConnected(node) => {
                AppError::not_found(format!("node {node} is not connected"))
            }
            DispatchError::SendFailed => {
                // The frame may or may not have reached the agent.
                AppError::send_failed("failed to push command to agent")
            }
            DispatchError::DeadlineExceeded => AppError::deadline_exceeded("command timed out"),
        })?;

    Ok(Json(ExecResponse {
        exit_code: reply.exit_code,
        output_b64: general_purpose::STANDARD.encode(&reply.output),
        error: reply.error,
    }))
}
