//! Control Handlers - REST 薄层
//!
//! 只做参数搬运，路由逻辑全部在 ControlConnectionManager

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::domain::control::Command;
use crate::infrastructure::control::RunConnections;
use crate::infrastructure::http::dto::ApiResponse;
use crate::infrastructure::http::error::ApiError;
use crate::infrastructure::http::state::AppState;

// ============================================================================
// Send Command
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SendCommandRequest {
    /// 未指定时服务端生成
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub command_type: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

#[derive(Debug, Serialize)]
pub struct SendCommandResponse {
    /// 是否至少投递给了一个训练端连接
    pub delivered: bool,
    pub command: Command,
}

pub async fn send_command(
    State(state): State<Arc<AppState>>,
    Path(run_hash): Path<String>,
    Json(req): Json<SendCommandRequest>,
) -> Result<Json<ApiResponse<SendCommandResponse>>, ApiError> {
    let command = match req.id {
        Some(id) => Command::with_id(id, &run_hash, req.command_type, req.payload),
        None => Command::new(&run_hash, req.command_type, req.payload),
    };

    let delivered = state
        .connection_manager
        .send_command_to_training(&run_hash, command.clone())?;

    Ok(Json(ApiResponse::success(SendCommandResponse {
        delivered,
        command,
    })))
}

// ============================================================================
// Queries
// ============================================================================

pub async fn get_command(
    State(state): State<Arc<AppState>>,
    Path(command_id): Path<String>,
) -> Result<Json<ApiResponse<Command>>, ApiError> {
    state
        .command_store
        .get(&command_id)
        .map(|command| Json(ApiResponse::success(command)))
        .ok_or_else(|| ApiError::NotFound(format!("Command not found: {}", command_id)))
}

pub async fn list_run_commands(
    State(state): State<Arc<AppState>>,
    Path(run_hash): Path<String>,
) -> Json<ApiResponse<Vec<Command>>> {
    Json(ApiResponse::success(
        state.command_store.list_for_run(&run_hash),
    ))
}

pub async fn list_runs(
    State(state): State<Arc<AppState>>,
) -> Json<ApiResponse<Vec<RunConnections>>> {
    Json(ApiResponse::success(state.connection_manager.connected_runs()))
}
