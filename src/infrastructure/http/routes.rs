//! HTTP Routes
//!
//! API Endpoints:
//! - /api/ping                            GET   健康检查
//! - /api/control/runs                    GET   当前有连接的 run 列表
//! - /api/control/commands/:command_id    GET   查询单条指令
//! - /api/control/:run_hash/command       POST  下发指令到训练端
//! - /api/control/:run_hash/commands      GET   run 的指令历史
//! - /api/control/:run_hash/ws            WS    控制 WebSocket（?client_type=training|ui|api）

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use super::handlers;
use super::state::AppState;

/// 创建所有路由
pub fn create_routes() -> Router<Arc<AppState>> {
    Router::new().nest("/api", api_routes())
}

/// API 路由
fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/ping", get(handlers::ping))
        .nest("/control", control_routes())
}

/// Control 路由
fn control_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/runs", get(handlers::list_runs))
        .route("/commands/:command_id", get(handlers::get_command))
        .route("/:run_hash/command", post(handlers::send_command))
        .route("/:run_hash/commands", get(handlers::list_run_commands))
        .route("/:run_hash/ws", get(handlers::control_websocket))
}
