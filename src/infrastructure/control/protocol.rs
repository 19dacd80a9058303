//! Control Protocol - WebSocket 帧定义
//!
//! 每个 run 一条 WebSocket 连接，路径携带 run_hash，
//! 查询参数 client_type 声明连接类型。帧为 JSON 文本。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::control::{Command, CommandStatus};

/// 连接类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    /// 训练进程
    Training,
    /// 前端面板
    Ui,
    /// API 调用方
    Api,
}

impl ConnectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::Training => "training",
            ConnectionType::Ui => "ui",
            ConnectionType::Api => "api",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "training" => Some(ConnectionType::Training),
            "ui" => Some(ConnectionType::Ui),
            "api" => Some(ConnectionType::Api),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 协议错误码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// JSON 解析失败
    InvalidJson,
    /// 帧结构与声明的类型不符
    BadRequest,
    /// 未知的 client_type
    UnknownClientType,
    /// 服务端内部错误（对端只见到不透明消息）
    InternalError,
}

/// 客户端 → 服务端帧
///
/// UI/API 端发送 command，训练端发送 status_update
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// 下发指令（UI/API 端）
    Command { data: Command },
    /// 指令状态上报（训练端）
    StatusUpdate {
        id: String,
        run_hash: String,
        status: CommandStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
}

/// 服务端 → 客户端帧
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// 指令投递（→ 训练端）
    Command { data: Command },
    /// 指令状态变更广播（→ UI 端）
    CommandUpdate { data: Command },
    /// 结构化错误回复，不关闭连接
    Error { error: ErrorCode, message: String },
}

impl ServerFrame {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            error: code,
            message: message.into(),
        }
    }
}
