//! Control Layer - 连接注册与指令路由
//!
//! - protocol: WebSocket 帧定义（服务端与训练端客户端共用）
//! - manager: 连接注册表 + 指令/状态路由中枢

mod manager;
mod protocol;

pub use manager::{ClientConnection, ControlConnectionManager, RunConnections};
pub use protocol::{ClientFrame, ConnectionType, ErrorCode, ServerFrame};
