//! Trainctl - 训练过程远程控制面
//!
//! 让操作者（面板或 API 调用方）向长时间运行的训练进程下发控制指令，
//! 训练进程回报执行状态，两侧都能容忍瞬时断连。
//!
//! 领域层 (domain/):
//! - Control Context: 指令实体与状态生命周期
//!
//! 应用层 (application/):
//! - Ports: 端口定义（CommandStore）
//!
//! 基础设施层 (infrastructure/):
//! - Control: 连接注册表、指令/状态路由、WebSocket 协议帧
//! - HTTP: RESTful API + WebSocket 接入
//! - Memory: CommandStore 内存实现
//!
//! 客户端层 (client/):
//! - ControlClient: 训练进程内嵌 SDK，后台线程 + 非阻塞轮询

pub mod application;
pub mod client;
pub mod config;
pub mod domain;
pub mod infrastructure;

pub use client::{ClientState, ControlClient, ControlClientConfig};
pub use config::{load_config, AppConfig};
pub use domain::control::{Command, CommandStatus};
