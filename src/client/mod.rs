//! Client Layer - 训练侧 SDK
//!
//! 嵌入训练进程的控制客户端，独立于服务端运行时（纯阻塞 I/O + 线程）

mod control_client;

pub use control_client::{ClientState, ControlClient, ControlClientConfig};
