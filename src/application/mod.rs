//! 应用层
//!
//! 包含：
//! - ports: 六边形架构端口定义（CommandStore）

pub mod ports;

pub use ports::{CommandStoreError, CommandStorePort};
