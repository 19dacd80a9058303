//! Control Context - 训练控制限界上下文
//!
//! 职责:
//! - 控制指令实体
//! - 指令状态生命周期与迁移校验

mod entities;
mod errors;

pub use entities::{Command, CommandStatus};
pub use errors::CommandError;
