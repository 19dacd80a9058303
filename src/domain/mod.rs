//! Domain Layer - 领域层
//!
//! 单一限界上下文:
//! - Control Context: 训练控制指令及其状态生命周期

pub mod control;

pub use control::{Command, CommandError, CommandStatus};
