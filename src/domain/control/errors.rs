//! Control Context - Errors

use thiserror::Error;

use super::CommandStatus;

#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
    #[error("非法状态迁移: {from} → {to}")]
    InvalidTransition {
        from: CommandStatus,
        to: CommandStatus,
    },

    #[error("未知状态: {0}")]
    UnknownStatus(String),
}
