//! Command Store Port - 指令台账
//!
//! 定义指令存储的抽象接口，具体实现在 infrastructure/memory 层

use serde_json::Value;
use thiserror::Error;

use crate::domain::control::{Command, CommandError, CommandStatus};

/// Command Store 错误
#[derive(Debug, Error)]
pub enum CommandStoreError {
    #[error("Command not found: {0}")]
    NotFound(String),

    #[error("Command already exists: {0}")]
    DuplicateCommandId(String),

    #[error(transparent)]
    InvalidTransition(#[from] CommandError),
}

/// Command Store Port
///
/// 进程内指令台账：append-only 历史 + id 二级索引。
/// 所有操作 O(1)，内部锁不得跨网络 I/O 持有。
pub trait CommandStorePort: Send + Sync {
    /// 追加指令到历史并建立索引，id 重复时报错
    fn add(&self, command: Command) -> Result<(), CommandStoreError>;

    /// 就地更新指令状态，返回更新后的记录
    ///
    /// 未知 id 或非法迁移返回错误，由调用方决定记日志后丢弃
    fn update_status(
        &self,
        command_id: &str,
        new_status: CommandStatus,
        result: Option<Value>,
        error_message: Option<String>,
    ) -> Result<Command, CommandStoreError>;

    /// 查询指令，不存在返回 None
    fn get(&self, command_id: &str) -> Option<Command>;

    /// 按追加顺序返回某个 run 的全部指令
    fn list_for_run(&self, run_hash: &str) -> Vec<Command>;
}
