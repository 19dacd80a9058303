//! Control Context - Entities

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::errors::CommandError;

/// 指令状态
///
/// 生命周期: pending → acknowledged → {completed, failed}
/// pending → failed 直达也合法（如投递失败）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    /// 已创建，等待训练端确认
    #[default]
    Pending,
    /// 训练端已确认
    Acknowledged,
    /// 执行完成（终态）
    Completed,
    /// 执行失败（终态）
    Failed,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Acknowledged => "acknowledged",
            CommandStatus::Completed => "completed",
            CommandStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(CommandStatus::Pending),
            "acknowledged" => Some(CommandStatus::Acknowledged),
            "completed" => Some(CommandStatus::Completed),
            "failed" => Some(CommandStatus::Failed),
            _ => None,
        }
    }

    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandStatus::Completed | CommandStatus::Failed)
    }

    /// 校验状态迁移
    ///
    /// 终态不可覆盖；同状态重复上报不算前进，一律拒绝
    pub fn validate_transition(&self, next: CommandStatus) -> Result<(), CommandError> {
        let allowed = match self {
            CommandStatus::Pending => matches!(
                next,
                CommandStatus::Acknowledged | CommandStatus::Completed | CommandStatus::Failed
            ),
            CommandStatus::Acknowledged => {
                matches!(next, CommandStatus::Completed | CommandStatus::Failed)
            }
            CommandStatus::Completed | CommandStatus::Failed => false,
        };

        if allowed {
            Ok(())
        } else {
            Err(CommandError::InvalidTransition {
                from: *self,
                to: next,
            })
        }
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 控制指令
///
/// 不变量:
/// - id 在同一 run 内唯一
/// - 创建后只能通过状态迁移变更，不可删除
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// 指令 ID
    pub id: String,
    /// 所属训练 run
    pub run_hash: String,
    /// 指令类型（如 pause / resume / adjust_lr）
    #[serde(rename = "type")]
    pub command_type: String,
    /// 指令参数（不透明的键值对）
    #[serde(default)]
    pub payload: Map<String, Value>,
    /// 当前状态
    #[serde(default)]
    pub status: CommandStatus,
    /// 训练端回报的执行结果
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// 失败时的错误说明
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Command {
    /// 创建新指令（自动生成 ID，初始状态 pending）
    pub fn new(
        run_hash: impl Into<String>,
        command_type: impl Into<String>,
        payload: Map<String, Value>,
    ) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), run_hash, command_type, payload)
    }

    /// 用指定 ID 创建指令（UI 端可自带 ID 以便幂等重试）
    pub fn with_id(
        id: impl Into<String>,
        run_hash: impl Into<String>,
        command_type: impl Into<String>,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            id: id.into(),
            run_hash: run_hash.into(),
            command_type: command_type.into(),
            payload,
            status: CommandStatus::Pending,
            result: None,
            error_message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use CommandStatus::*;

        assert!(Pending.validate_transition(Acknowledged).is_ok());
        assert!(Pending.validate_transition(Failed).is_ok());
        assert!(Pending.validate_transition(Completed).is_ok());
        assert!(Acknowledged.validate_transition(Completed).is_ok());
        assert!(Acknowledged.validate_transition(Failed).is_ok());

        // 终态不可覆盖
        assert!(Completed.validate_transition(Acknowledged).is_err());
        assert!(Completed.validate_transition(Failed).is_err());
        assert!(Failed.validate_transition(Completed).is_err());

        // 回退与原地踏步
        assert!(Acknowledged.validate_transition(Pending).is_err());
        assert!(Pending.validate_transition(Pending).is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!CommandStatus::Pending.is_terminal());
        assert!(!CommandStatus::Acknowledged.is_terminal());
        assert!(CommandStatus::Completed.is_terminal());
        assert!(CommandStatus::Failed.is_terminal());
    }

    #[test]
    fn test_status_string_mapping() {
        assert_eq!(CommandStatus::Acknowledged.as_str(), "acknowledged");
        assert_eq!(
            CommandStatus::from_str("failed"),
            Some(CommandStatus::Failed)
        );
        assert_eq!(CommandStatus::from_str("unknown"), None);
    }

    #[test]
    fn test_command_serialization_shape() {
        let cmd = Command::with_id("c1", "r1", "pause", Map::new());
        let json = serde_json::to_value(&cmd).unwrap();

        assert_eq!(json["id"], "c1");
        assert_eq!(json["type"], "pause");
        assert_eq!(json["status"], "pending");
        // result/error_message 未设置时不出现在输出中
        assert!(json.get("result").is_none());
        assert!(json.get("error_message").is_none());
    }

    #[test]
    fn test_command_deserialization_defaults() {
        let cmd: Command =
            serde_json::from_str(r#"{"id":"c1","run_hash":"r1","type":"pause"}"#).unwrap();
        assert_eq!(cmd.status, CommandStatus::Pending);
        assert!(cmd.payload.is_empty());
    }

    #[test]
    fn test_new_command_gets_unique_id() {
        let a = Command::new("r1", "pause", Map::new());
        let b = Command::new("r1", "pause", Map::new());
        assert_ne!(a.id, b.id);
    }
}
