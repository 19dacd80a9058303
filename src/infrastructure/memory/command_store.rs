//! In-Memory Command Store Implementation

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

use crate::application::ports::{CommandStoreError, CommandStorePort};
use crate::domain::control::{Command, CommandStatus};

/// 台账内部状态
///
/// 不变量: index 中的每个 id 恰好指向 history 中的一条记录，且 id 不重复
#[derive(Default)]
struct StoreInner {
    /// 追加序历史
    history: Vec<Command>,
    /// id → history 下标
    index: HashMap<String, usize>,
}

/// 内存指令台账
///
/// 持久性仅限进程生命周期，无崩溃恢复。
/// 单把锁覆盖历史与索引，锁内只做内存变更。
pub struct InMemoryCommandStore {
    inner: Mutex<StoreInner>,
}

impl InMemoryCommandStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for InMemoryCommandStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandStorePort for InMemoryCommandStore {
    fn add(&self, command: Command) -> Result<(), CommandStoreError> {
        let mut inner = self.lock();
        if inner.index.contains_key(&command.id) {
            return Err(CommandStoreError::DuplicateCommandId(command.id));
        }

        let position = inner.history.len();
        inner.index.insert(command.id.clone(), position);
        tracing::debug!(
            command_id = %command.id,
            run_hash = %command.run_hash,
            command_type = %command.command_type,
            "Command stored"
        );
        inner.history.push(command);
        Ok(())
    }

    fn update_status(
        &self,
        command_id: &str,
        new_status: CommandStatus,
        result: Option<Value>,
        error_message: Option<String>,
    ) -> Result<Command, CommandStoreError> {
        let mut inner = self.lock();
        let position = *inner
            .index
            .get(command_id)
            .ok_or_else(|| CommandStoreError::NotFound(command_id.to_string()))?;

        let command = &mut inner.history[position];
        command.status.validate_transition(new_status)?;

        let old_status = command.status;
        command.status = new_status;
        if result.is_some() {
            command.result = result;
        }
        if error_message.is_some() {
            command.error_message = error_message;
        }

        tracing::debug!(
            command_id = %command_id,
            old_status = %old_status,
            new_status = %new_status,
            "Command status updated"
        );
        Ok(command.clone())
    }

    fn get(&self, command_id: &str) -> Option<Command> {
        let inner = self.lock();
        inner
            .index
            .get(command_id)
            .map(|&position| inner.history[position].clone())
    }

    fn list_for_run(&self, run_hash: &str) -> Vec<Command> {
        let inner = self.lock();
        inner
            .history
            .iter()
            .filter(|c| c.run_hash == run_hash)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn command(id: &str, run: &str) -> Command {
        Command::with_id(id, run, "pause", Map::new())
    }

    #[test]
    fn test_add_and_get() {
        let store = InMemoryCommandStore::new();
        store.add(command("c1", "r1")).unwrap();

        let found = store.get("c1").unwrap();
        assert_eq!(found.id, "c1");
        assert_eq!(found.status, CommandStatus::Pending);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let store = InMemoryCommandStore::new();
        store.add(command("c1", "r1")).unwrap();

        let err = store.add(command("c1", "r1")).unwrap_err();
        assert!(matches!(err, CommandStoreError::DuplicateCommandId(_)));
    }

    #[test]
    fn test_get_reflects_latest_status() {
        let store = InMemoryCommandStore::new();
        store.add(command("c1", "r1")).unwrap();

        store
            .update_status("c1", CommandStatus::Acknowledged, None, None)
            .unwrap();
        assert_eq!(store.get("c1").unwrap().status, CommandStatus::Acknowledged);

        store
            .update_status(
                "c1",
                CommandStatus::Completed,
                Some(json!({"loss": 0.42})),
                None,
            )
            .unwrap();

        let found = store.get("c1").unwrap();
        assert_eq!(found.status, CommandStatus::Completed);
        assert_eq!(found.result, Some(json!({"loss": 0.42})));
    }

    #[test]
    fn test_update_unknown_id_leaves_store_unchanged() {
        let store = InMemoryCommandStore::new();
        store.add(command("c1", "r1")).unwrap();

        let err = store
            .update_status("missing", CommandStatus::Completed, None, None)
            .unwrap_err();
        assert!(matches!(err, CommandStoreError::NotFound(_)));
        assert_eq!(store.get("c1").unwrap().status, CommandStatus::Pending);
        assert!(store.get("missing").is_none());
    }

    #[test]
    fn test_terminal_status_cannot_be_overwritten() {
        let store = InMemoryCommandStore::new();
        store.add(command("c1", "r1")).unwrap();
        store
            .update_status("c1", CommandStatus::Failed, None, Some("oom".into()))
            .unwrap();

        let err = store
            .update_status("c1", CommandStatus::Completed, None, None)
            .unwrap_err();
        assert!(matches!(err, CommandStoreError::InvalidTransition(_)));

        let found = store.get("c1").unwrap();
        assert_eq!(found.status, CommandStatus::Failed);
        assert_eq!(found.error_message.as_deref(), Some("oom"));
    }

    #[test]
    fn test_list_for_run_preserves_append_order() {
        let store = InMemoryCommandStore::new();
        store.add(command("c1", "r1")).unwrap();
        store.add(command("c2", "r2")).unwrap();
        store.add(command("c3", "r1")).unwrap();

        let ids: Vec<String> = store
            .list_for_run("r1")
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec!["c1", "c3"]);
        assert!(store.list_for_run("r9").is_empty());
    }
}
