//! Control Connection Manager - 控制连接路由中枢
//!
//! 职责:
//! 1. 维护所有存活连接（全局表 + 按 run 索引）
//! 2. 把指令路由到训练端连接
//! 3. 把状态变更广播到 UI 端连接
//!
//! 注意: 连接注册表是进程本地的。多 worker 部署时同一 run 的所有
//! WebSocket 流量必须落在同一进程，跨进程广播不在本层解决。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::application::ports::{CommandStoreError, CommandStorePort};
use crate::domain::control::{Command, CommandStatus};

use super::protocol::{ConnectionType, ServerFrame};

/// 一条存活的 WebSocket 客户端连接
///
/// 连接成功时创建，断开即销毁，从不落盘。
/// sender 指向该连接专属的出站队列，socket 本体由连接自己的任务独占。
pub struct ClientConnection {
    pub client_id: String,
    pub run_hash: String,
    pub connection_type: ConnectionType,
    pub sender: mpsc::UnboundedSender<ServerFrame>,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// 连接注册表
///
/// 不变量: 每个存活 client_id 在 connections 中恰好出现一次，
/// 且在其 run 的集合中恰好出现一次
#[derive(Default)]
struct Registry {
    connections: HashMap<String, ClientConnection>,
    run_connections: HashMap<String, HashSet<String>>,
}

/// 某个 run 的连接统计
#[derive(Debug, Clone, Serialize)]
pub struct RunConnections {
    pub run_hash: String,
    pub training: usize,
    pub ui: usize,
    pub api: usize,
}

/// 控制连接管理器
///
/// 两把锁都只保护内存变更；任何网络发送都发生在锁外
/// （出站队列为无界 channel，入队不阻塞）。
pub struct ControlConnectionManager {
    store: Arc<dyn CommandStorePort>,
    registry: Mutex<Registry>,
    /// 串行化「台账更新 + UI 入队」，保证广播顺序与台账更新顺序一致
    update_order: Mutex<()>,
    worker_id: String,
}

impl ControlConnectionManager {
    pub fn new(store: Arc<dyn CommandStorePort>) -> Self {
        let worker_id = format!("worker-{}", std::process::id());
        tracing::info!(worker_id = %worker_id, "Control connection manager created");
        Self {
            store,
            registry: Mutex::new(Registry::default()),
            update_order: Mutex::new(()),
            worker_id,
        }
    }

    pub fn arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn store(&self) -> &Arc<dyn CommandStorePort> {
        &self.store
    }

    fn lock_registry(&self) -> MutexGuard<'_, Registry> {
        match self.registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// 注册一条新连接，返回生成的 client_id
    ///
    /// 同一 run 可以有任意多条连接（多个训练 worker、多个 UI 标签页），
    /// id 由 UUID 保证不碰撞
    pub fn connect(
        &self,
        run_hash: &str,
        connection_type: ConnectionType,
        sender: mpsc::UnboundedSender<ServerFrame>,
    ) -> String {
        let client_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let connection = ClientConnection {
            client_id: client_id.clone(),
            run_hash: run_hash.to_string(),
            connection_type,
            sender,
            connected_at: now,
            last_activity: now,
        };

        let run_total = {
            let mut registry = self.lock_registry();
            registry.connections.insert(client_id.clone(), connection);
            let run_set = registry
                .run_connections
                .entry(run_hash.to_string())
                .or_default();
            run_set.insert(client_id.clone());
            run_set.len()
        };

        tracing::info!(
            worker_id = %self.worker_id,
            client_id = %client_id,
            run_hash = %run_hash,
            client_type = %connection_type,
            run_total = run_total,
            "Client connected"
        );
        client_id
    }

    /// 注销连接；重复调用或未知 id 为静默 no-op
    pub fn disconnect(&self, client_id: &str) {
        let removed = {
            let mut registry = self.lock_registry();
            let connection = registry.connections.remove(client_id);
            if let Some(ref conn) = connection {
                if let Some(run_set) = registry.run_connections.get_mut(&conn.run_hash) {
                    run_set.remove(client_id);
                    if run_set.is_empty() {
                        registry.run_connections.remove(&conn.run_hash);
                    }
                }
            }
            connection
        };

        if let Some(conn) = removed {
            tracing::info!(
                client_id = %client_id,
                run_hash = %conn.run_hash,
                client_type = %conn.connection_type,
                "Client disconnected"
            );
        }
    }

    /// 更新连接活跃时间
    pub fn touch(&self, client_id: &str) {
        let mut registry = self.lock_registry();
        if let Some(conn) = registry.connections.get_mut(client_id) {
            conn.last_activity = Utc::now();
        }
    }

    /// 下发指令到某个 run 的所有训练端连接
    ///
    /// 先持久化到台账再尝试投递：没有训练端在线时指令仍可通过 get
    /// 查到并停留在 pending，调用方据此决定重试。
    /// 返回 Ok(false) 表示当前没有训练端连接。
    pub fn send_command_to_training(
        &self,
        run_hash: &str,
        command: Command,
    ) -> Result<bool, CommandStoreError> {
        self.store.add(command.clone())?;

        let targets = self.clients_for(run_hash, ConnectionType::Training);
        if targets.is_empty() {
            tracing::warn!(
                run_hash = %run_hash,
                command_id = %command.id,
                "No training clients connected, command stays pending"
            );
            return Ok(false);
        }

        tracing::debug!(
            run_hash = %run_hash,
            command_id = %command.id,
            targets = targets.len(),
            "Dispatching command to training clients"
        );

        for (client_id, sender) in targets {
            let frame = ServerFrame::Command {
                data: command.clone(),
            };
            self.send_or_disconnect(&client_id, sender, frame);
        }
        Ok(true)
    }

    /// 处理训练端上报的状态变更
    ///
    /// 台账更新成功后向该 run 的所有 UI 端广播 command_update。
    /// 未知 id 或非法迁移只记日志并丢弃，不算调用方错误。
    pub fn handle_status_update(
        &self,
        command_id: &str,
        status: CommandStatus,
        result: Option<Value>,
        error_message: Option<String>,
    ) {
        // 更新与广播入队在同一临界区内完成，广播顺序即台账更新顺序。
        // 入队只是内存操作，不触网络。
        let _order = match self.update_order.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let command = match self
            .store
            .update_status(command_id, status, result, error_message)
        {
            Ok(command) => command,
            Err(CommandStoreError::NotFound(_)) => {
                tracing::warn!(
                    command_id = %command_id,
                    "Status update for unknown command, dropped"
                );
                return;
            }
            Err(e) => {
                tracing::warn!(
                    command_id = %command_id,
                    new_status = %status,
                    error = %e,
                    "Status update rejected"
                );
                return;
            }
        };

        for (client_id, sender) in self.clients_for(&command.run_hash, ConnectionType::Ui) {
            let frame = ServerFrame::CommandUpdate {
                data: command.clone(),
            };
            self.send_or_disconnect(&client_id, sender, frame);
        }
    }

    /// 当前有连接的 run 及各类型连接数
    pub fn connected_runs(&self) -> Vec<RunConnections> {
        let registry = self.lock_registry();
        let mut runs: Vec<RunConnections> = registry
            .run_connections
            .iter()
            .map(|(run_hash, client_ids)| {
                let mut summary = RunConnections {
                    run_hash: run_hash.clone(),
                    training: 0,
                    ui: 0,
                    api: 0,
                };
                for client_id in client_ids {
                    match registry.connections.get(client_id).map(|c| c.connection_type) {
                        Some(ConnectionType::Training) => summary.training += 1,
                        Some(ConnectionType::Ui) => summary.ui += 1,
                        Some(ConnectionType::Api) => summary.api += 1,
                        None => {}
                    }
                }
                summary
            })
            .collect();
        runs.sort_by(|a, b| a.run_hash.cmp(&b.run_hash));
        runs
    }

    /// 某 client_id 是否仍在注册表中
    pub fn is_registered(&self, client_id: &str) -> bool {
        self.lock_registry().connections.contains_key(client_id)
    }

    /// 锁内快照某 run 某类型的全部出站队列，锁外发送
    fn clients_for(
        &self,
        run_hash: &str,
        connection_type: ConnectionType,
    ) -> Vec<(String, mpsc::UnboundedSender<ServerFrame>)> {
        let registry = self.lock_registry();
        registry
            .run_connections
            .get(run_hash)
            .map(|client_ids| {
                client_ids
                    .iter()
                    .filter_map(|id| registry.connections.get(id))
                    .filter(|conn| conn.connection_type == connection_type)
                    .map(|conn| (conn.client_id.clone(), conn.sender.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 单个连接投递失败只摘除该连接，同 run 其余连接不受影响
    fn send_or_disconnect(
        &self,
        client_id: &str,
        sender: mpsc::UnboundedSender<ServerFrame>,
        frame: ServerFrame,
    ) {
        if sender.send(frame).is_err() {
            tracing::warn!(
                client_id = %client_id,
                "Failed to queue frame for client, disconnecting"
            );
            self.disconnect(client_id);
        }
    }
}
