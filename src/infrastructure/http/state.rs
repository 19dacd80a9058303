//! Application State

use std::sync::Arc;

use crate::application::ports::CommandStorePort;
use crate::infrastructure::control::ControlConnectionManager;

/// 应用状态
///
/// 注册表与台账都由 manager 实例持有，handler 不访问任何全局可变状态
pub struct AppState {
    pub connection_manager: Arc<ControlConnectionManager>,
    pub command_store: Arc<dyn CommandStorePort>,
}

impl AppState {
    pub fn new(
        connection_manager: Arc<ControlConnectionManager>,
        command_store: Arc<dyn CommandStorePort>,
    ) -> Self {
        Self {
            connection_manager,
            command_store,
        }
    }
}
