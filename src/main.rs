//! Trainctl - 训练过程远程控制面

use std::sync::Arc;

use trainctl::config::{load_config, print_config};
use trainctl::infrastructure::control::ControlConnectionManager;
use trainctl::infrastructure::http::{AppState, HttpServer, ServerConfig};
use trainctl::infrastructure::memory::InMemoryCommandStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 加载配置（优先级：环境变量 > 配置文件 > 默认值）
    let config = load_config().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

    // 初始化日志
    let log_filter = format!(
        "{},trainctl={},tower_http=debug",
        config.log.level, config.log.level
    );
    let subscriber = tracing_subscriber::fmt().with_env_filter(
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_filter)),
    );
    if config.log.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    tracing::info!("Trainctl - 训练过程远程控制面");
    print_config(&config);

    // 指令台账 + 连接路由中枢
    let command_store: Arc<InMemoryCommandStore> = Arc::new(InMemoryCommandStore::new());
    let connection_manager = ControlConnectionManager::new(command_store.clone()).arc();

    // 创建 HTTP 服务器
    let server_config = ServerConfig::new(&config.server.host, config.server.port);
    let state = AppState::new(connection_manager, command_store);
    let server = HttpServer::new(server_config, state);

    tracing::info!("Starting HTTP server...");

    // 启动服务器（带优雅关闭）
    server
        .run_with_shutdown(async {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to listen for ctrl-c");
            tracing::info!("Received shutdown signal");
        })
        .await?;

    tracing::info!("Server shutdown complete");

    Ok(())
}
