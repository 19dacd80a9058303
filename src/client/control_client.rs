//! Control Client - 训练进程内嵌的控制客户端
//!
//! 一个后台线程独占 WebSocket，训练线程只通过线程安全队列交互：
//! - poll_commands() 每个训练 step 调用一次，非阻塞、零 I/O
//! - 状态上报先入出站队列，由后台线程代为发送
//!
//! 控制服务缺席绝不能阻止训练启动：构造函数最多等待一个有界超时，
//! 之后无论连上与否都返回，后台线程无限重连。

use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde_json::Value;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

use crate::domain::control::{Command, CommandStatus};
use crate::infrastructure::control::{ClientFrame, ServerFrame};

/// 客户端状态机
///
/// DISCONNECTED → CONNECTING → CONNECTED，任何故障回到 DISCONNECTED；
/// STOPPED 仅在 close() 之后由后台线程退出时进入，为终态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Stopped,
}

/// 客户端配置
#[derive(Debug, Clone)]
pub struct ControlClientConfig {
    /// 构造函数等待首次连接的上限
    pub connect_timeout: Duration,
    /// 断线后的固定重连间隔
    pub reconnect_backoff: Duration,
    /// 有界等待读超时，也是关闭标志的检查周期
    pub read_timeout: Duration,
    /// close() 等待后台线程退出的上限
    pub close_timeout: Duration,
}

impl Default for ControlClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            reconnect_backoff: Duration::from_secs(2),
            read_timeout: Duration::from_secs(1),
            close_timeout: Duration::from_secs(1),
        }
    }
}

struct ClientShared {
    running: AtomicBool,
    state: Mutex<ClientState>,
    state_changed: Condvar,
}

impl ClientShared {
    fn set_state(&self, next: ClientState) {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *state = next;
        self.state_changed.notify_all();
    }

    fn state(&self) -> ClientState {
        match self.state.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// 控制客户端
pub struct ControlClient {
    run_hash: String,
    config: ControlClientConfig,
    shared: Arc<ClientShared>,
    commands: Mutex<Receiver<Command>>,
    outbound: Sender<ClientFrame>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ControlClient {
    /// 用默认配置连接控制服务器
    pub fn connect(run_hash: impl Into<String>, server_url: &str) -> Self {
        Self::with_config(run_hash, server_url, ControlClientConfig::default())
    }

    /// 连接控制服务器
    ///
    /// 最多阻塞 connect_timeout 等待首次连接成功，之后无论结果都返回
    pub fn with_config(
        run_hash: impl Into<String>,
        server_url: &str,
        config: ControlClientConfig,
    ) -> Self {
        let run_hash = run_hash.into();
        let ws_url = format!(
            "ws://{}/api/control/{}/ws?client_type=training",
            server_url, run_hash
        );

        let (command_tx, command_rx) = mpsc::channel();
        let (outbound_tx, outbound_rx) = mpsc::channel();
        let shared = Arc::new(ClientShared {
            running: AtomicBool::new(true),
            state: Mutex::new(ClientState::Disconnected),
            state_changed: Condvar::new(),
        });

        let worker = {
            let shared = shared.clone();
            let worker_config = config.clone();
            let worker_url = ws_url.clone();
            std::thread::Builder::new()
                .name("trainctl-control".to_string())
                .spawn(move || run_worker(worker_url, shared, command_tx, outbound_rx, worker_config))
        };

        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::error!(error = %e, "Failed to spawn control client worker");
                shared.running.store(false, Ordering::SeqCst);
                shared.set_state(ClientState::Stopped);
                None
            }
        };

        let client = Self {
            run_hash,
            config,
            shared,
            commands: Mutex::new(command_rx),
            outbound: outbound_tx,
            worker: Mutex::new(worker),
        };

        if !client.wait_for_connection() {
            tracing::warn!(url = %ws_url, "Failed to connect to control server, training continues without control");
        }
        client
    }

    /// 等待首次连接；返回是否在超时前连上
    fn wait_for_connection(&self) -> bool {
        let deadline = Instant::now() + self.config.connect_timeout;
        let mut state = match self.shared.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        loop {
            match *state {
                ClientState::Connected => return true,
                ClientState::Stopped => return false,
                _ => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = match self.shared.state_changed.wait_timeout(state, deadline - now) {
                Ok(result) => result,
                Err(poisoned) => poisoned.into_inner(),
            };
            state = guard;
        }
    }

    pub fn run_hash(&self) -> &str {
        &self.run_hash
    }

    pub fn state(&self) -> ClientState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Connected
    }

    /// 取走已到达的全部指令（按到达顺序）
    ///
    /// 训练循环每个 step 调用一次：只读内存队列，不碰锁争用热点，
    /// 不做任何 I/O，队列为空立即返回空列表
    pub fn poll_commands(&self) -> Vec<Command> {
        let receiver = match self.commands.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut commands = Vec::new();
        while let Ok(command) = receiver.try_recv() {
            commands.push(command);
        }
        commands
    }

    /// 上报指令状态
    ///
    /// 帧入出站队列，由后台线程在下一个读超时边界发出；
    /// 断线期间入队的帧在重连后发出
    pub fn send_status_update(
        &self,
        command_id: &str,
        status: CommandStatus,
        result: Option<Value>,
        error_message: Option<String>,
    ) {
        let frame = ClientFrame::StatusUpdate {
            id: command_id.to_string(),
            run_hash: self.run_hash.clone(),
            status,
            result,
            error_message,
        };
        if self.outbound.send(frame).is_err() {
            tracing::debug!(
                command_id = %command_id,
                "Control client worker stopped, status update dropped"
            );
        }
    }

    /// 确认收到指令
    pub fn acknowledge(&self, command_id: &str) {
        self.send_status_update(command_id, CommandStatus::Acknowledged, None, None);
    }

    /// 上报执行完成
    pub fn complete(&self, command_id: &str, result: Option<Value>) {
        self.send_status_update(command_id, CommandStatus::Completed, result, None);
    }

    /// 上报执行失败
    pub fn fail(&self, command_id: &str, error_message: impl Into<String>) {
        self.send_status_update(
            command_id,
            CommandStatus::Failed,
            None,
            Some(error_message.into()),
        );
    }

    /// 关闭客户端
    ///
    /// 设置关闭标志后最多等待 close_timeout；后台线程若卡在慢 I/O 上
    /// 则任其自行退出，绝不拖住进程关闭
    pub fn close(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let handle = {
            let mut worker = match self.worker.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            worker.take()
        };

        if let Some(handle) = handle {
            let deadline = Instant::now() + self.config.close_timeout;
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(20));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                tracing::warn!("Control client worker did not stop in time, detaching");
            }
        }
    }
}

impl Drop for ControlClient {
    fn drop(&mut self) {
        self.close();
    }
}

/// 后台线程主循环：连接 → 会话 → 固定退避 → 重连，直到 close()
fn run_worker(
    ws_url: String,
    shared: Arc<ClientShared>,
    command_tx: Sender<Command>,
    outbound_rx: Receiver<ClientFrame>,
    config: ControlClientConfig,
) {
    while shared.is_running() {
        shared.set_state(ClientState::Connecting);
        match tungstenite::connect(ws_url.as_str()) {
            Ok((mut socket, _response)) => {
                if let MaybeTlsStream::Plain(stream) = socket.get_ref() {
                    if let Err(e) = stream.set_read_timeout(Some(config.read_timeout)) {
                        tracing::warn!(error = %e, "Failed to set read timeout");
                    }
                }
                shared.set_state(ClientState::Connected);
                tracing::info!(url = %ws_url, "Connected to control server");

                run_session(&mut socket, &shared, &command_tx, &outbound_rx);
                shared.set_state(ClientState::Disconnected);
            }
            Err(e) => {
                shared.set_state(ClientState::Disconnected);
                tracing::warn!(url = %ws_url, error = %e, "Control connection failed, retrying");
            }
        }

        // 固定退避，分片睡眠以便尽快观察到关闭标志
        if shared.is_running() {
            let deadline = Instant::now() + config.reconnect_backoff;
            while shared.is_running() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }
    shared.set_state(ClientState::Stopped);
}

/// 单次连接内的收发循环；返回即表示本次连接结束
fn run_session(
    socket: &mut WebSocket<MaybeTlsStream<TcpStream>>,
    shared: &ClientShared,
    command_tx: &Sender<Command>,
    outbound_rx: &Receiver<ClientFrame>,
) {
    loop {
        if !shared.is_running() {
            let _ = socket.close(None);
            return;
        }

        // 先冲刷排队的状态上报
        loop {
            match outbound_rx.try_recv() {
                Ok(frame) => {
                    let json = match serde_json::to_string(&frame) {
                        Ok(json) => json,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to serialize status update");
                            continue;
                        }
                    };
                    if let Err(e) = socket.send(Message::Text(json)) {
                        tracing::warn!(error = %e, "Failed to send status update");
                        return;
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        // 有界等待读：超时只是检查关闭标志的机会，不是故障
        match socket.read() {
            Ok(Message::Text(text)) => handle_frame(&text, command_tx),
            Ok(Message::Close(_)) => {
                tracing::info!("Control server closed the connection");
                return;
            }
            Ok(_) => {}
            Err(tungstenite::Error::Io(e))
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                tracing::warn!(error = %e, "Control WebSocket disconnected");
                return;
            }
        }
    }
}

/// 解析失败的帧记日志后丢弃，不影响连接
fn handle_frame(text: &str, command_tx: &Sender<Command>) {
    match serde_json::from_str::<ServerFrame>(text) {
        Ok(ServerFrame::Command { data }) => {
            tracing::debug!(
                command_id = %data.id,
                command_type = %data.command_type,
                "Command received"
            );
            let _ = command_tx.send(data);
        }
        Ok(ServerFrame::Error { error, message }) => {
            tracing::warn!(code = ?error, message = %message, "Error frame from control server");
        }
        Ok(ServerFrame::CommandUpdate { .. }) => {
            // 训练端不消费状态广播
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to parse control frame, discarded");
        }
    }
}
