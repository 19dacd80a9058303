//! Control WebSocket Handler
//!
//! 每条连接的消息循环: CONNECTING → CONNECTED → DISCONNECTED。
//! 协议层错误只回结构化 error 帧，绝不关闭连接；
//! 只有传输层关闭/发送失败才走 disconnect 回收注册表。

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::IntoResponse,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::application::ports::CommandStoreError;
use crate::infrastructure::control::{ClientFrame, ConnectionType, ErrorCode, ServerFrame};
use crate::infrastructure::http::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ControlWsParams {
    pub client_type: String,
}

/// 控制 WebSocket 连接处理
pub async fn control_websocket(
    ws: WebSocketUpgrade,
    Path(run_hash): Path<String>,
    Query(params): Query<ControlWsParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_control_socket(socket, run_hash, params.client_type, state))
}

async fn handle_control_socket(
    socket: WebSocket,
    run_hash: String,
    client_type: String,
    state: Arc<AppState>,
) {
    let (sender, receiver) = socket.split();

    let Some(connection_type) = ConnectionType::parse(&client_type) else {
        // 未知类型: 回结构化错误但不关连接，也不进注册表，
        // 由对端自行纠正或关闭
        tracing::warn!(run_hash = %run_hash, client_type = %client_type, "Unknown client type");
        reject_unknown_client_type(sender, receiver, &client_type).await;
        return;
    };

    // 出站队列: socket 写端由转发任务独占，注册表里只存队列发送端
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();
    let client_id = state
        .connection_manager
        .connect(&run_hash, connection_type, tx.clone());

    let forward_client_id = client_id.clone();
    let mut sink = sender;
    let forward_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let msg = match serde_json::to_string(&frame) {
                Ok(json) => Message::Text(json),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize frame");
                    continue;
                }
            };
            if let Err(e) = sink.send(msg).await {
                tracing::debug!(
                    client_id = %forward_client_id,
                    error = %e,
                    "WebSocket send failed"
                );
                break;
            }
        }
    });

    let mut receiver = receiver;
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                state.connection_manager.touch(&client_id);
                if let Some(reply) = process_frame(&state, &run_hash, &client_id, connection_type, &text)
                {
                    if tx.send(reply).is_err() {
                        break;
                    }
                }
            }
            Ok(Message::Close(_)) => {
                tracing::debug!(client_id = %client_id, "WebSocket closed by client");
                break;
            }
            Ok(_) => {
                // Ping/Pong/Binary: 只刷新活跃时间
                state.connection_manager.touch(&client_id);
            }
            Err(e) => {
                tracing::debug!(client_id = %client_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    state.connection_manager.disconnect(&client_id);
    forward_task.abort();
}

/// 处理一帧；返回 Some 表示需要回复的错误帧
fn process_frame(
    state: &AppState,
    run_hash: &str,
    client_id: &str,
    connection_type: ConnectionType,
    text: &str,
) -> Option<ServerFrame> {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(client_id = %client_id, error = %e, "Invalid JSON from client");
            return Some(ServerFrame::error(
                ErrorCode::InvalidJson,
                "Failed to parse JSON message",
            ));
        }
    };

    let frame: ClientFrame = match serde_json::from_value(value) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(client_id = %client_id, error = %e, "Bad request from client");
            return Some(ServerFrame::error(ErrorCode::BadRequest, e.to_string()));
        }
    };

    match (connection_type, frame) {
        (
            ConnectionType::Training,
            ClientFrame::StatusUpdate {
                id,
                status,
                result,
                error_message,
                ..
            },
        ) => {
            state
                .connection_manager
                .handle_status_update(&id, status, result, error_message);
            None
        }
        (ConnectionType::Ui | ConnectionType::Api, ClientFrame::Command { data }) => {
            // 路由以路径上的 run_hash 为准
            match state.connection_manager.send_command_to_training(run_hash, data) {
                Ok(_) => None,
                Err(CommandStoreError::DuplicateCommandId(id)) => Some(ServerFrame::error(
                    ErrorCode::BadRequest,
                    format!("Command already exists: {}", id),
                )),
                Err(e) => {
                    // 意外失败: 详细信息只进服务端日志，对端只见到不透明错误
                    tracing::error!(
                        client_id = %client_id,
                        run_hash = %run_hash,
                        error = %e,
                        "Error handling command frame"
                    );
                    Some(ServerFrame::error(
                        ErrorCode::InternalError,
                        "An internal error occurred while processing your request",
                    ))
                }
            }
        }
        (ConnectionType::Training, ClientFrame::Command { .. }) => Some(ServerFrame::error(
            ErrorCode::BadRequest,
            "Training clients cannot issue commands",
        )),
        (_, ClientFrame::StatusUpdate { .. }) => Some(ServerFrame::error(
            ErrorCode::BadRequest,
            "Only training clients can send status updates",
        )),
    }
}

/// 未知 client_type: 每收到一帧都回 unknown_client_type，直到对端关闭
async fn reject_unknown_client_type(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    client_type: &str,
) {
    let error_frame = ServerFrame::error(
        ErrorCode::UnknownClientType,
        format!("Unknown client type: {}", client_type),
    );
    let Ok(json) = serde_json::to_string(&error_frame) else {
        return;
    };

    if sender.send(Message::Text(json.clone())).await.is_err() {
        return;
    }

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {
                if sender.send(Message::Text(json.clone())).await.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::control::CommandStatus;
    use crate::infrastructure::control::ControlConnectionManager;
    use crate::infrastructure::http::routes::create_routes;
    use crate::infrastructure::memory::InMemoryCommandStore;
    use std::net::{SocketAddr, TcpStream};
    use std::time::Duration;
    use tungstenite::stream::MaybeTlsStream;
    use tungstenite::WebSocket as TungsteniteSocket;

    type WsClient = TungsteniteSocket<MaybeTlsStream<TcpStream>>;

    async fn spawn_server() -> (SocketAddr, Arc<AppState>) {
        let store: Arc<InMemoryCommandStore> = Arc::new(InMemoryCommandStore::new());
        let manager = ControlConnectionManager::new(store.clone()).arc();
        let state = Arc::new(AppState::new(manager, store));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = create_routes().with_state(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (addr, state)
    }

    fn connect_ws(addr: SocketAddr, run_hash: &str, client_type: &str) -> WsClient {
        let url = format!(
            "ws://{}/api/control/{}/ws?client_type={}",
            addr, run_hash, client_type
        );
        let (socket, _) = tungstenite::connect(&url).unwrap();
        if let MaybeTlsStream::Plain(stream) = socket.get_ref() {
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
        }
        socket
    }

    fn read_json(socket: &mut WsClient) -> serde_json::Value {
        loop {
            let msg = socket.read().unwrap();
            if msg.is_text() {
                return serde_json::from_str(&msg.into_text().unwrap()).unwrap();
            }
        }
    }

    fn send_json(socket: &mut WsClient, value: serde_json::Value) {
        socket
            .send(tungstenite::Message::Text(value.to_string()))
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_malformed_frame_gets_error_and_connection_survives() {
        let (addr, state) = spawn_server().await;

        tokio::task::spawn_blocking(move || {
            let mut ui = connect_ws(addr, "r1", "ui");

            ui.send(tungstenite::Message::Text("not json".into())).unwrap();
            let error = read_json(&mut ui);
            assert_eq!(error["type"], "error");
            assert_eq!(error["error"], "invalid_json");

            // 连接没被关掉，后续合法帧照常处理
            send_json(
                &mut ui,
                serde_json::json!({
                    "type": "command",
                    "data": {"id": "c1", "run_hash": "r1", "type": "pause", "payload": {}}
                }),
            );

            // 指令进了台账（没有训练端，停留在 pending）
            for _ in 0..50 {
                if state.command_store.get("c1").is_some() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            let stored = state.command_store.get("c1").unwrap();
            assert_eq!(stored.status, CommandStatus::Pending);
        })
        .await
        .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_wrong_shape_frame_gets_bad_request() {
        let (addr, _state) = spawn_server().await;

        tokio::task::spawn_blocking(move || {
            let mut training = connect_ws(addr, "r1", "training");

            // status_update 缺必填字段
            send_json(
                &mut training,
                serde_json::json!({"type": "status_update", "id": "c1"}),
            );
            let error = read_json(&mut training);
            assert_eq!(error["error"], "bad_request");

            // 训练端不能下发指令
            send_json(
                &mut training,
                serde_json::json!({
                    "type": "command",
                    "data": {"id": "c9", "run_hash": "r1", "type": "pause"}
                }),
            );
            let error = read_json(&mut training);
            assert_eq!(error["error"], "bad_request");
        })
        .await
        .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_unknown_client_type_rejected_but_socket_open() {
        let (addr, _state) = spawn_server().await;

        tokio::task::spawn_blocking(move || {
            let mut socket = connect_ws(addr, "r1", "robot");

            let error = read_json(&mut socket);
            assert_eq!(error["error"], "unknown_client_type");

            // 连接保持打开，再发一帧仍然得到结构化错误
            socket
                .send(tungstenite::Message::Text("{}".into()))
                .unwrap();
            let error = read_json(&mut socket);
            assert_eq!(error["error"], "unknown_client_type");
        })
        .await
        .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_end_to_end_command_flow() {
        let (addr, _state) = spawn_server().await;

        tokio::task::spawn_blocking(move || {
            let mut training = connect_ws(addr, "r1", "training");
            let mut ui = connect_ws(addr, "r1", "ui");

            // UI 下发指令
            send_json(
                &mut ui,
                serde_json::json!({
                    "type": "command",
                    "data": {"id": "c1", "run_hash": "r1", "type": "pause", "payload": {}}
                }),
            );

            // 训练端收到投递
            let frame = read_json(&mut training);
            assert_eq!(frame["type"], "command");
            assert_eq!(frame["data"]["id"], "c1");
            assert_eq!(frame["data"]["type"], "pause");

            // 训练端依次上报 acknowledged / completed
            send_json(
                &mut training,
                serde_json::json!({
                    "type": "status_update",
                    "id": "c1", "run_hash": "r1", "status": "acknowledged"
                }),
            );
            send_json(
                &mut training,
                serde_json::json!({
                    "type": "status_update",
                    "id": "c1", "run_hash": "r1",
                    "status": "completed",
                    "result": {"step": 128}
                }),
            );

            // UI 按序收到两次 command_update
            let update = read_json(&mut ui);
            assert_eq!(update["type"], "command_update");
            assert_eq!(update["data"]["status"], "acknowledged");

            let update = read_json(&mut ui);
            assert_eq!(update["data"]["status"], "completed");
            assert_eq!(update["data"]["result"]["step"], 128);
        })
        .await
        .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fanout_reaches_every_training_worker() {
        let (addr, state) = spawn_server().await;

        tokio::task::spawn_blocking(move || {
            let mut workers: Vec<WsClient> = (0..3)
                .map(|_| connect_ws(addr, "r1", "training"))
                .collect();

            // 等全部连接进注册表
            for _ in 0..50 {
                let runs = state.connection_manager.connected_runs();
                if runs.first().map(|r| r.training) == Some(3) {
                    break;
                }
                std::thread::sleep(Duration::from_millis(20));
            }

            let mut ui = connect_ws(addr, "r1", "ui");
            send_json(
                &mut ui,
                serde_json::json!({
                    "type": "command",
                    "data": {"id": "c1", "run_hash": "r1", "type": "pause"}
                }),
            );

            for worker in workers.iter_mut() {
                let frame = read_json(worker);
                assert_eq!(frame["data"]["id"], "c1");
            }
        })
        .await
        .unwrap();
    }
}
