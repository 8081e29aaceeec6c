use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use application::{ConnectionHandle, OutboundFrame};
use domain::{DomainError, RoomId, UserId};

use crate::{error::ApiError, state::AppState};

#[derive(Debug, Deserialize)]
pub(crate) struct WsQuery {
    user_id: Uuid,
}

/// 客户端经 WebSocket 上行的帧
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Typing { is_typing: bool },
}

/// 升级前先做查看权限检查，被拒绝时返回 403 而非建立后立即关闭
pub(crate) async fn websocket_upgrade(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let room_id = RoomId::from(room_id);
    let user_id = UserId::from(query.user_id);
    if !state.moderation.can_user_view_messages(user_id, room_id).await? {
        return Err(DomainError::permission_denied("view this room").into());
    }
    Ok(ws.on_upgrade(move |socket| async move {
        WebSocketConnection::new(socket, state, room_id, user_id).run().await;
    }))
}

/// 单条 WebSocket 连接：hub 写端经 mpsc 转发到 socket，读端处理心跳与输入状态
pub struct WebSocketConnection {
    socket: WebSocket,
    state: AppState,
    room_id: RoomId,
    user_id: UserId,
}

enum WsCommand {
    SendText(String),
    SendPong(Vec<u8>),
}

impl WebSocketConnection {
    pub fn new(socket: WebSocket, state: AppState, room_id: RoomId, user_id: UserId) -> Self {
        Self {
            socket,
            state,
            room_id,
            user_id,
        }
    }

    pub async fn run(self) {
        let Self {
            socket,
            state,
            room_id,
            user_id,
        } = self;

        let (handle, mut frames) = ConnectionHandle::channel();
        let connection_id = handle.id();
        let closed = handle.closed();
        if let Err(err) = state.chat.connect(room_id, user_id, handle).await {
            tracing::warn!(room_id = %room_id, user_id = %user_id, error = %err, "WebSocket 注册失败");
            return;
        }
        tracing::info!(room_id = %room_id, user_id = %user_id, connection_id = %connection_id, "WebSocket 连接已建立");

        let (mut sender, mut incoming) = socket.split();
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<WsCommand>(32);

        // 发送任务：所有对 socket 的写操作都在这里
        let send_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = closed.cancelled() => {
                        let _ = sender.send(WsMessage::Close(None)).await;
                        break;
                    }
                    Some(cmd) = cmd_rx.recv() => {
                        let outgoing = match cmd {
                            WsCommand::SendText(text) => WsMessage::Text(text.into()),
                            WsCommand::SendPong(data) => WsMessage::Pong(data.into()),
                        };
                        if sender.send(outgoing).await.is_err() {
                            break;
                        }
                    }
                    frame = frames.recv() => match frame {
                        Some(OutboundFrame::Text(text)) => {
                            if sender.send(WsMessage::Text(text.as_ref().into())).await.is_err() {
                                break;
                            }
                        }
                        Some(OutboundFrame::Close) | None => {
                            let _ = sender.send(WsMessage::Close(None)).await;
                            break;
                        }
                    },
                }
            }
            tracing::debug!("WebSocket 发送任务结束");
        });

        let recv_state = state.clone();
        let recv_task = tokio::spawn(async move {
            while let Some(Ok(message)) = incoming.next().await {
                if Self::handle_incoming(&recv_state, room_id, user_id, message, &cmd_tx)
                    .await
                    .is_err()
                {
                    break;
                }
            }
            tracing::debug!("WebSocket 接收任务结束");
        });

        join_first(send_task, recv_task).await;

        state.chat.disconnect(room_id, user_id, connection_id).await;
        tracing::info!(room_id = %room_id, user_id = %user_id, connection_id = %connection_id, "WebSocket 连接已断开");
    }

    async fn handle_incoming(
        state: &AppState,
        room_id: RoomId,
        user_id: UserId,
        message: WsMessage,
        cmd_tx: &mpsc::Sender<WsCommand>,
    ) -> Result<(), ()> {
        match message {
            WsMessage::Close(_) => return Err(()),
            WsMessage::Ping(data) => {
                cmd_tx.send(WsCommand::SendPong(data.to_vec())).await.map_err(|_| ())?;
            }
            WsMessage::Pong(_) => {}
            WsMessage::Text(text) => match serde_json::from_str::<ClientFrame>(text.as_str()) {
                Ok(ClientFrame::Typing { is_typing }) => {
                    if let Err(err) = state.chat.set_typing(room_id, user_id, is_typing).await {
                        tracing::warn!(room_id = %room_id, user_id = %user_id, error = %err, "广播输入状态失败");
                    }
                }
                Err(err) => {
                    tracing::debug!(error = %err, "忽略无法识别的客户端帧");
                    let reply = serde_json::json!({ "type": "error", "message": "unsupported frame" });
                    cmd_tx.send(WsCommand::SendText(reply.to_string())).await.map_err(|_| ())?;
                }
            },
            WsMessage::Binary(_) => {}
        }
        Ok(())
    }
}

/// 任一方向结束即整体结束，另一方被中止
async fn join_first(mut first: JoinHandle<()>, mut second: JoinHandle<()>) {
    tokio::select! {
        _ = &mut first => second.abort(),
        _ = &mut second => first.abort(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typing_frame_parses() {
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"typing","is_typing":true}"#).expect("frame");
        assert!(matches!(frame, ClientFrame::Typing { is_typing: true }));
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"message"}"#).is_err());
    }

    #[tokio::test]
    async fn finished_side_aborts_the_other() {
        let (guard, dropped) = tokio::sync::oneshot::channel::<()>();
        let finished = tokio::spawn(async {});
        let lingering = tokio::spawn(async move {
            let _guard = guard;
            std::future::pending::<()>().await;
        });

        join_first(finished, lingering).await;
        let outcome = tokio::time::timeout(std::time::Duration::from_secs(1), dropped).await;
        assert!(matches!(outcome, Ok(Err(_))));
    }
}
