use anyhow::Result;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::domain::message::{ClientFrame, Outbound};
use crate::domain::model::Identity;
use crate::error::{HubError, HubResult};
use crate::server::lifecycle::DisconnectReason;
use crate::server::ImHub;

type WsReader = SplitStream<WebSocketStream<TcpStream>>;

/// 处理新连接 / Handle a new socket
pub async fn handle_connection(stream: TcpStream, peer_addr: SocketAddr, hub: ImHub) -> Result<()> {
    debug!("📨 New connection from: {}", peer_addr);
    let gate = hub.check_handshake(&peer_addr);

    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    let mut send_task = tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            let (msg, is_close) = match item {
                Outbound::Frame(frame) => match frame.to_text() {
                    Ok(text) => (Message::Text(text), false),
                    Err(e) => {
                        error!("Failed to encode frame for {}: {}", peer_addr, e);
                        continue;
                    }
                },
                Outbound::Close(reason) => (
                    Message::Close(Some(CloseFrame { code: CloseCode::Policy, reason: Cow::Owned(reason) })),
                    true,
                ),
            };
            if let Err(e) = ws_sender.send(msg).await {
                debug!("Failed to send message to {}: {}", peer_addr, e);
                break;
            }
            if is_close {
                let _ = ws_sender.close().await;
                break;
            }
        }
    });

    if let Err(e) = gate {
        reject(&tx, e);
        drop(tx);
        let _ = send_task.await;
        return Ok(());
    }

    let deadline = Duration::from_millis(hub.config.auth.deadline_ms);
    let identity = match tokio::time::timeout(deadline, wait_for_credential(&hub, &mut ws_receiver)).await {
        Ok(Ok(identity)) => identity,
        Ok(Err(e)) => {
            warn!("🔒 authentication from {} failed: {}", peer_addr, e);
            reject(&tx, e);
            drop(tx);
            let _ = send_task.await;
            return Ok(());
        }
        Err(_) => {
            warn!("🔒 disconnecting unauthenticated peer {}", peer_addr);
            reject(&tx, HubError::auth("authentication deadline exceeded"));
            drop(tx);
            let _ = send_task.await;
            return Ok(());
        }
    };

    let conn = match hub.admit(identity, peer_addr, tx.clone()).await {
        Ok(c) => c,
        Err(e) => {
            reject(&tx, e);
            drop(tx);
            let _ = send_task.await;
            return Ok(());
        }
    };
    drop(tx);
    let connection_id = conn.connection_id.clone();
    let mut closed = conn.closed_signal();
    drop(conn);

    // 被驱逐的死连接不会再发来任何帧，读循环必须同时等待关闭信号
    // An evicted dead peer never sends another frame, so the reader also waits on the close signal
    let mut reason = DisconnectReason::ClientClosed;
    let mut writer_done = false;
    loop {
        let msg = tokio::select! {
            msg = ws_receiver.next() => match msg {
                Some(msg) => msg,
                None => break,
            },
            _ = closed.wait_for(|closed| *closed) => {
                debug!("🔌 {} released by the hub, dropping socket", connection_id);
                break;
            }
            _ = &mut send_task, if !writer_done => {
                writer_done = true;
                reason = DisconnectReason::TransportError;
                break;
            }
        };
        match msg {
            Ok(Message::Text(text)) => crate::ws::handler::handle_text(&hub, &connection_id, &text).await,
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => crate::ws::handler::handle_text(&hub, &connection_id, &text).await,
                Err(_) => {
                    let _ = hub
                        .registry
                        .send_to_connection(&connection_id, HubError::validation("frame", "binary frames must be UTF-8 JSON").to_frame());
                }
            },
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                hub.heartbeat(&connection_id);
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("WebSocket error from {}: {}", connection_id, e);
                reason = DisconnectReason::TransportError;
                break;
            }
        }
    }

    hub.disconnect(&connection_id, reason).await;
    // 给关闭帧一个短暂的发送窗口，超时则放弃写端 / Short window to flush the close frame, then drop the writer
    if !writer_done && tokio::time::timeout(Duration::from_secs(1), &mut send_task).await.is_err() {
        debug!("writer for {} did not finish in time", connection_id);
        send_task.abort();
    }
    drop(ws_receiver);
    info!("👋 Client {} connection closed", connection_id);
    Ok(())
}

/// 首帧必须是 authenticate / The first frame must be `authenticate`
async fn wait_for_credential(hub: &ImHub, ws_receiver: &mut WsReader) -> HubResult<Identity> {
    while let Some(msg) = ws_receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bytes)) => String::from_utf8(bytes).map_err(|_| HubError::auth("expected authenticate frame"))?,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => return Err(HubError::auth(format!("transport error before authentication: {}", e))),
        };
        return match ClientFrame::parse(&text) {
            Ok(ClientFrame::Authenticate { credential }) => hub.authenticate(&credential).await,
            _ => Err(HubError::auth("first frame must be authenticate")),
        };
    }
    Err(HubError::auth("connection closed before authentication"))
}

fn reject(tx: &mpsc::UnboundedSender<Outbound>, err: HubError) {
    let reason = err.kind().to_string();
    let _ = tx.send(Outbound::Frame(err.to_frame()));
    let _ = tx.send(Outbound::Close(reason));
}
