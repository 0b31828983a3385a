use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::coordinator::SharedCoordinator;
use crate::protocol::ServerMessage;

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    remote_addr: Option<ConnectInfo<SocketAddr>>,
    State(coordinator): State<SharedCoordinator>,
) -> Response {
    let remote_addr = remote_addr.map(|ConnectInfo(addr)| addr);
    ws.on_upgrade(move |socket| handle_socket(socket, coordinator, remote_addr))
}

/// Run one signaling connection until its channel closes.
async fn handle_socket(
    socket: WebSocket,
    coordinator: SharedCoordinator,
    remote_addr: Option<SocketAddr>,
) {
    let (mut sender, mut receiver) = socket.split();

    // The registry holds the only sender, so the writer below ends once the
    // connection is unregistered and its queue is drained.
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let connection = coordinator.connect(tx);
    debug!(connection = %connection, remote_addr = ?remote_addr, "websocket connected");

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(err) => {
                    warn!(connection = %connection, error = %err, "failed to encode message");
                    continue;
                }
            };
            if sender.send(Message::Text(json)).await.is_err() {
                debug!(connection = %connection, "socket closed while sending");
                break;
            }
        }
        debug!(connection = %connection, "message sender task ended");
    });

    while let Some(msg_result) = receiver.next().await {
        let msg = match msg_result {
            Ok(m) => m,
            Err(e) => {
                warn!(connection = %connection, error = %e, "websocket error");
                break;
            }
        };

        match msg {
            Message::Text(text) => coordinator.handle_text(connection, &text),
            Message::Binary(data) => match std::str::from_utf8(&data) {
                Ok(text) => coordinator.handle_text(connection, text),
                Err(_) => debug!(
                    connection = %connection,
                    len = data.len(),
                    "ignoring non-UTF8 binary frame"
                ),
            },
            Message::Close(_) => {
                debug!(connection = %connection, "received close frame");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    coordinator.disconnect(connection);
    debug!(connection = %connection, "websocket disconnected");
}
