use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::StreamExt;
use serde::Deserialize;

use crate::connection_manager::{Connection, ConnectionManager, DisconnectReason};
use crate::server::AppState;

use super::message::{ClientMessage, ServerMessage};
use super::ws_transport::WsTransport;

const ANONYMOUS_NAME: &str = "anonymous";

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub user_id: Option<String>,
    pub name: Option<String>,
}

/// WebSocket upgrade handler.
///
/// Admission happens after the upgrade so that rejections can be reported
/// with a close code the client can act on.
#[tracing::instrument(
    name = "ws.upgrade",
    skip(ws, state, query),
    fields(peer = %addr, user_id = ?query.user_id)
)]
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<WsQuery>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.connection_manager, addr, query))
}

/// Handle an upgraded socket from admission to teardown
async fn handle_socket(
    socket: WebSocket,
    manager: Arc<ConnectionManager>,
    addr: SocketAddr,
    query: WsQuery,
) {
    let (sink, mut stream) = socket.split();
    let user_id = query.user_id.filter(|id| !id.trim().is_empty());
    let display_name = query
        .name
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| ANONYMOUS_NAME.to_string());

    let connection = match manager
        .connect(
            Box::new(WsTransport::new(sink)),
            user_id,
            display_name,
            addr.ip().to_string(),
        )
        .await
    {
        Ok(connection) => connection,
        Err(e) => {
            tracing::warn!(peer = %addr, kind = e.kind(), error = %e, "WebSocket connection refused");
            return;
        }
    };
    let connection_id = connection.id;

    while let Some(result) = stream.next().await {
        match result {
            Ok(msg) => {
                if !process_message(msg, &manager, &connection).await {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(connection_id = %connection_id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    // A no-op if the server already tore the connection down
    manager
        .disconnect(connection_id, DisconnectReason::ClientClosed)
        .await;
}

/// Process one inbound frame. Returns false when the read loop should end.
async fn process_message(
    msg: Message,
    manager: &ConnectionManager,
    connection: &Arc<Connection>,
) -> bool {
    match msg {
        Message::Text(text) => {
            if let Ok(ClientMessage::Ping) = serde_json::from_str::<ClientMessage>(&text) {
                connection.record_inbound(text.len());
                if let Err(e) = manager.send_message(connection.id, &ServerMessage::Pong).await {
                    tracing::debug!(connection_id = %connection.id, error = %e, "Pong not sent");
                }
                return true;
            }
            manager.record_inbound(connection.id, text.as_str())
        }
        Message::Binary(data) => {
            connection.record_inbound(data.len());
            let error = ServerMessage::error("UNSUPPORTED_FORMAT", "Binary messages are not supported");
            if let Err(e) = manager.send_message(connection.id, &error).await {
                tracing::debug!(connection_id = %connection.id, error = %e, "Error reply not sent");
            }
            true
        }
        Message::Ping(_) | Message::Pong(_) => {
            // axum answers pings itself; they still count as activity
            connection.touch();
            true
        }
        Message::Close(_) => {
            tracing::debug!(connection_id = %connection.id, "Received close frame");
            false
        }
    }
}
