use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::SplitSink;
use futures::SinkExt;

use super::transport::{CloseCode, Transport, TransportError};

/// `Transport` over the write half of an upgraded axum WebSocket.
///
/// The read half stays with the socket handler, which feeds inbound frames
/// to the manager.
pub struct WsTransport {
    sink: SplitSink<WebSocket, Message>,
}

impl WsTransport {
    pub fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn accept(&mut self) -> Result<(), TransportError> {
        // The HTTP upgrade has already completed by the time we hold a sink
        Ok(())
    }

    async fn send_text(&mut self, payload: &str) -> Result<(), TransportError> {
        self.sink
            .send(Message::Text(payload.into()))
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))
    }

    async fn close(&mut self, code: CloseCode, reason: &str) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: code.0,
            reason: reason.into(),
        };
        self.sink
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))
    }
}
