//! axum WebSocket transport
//!
//! Adapts a split axum [`WebSocket`] to the engine's transport traits. Text
//! and binary frames are both passed through as bytes; WebSocket-level
//! ping/pong is answered by axum and never reaches the engine.

use crate::hub::auth::HubUser;
use crate::hub::transport::{Transport, TransportError, TransportFeatures, TransportReader, TransportWriter};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};

/// Reads hub frames from a WebSocket.
pub struct WsReader {
    stream: SplitStream<WebSocket>,
}

#[async_trait]
impl TransportReader for WsReader {
    async fn read(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        loop {
            match self.stream.next().await {
                None | Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(Message::Text(text))) => return Ok(Some(text.into_bytes())),
                Some(Ok(Message::Binary(data))) => return Ok(Some(data)),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Err(e)) => return Err(TransportError::Io(e.to_string())),
            }
        }
    }
}

/// Writes hub frames to a WebSocket.
///
/// UTF-8 payloads go out as text frames, anything else as binary.
pub struct WsWriter {
    sink: SplitSink<WebSocket, Message>,
    closed: bool,
}

#[async_trait]
impl TransportWriter for WsWriter {
    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let message = match std::str::from_utf8(data) {
            Ok(text) => Message::Text(text.to_string()),
            Err(_) => Message::Binary(data.to_vec()),
        };
        self.sink
            .send(message)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let _ = self.sink.send(Message::Close(None)).await;
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }
}

/// Wrap an upgraded socket as an engine transport.
pub fn websocket_transport(socket: WebSocket, user: HubUser) -> Transport {
    let (sink, stream) = socket.split();
    Transport::new(
        WsReader { stream },
        WsWriter {
            sink,
            closed: false,
        },
        TransportFeatures {
            user,
            ..TransportFeatures::default()
        },
    )
}
