//! [`Connection`] over an axum WebSocket.

use anyhow::Result;
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use voxrelay_core::{Connection, Frame};

/// Splits the socket so reads never wait behind writes. Writers from the
/// session workers share the sink through a mutex.
pub struct WsConnection {
    sink: Mutex<SplitSink<WebSocket, Message>>,
    stream: Mutex<SplitStream<WebSocket>>,
}

impl WsConnection {
    pub fn new(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        }
    }
}

#[async_trait]
impl Connection for WsConnection {
    async fn write_message(&self, frame: Frame) -> Result<()> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(audio) => Message::Binary(audio),
        };
        self.sink.lock().await.send(message).await?;
        Ok(())
    }

    async fn read_message(&self, stop: &CancellationToken) -> Result<Option<Frame>> {
        let mut stream = self.stream.lock().await;
        loop {
            let next = tokio::select! {
                _ = stop.cancelled() => return Ok(None),
                next = stream.next() => next,
            };
            match next {
                None => return Ok(None),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(Message::Text(text))) => return Ok(Some(Frame::Text(text.to_string()))),
                Some(Ok(Message::Binary(audio))) => return Ok(Some(Frame::Binary(audio))),
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "Client sent close frame");
                    return Ok(None);
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            }
        }
    }

    async fn close(&self) -> Result<()> {
        let mut sink = self.sink.lock().await;
        // The peer may already be gone.
        let _ = sink.send(Message::Close(None)).await;
        sink.close().await?;
        Ok(())
    }
}
