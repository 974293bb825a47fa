//! Transport seam between a session and its client.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

/// One transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

/// A bidirectional, message-oriented client connection.
///
/// Writes may be issued concurrently from several workers; implementations
/// serialize them internally.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn write_message(&self, frame: Frame) -> Result<()>;

    /// Waits for the next frame. Returns `Ok(None)` when the peer closed the
    /// connection or `stop` fired.
    async fn read_message(&self, stop: &CancellationToken) -> Result<Option<Frame>>;

    async fn close(&self) -> Result<()>;
}
