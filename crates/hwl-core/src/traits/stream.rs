//! Byte stream halves

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StreamError;

/// Write half of a byte stream
#[async_trait]
pub trait StreamSender: Send {
    /// Send one chunk, preserving order with earlier chunks
    async fn send(&mut self, data: Bytes) -> Result<(), StreamError>;

    /// Signal end of stream to the other side. Idempotent.
    async fn close(&mut self) -> Result<(), StreamError>;
}

/// Read half of a byte stream
#[async_trait]
pub trait StreamReceiver: Send {
    /// Next chunk, or `None` once the other side closed
    async fn receive(&mut self) -> Result<Option<Bytes>, StreamError>;
}
