//! Bidirectional byte streams
//!
//! A [`ByteStream`] pairs a [`StreamSender`] with a [`StreamReceiver`]. The
//! halves may come from a local socket, a logical stream multiplexed over an
//! hwlink connection, or an in-memory pipe; the relay and the drivers only
//! ever see the trait objects.

mod mux;
mod relay;

pub use mux::{
    close_routes, deliver, Delivery, MuxReceiver, MuxSender, Route, RouteTable, MAX_DATA_CHUNK,
    STREAM_WINDOW,
};
pub use relay::{relay, RelayStats};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;

use crate::error::StreamError;
use crate::traits::{StreamReceiver, StreamSender};

/// Read buffer size for socket-backed streams
pub const IO_CHUNK_SIZE: usize = 16 * 1024;

/// A bidirectional byte stream made of two independently owned halves
pub struct ByteStream {
    sender: Box<dyn StreamSender>,
    receiver: Box<dyn StreamReceiver>,
}

impl ByteStream {
    /// Assemble a stream from its halves
    pub fn new(sender: Box<dyn StreamSender>, receiver: Box<dyn StreamReceiver>) -> Self {
        Self { sender, receiver }
    }

    /// Wrap anything readable and writable, such as a socket
    pub fn from_io<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        Self::new(
            Box::new(IoSender { writer }),
            Box::new(IoReceiver {
                reader: ReaderStream::with_capacity(reader, IO_CHUNK_SIZE),
            }),
        )
    }

    /// Two connected in-memory streams; bytes sent on one arrive on the other
    pub fn pair(capacity: usize) -> (ByteStream, ByteStream) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        (
            Self::new(
                Box::new(ChannelSender { tx: Some(a_tx) }),
                Box::new(ChannelReceiver { rx: b_rx }),
            ),
            Self::new(
                Box::new(ChannelSender { tx: Some(b_tx) }),
                Box::new(ChannelReceiver { rx: a_rx }),
            ),
        )
    }

    pub async fn send(&mut self, data: Bytes) -> Result<(), StreamError> {
        self.sender.send(data).await
    }

    pub async fn receive(&mut self) -> Result<Option<Bytes>, StreamError> {
        self.receiver.receive().await
    }

    /// Close the write half
    pub async fn close(&mut self) -> Result<(), StreamError> {
        self.sender.close().await
    }

    /// Separate the halves so they can be driven concurrently
    pub fn split(self) -> (Box<dyn StreamSender>, Box<dyn StreamReceiver>) {
        (self.sender, self.receiver)
    }
}

impl std::fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteStream").finish_non_exhaustive()
    }
}

struct IoSender<W> {
    writer: W,
}

#[async_trait]
impl<W> StreamSender for IoSender<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, data: Bytes) -> Result<(), StreamError> {
        self.writer.write_all(&data).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        match self.writer.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

struct IoReceiver<R> {
    reader: ReaderStream<R>,
}

#[async_trait]
impl<R> StreamReceiver for IoReceiver<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn receive(&mut self) -> Result<Option<Bytes>, StreamError> {
        match self.reader.next().await {
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }
}

struct ChannelSender {
    tx: Option<mpsc::Sender<Bytes>>,
}

#[async_trait]
impl StreamSender for ChannelSender {
    async fn send(&mut self, data: Bytes) -> Result<(), StreamError> {
        let tx = self.tx.as_ref().ok_or(StreamError::Closed)?;
        tx.send(data).await.map_err(|_| StreamError::Closed)
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        self.tx = None;
        Ok(())
    }
}

struct ChannelReceiver {
    rx: mpsc::Receiver<Bytes>,
}

#[async_trait]
impl StreamReceiver for ChannelReceiver {
    async fn receive(&mut self) -> Result<Option<Bytes>, StreamError> {
        Ok(self.rx.recv().await)
    }
}
