//! Multiplexed connection to an exporter
//!
//! A [`Channel`] owns one framed connection and runs two background tasks:
//! a writer draining the outbound frame queue and a reader routing inbound
//! frames to the request that owns their stream id. Every request gets a
//! fresh stream id; dropping a request before it completes sends `Cancel`
//! for that id so the exporter can stop the work. The reader never waits on
//! a request: payload is flow controlled per stream, and a stream that
//! overruns its window is cancelled on its own.

mod reconnect;
mod tls;

pub use reconnect::ExponentialBackoff;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{BoxStream, SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use hwl_core::config::{BackoffConfig, ClientConfig};
use hwl_core::stream::{close_routes, deliver, ByteStream, Delivery, MuxReceiver, MuxSender, RouteTable};
use hwl_core::time::{current_time_millis, elapsed_since};
use hwl_core::traits::{StreamReceiver, StreamSender};
use hwl_core::{Address, CallError, ConnectionError, StreamError};
use hwl_protocol::{
    AlternativeEndpoint, ErrorCode, Frame, FrameCodec, InstanceReport, Message, StreamId,
    PROTOCOL_VERSION,
};

/// Outbound frame queue depth shared by all requests on a channel
const OUTBOUND_FRAME_CAPACITY: usize = 256;

/// Streaming values produced by a remote driver
pub type ValueStream = BoxStream<'static, Result<Value, CallError>>;

/// Connection settings
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Bound on connect plus handshake
    pub connect_timeout: Duration,
    /// Bound on waiting for the answer of a unary request
    pub call_timeout: Option<Duration>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            call_timeout: None,
        }
    }
}

impl From<&ClientConfig> for ChannelOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            call_timeout: Some(config.call_timeout),
        }
    }
}

/// An exporter's answer to `GetReport`
#[derive(Debug, Clone)]
pub struct ExporterReport {
    pub reports: Vec<InstanceReport>,
    pub alternative_endpoints: Vec<AlternativeEndpoint>,
}

/// Shared handle to one multiplexed connection
///
/// Cloning is cheap; all clones use the same connection. The connection is
/// shut down when the last clone is dropped or [`Channel::close`] is called.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    address: String,
    frames: mpsc::Sender<Frame>,
    routes: RouteTable,
    next_stream_id: AtomicU32,
    options: ChannelOptions,
    shutdown: CancellationToken,
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("address", &self.inner.address)
            .finish_non_exhaustive()
    }
}

impl Channel {
    /// Connect to `unix://path`, `tcp://host:port` or `host:port`
    pub async fn connect(target: &str, options: ChannelOptions) -> Result<Self, ConnectionError> {
        let address: Address = target
            .parse()
            .map_err(|_| ConnectionError::InvalidAddress(target.to_string()))?;

        tracing::debug!("Connecting to {}", address);
        match &address {
            Address::Tcp(addr) => {
                let stream = dial(target, options.connect_timeout, TcpStream::connect(addr)).await?;
                stream.set_nodelay(true).ok();
                Self::handshake(stream, address.to_string(), options).await
            }
            Address::Unix(path) => {
                let stream =
                    dial(target, options.connect_timeout, UnixStream::connect(path)).await?;
                Self::handshake(stream, address.to_string(), options).await
            }
        }
    }

    /// Connect with automatic retry
    ///
    /// Malformed addresses and rejected handshakes are not retried.
    pub async fn connect_with_retry(
        target: &str,
        options: ChannelOptions,
        backoff: &BackoffConfig,
    ) -> Result<Self, ConnectionError> {
        let mut backoff = ExponentialBackoff::from_config(backoff);
        loop {
            match Self::connect(target, options.clone()).await {
                Ok(channel) => {
                    tracing::info!("Connected to exporter at {}", target);
                    return Ok(channel);
                }
                Err(e @ ConnectionError::InvalidAddress(_))
                | Err(e @ ConnectionError::Handshake { .. }) => return Err(e),
                Err(e) => match backoff.next_delay() {
                    Some(delay) => {
                        tracing::warn!("Connection failed: {}. Retrying in {:?}", e, delay);
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        tracing::error!("Connection failed: {}. Giving up", e);
                        return Err(ConnectionError::RetriesExhausted {
                            address: target.to_string(),
                            attempts: backoff.attempts(),
                        });
                    }
                },
            }
        }
    }

    /// Dial an exporter's alternative TLS endpoint
    pub async fn connect_alternative(
        endpoint: &AlternativeEndpoint,
        options: ChannelOptions,
    ) -> Result<Self, ConnectionError> {
        let (connector, server_name) = tls::connector_for(endpoint)?;
        let target = endpoint.endpoint.as_str();

        let tcp = dial(target, options.connect_timeout, TcpStream::connect(target)).await?;
        tcp.set_nodelay(true).ok();

        let tls = tokio::time::timeout(options.connect_timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| ConnectionError::Timeout {
                address: target.to_string(),
            })?
            .map_err(|e| ConnectionError::Tls {
                address: target.to_string(),
                reason: e.to_string(),
            })?;

        tracing::debug!("TLS session established with {}", target);
        Self::handshake(tls, format!("tls://{}", target), options).await
    }

    /// Run the protocol handshake over an established transport
    pub async fn handshake<T>(
        io: T,
        address: String,
        options: ChannelOptions,
    ) -> Result<Self, ConnectionError>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut framed = Framed::new(io, FrameCodec::new());
        framed
            .send(Frame::new(
                StreamId::CONTROL,
                Message::Hello {
                    version: PROTOCOL_VERSION.to_string(),
                },
            ))
            .await?;

        let reply = tokio::time::timeout(options.connect_timeout, framed.next())
            .await
            .map_err(|_| ConnectionError::Timeout {
                address: address.clone(),
            })?;

        match reply {
            Some(Ok(Frame {
                message: Message::HelloAck { accepted: true, .. },
                ..
            })) => {}
            Some(Ok(Frame {
                message: Message::HelloAck { reason, .. },
                ..
            })) => {
                return Err(ConnectionError::Handshake {
                    address,
                    reason: reason.unwrap_or_else(|| "rejected".to_string()),
                })
            }
            Some(Ok(frame)) => {
                return Err(ConnectionError::Handshake {
                    address,
                    reason: format!("unexpected {:?}", frame.message.message_type()),
                })
            }
            Some(Err(e)) => return Err(e.into()),
            None => return Err(ConnectionError::ConnectionLost(address)),
        }

        Ok(Self::start(framed, address, options))
    }

    fn start<T>(framed: Framed<T, FrameCodec>, address: String, options: ChannelOptions) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (sink, stream) = framed.split();
        let (frames_tx, frames_rx) = mpsc::channel(OUTBOUND_FRAME_CAPACITY);
        let routes: RouteTable = Arc::new(DashMap::new());
        let shutdown = CancellationToken::new();

        tokio::spawn(write_loop(sink, frames_rx, shutdown.clone()));
        tokio::spawn(read_loop(
            stream,
            Arc::clone(&routes),
            frames_tx.clone(),
            shutdown.clone(),
            address.clone(),
        ));

        Self {
            inner: Arc::new(ChannelInner {
                address,
                frames: frames_tx,
                routes,
                next_stream_id: AtomicU32::new(1),
                options,
                shutdown,
            }),
        }
    }

    /// Address this channel is connected to
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Settings the channel was opened with
    pub fn options(&self) -> &ChannelOptions {
        &self.inner.options
    }

    /// Whether the connection has shut down
    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Shut down the connection for every clone
    pub fn close(&self) {
        self.inner.shutdown.cancel();
    }

    /// Fetch the exporter's instance reports and alternative endpoints
    pub async fn get_report(&self) -> Result<ExporterReport, CallError> {
        match self.unary(Message::GetReport).await? {
            Message::Report {
                reports,
                alternative_endpoints,
            } => Ok(ExporterReport {
                reports,
                alternative_endpoints,
            }),
            other => Err(unexpected(&other)),
        }
    }

    /// Unary call with JSON encoded arguments and result
    pub async fn driver_call(
        &self,
        uuid: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, CallError> {
        let message = Message::DriverCall {
            uuid: uuid.to_string(),
            method: method.to_string(),
            args: encode_args(&args)?,
        };
        match self.unary(message).await? {
            Message::DriverCallResult { result } => decode_value(&result),
            other => Err(unexpected(&other)),
        }
    }

    /// Server-streaming call; the returned stream ends after the last value
    pub async fn streaming_driver_call(
        &self,
        uuid: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<ValueStream, CallError> {
        self.streaming_call_inner(uuid, method, args, None).await
    }

    /// Like [`streaming_driver_call`](Self::streaming_driver_call), but the
    /// call is cancelled on the exporter once `cancel` fires and the stream
    /// then ends with a cancellation error
    pub async fn streaming_driver_call_until(
        &self,
        uuid: &str,
        method: &str,
        args: Vec<Value>,
        cancel: &CancellationToken,
    ) -> Result<ValueStream, CallError> {
        self.streaming_call_inner(uuid, method, args, Some(cancel)).await
    }

    async fn streaming_call_inner(
        &self,
        uuid: &str,
        method: &str,
        args: Vec<Value>,
        cancel: Option<&CancellationToken>,
    ) -> Result<ValueStream, CallError> {
        let message = Message::StreamingDriverCall {
            uuid: uuid.to_string(),
            method: method.to_string(),
            args: encode_args(&args)?,
        };
        let mut request = self.request(message).await?;
        if let Some(cancel) = cancel {
            request.watch(cancel);
        }

        let values = futures::stream::unfold(Some(request), |state| async move {
            let mut request = state?;
            let next = tokio::select! {
                biased;
                _ = request.cancel.cancelled() => {
                    return Some((Err(CallError::cancelled()), None));
                }
                next = request.receiver.recv_message() => next,
            };
            match next {
                Some(Message::StreamingItem { value }) => Some((decode_value(&value), Some(request))),
                Some(Message::StreamingEnd) => {
                    request.finish();
                    None
                }
                Some(Message::Error { code, message }) => {
                    request.finish();
                    Some((Err(CallError::new(code, message)), None))
                }
                Some(other) => Some((Err(unexpected(&other)), None)),
                None => {
                    request.finish();
                    Some((Err(CallError::transport("connection closed")), None))
                }
            }
        });
        Ok(values.boxed())
    }

    /// Open a raw byte stream to a driver
    ///
    /// Resolves once the exporter accepted or refused the stream; no payload
    /// is exchanged before that.
    pub async fn open_stream(
        &self,
        uuid: &str,
        method: &str,
        metadata: Vec<(String, String)>,
    ) -> Result<ByteStream, CallError> {
        self.open_stream_inner(uuid, method, metadata, None).await
    }

    /// Like [`open_stream`](Self::open_stream), but once `cancel` fires the
    /// exporter stops its end and both halves fail with
    /// [`StreamError::Cancelled`]
    pub async fn open_stream_until(
        &self,
        uuid: &str,
        method: &str,
        metadata: Vec<(String, String)>,
        cancel: &CancellationToken,
    ) -> Result<ByteStream, CallError> {
        self.open_stream_inner(uuid, method, metadata, Some(cancel)).await
    }

    async fn open_stream_inner(
        &self,
        uuid: &str,
        method: &str,
        metadata: Vec<(String, String)>,
        cancel: Option<&CancellationToken>,
    ) -> Result<ByteStream, CallError> {
        let message = Message::StreamOpen {
            uuid: uuid.to_string(),
            method: method.to_string(),
            metadata,
        };
        let mut request = self.request(message).await?;
        match self.await_reply(&mut request).await? {
            Message::StreamReady => {
                if let Some(cancel) = cancel {
                    request.watch(cancel);
                }
                let sender = WatchedSender {
                    inner: request.receiver.sender(),
                    cancel: request.cancel.clone(),
                };
                Ok(ByteStream::new(Box::new(sender), Box::new(request)))
            }
            other => Err(unexpected(&other)),
        }
    }

    /// Round-trip latency of a heartbeat
    pub async fn ping(&self) -> Result<Duration, CallError> {
        let sent = current_time_millis();
        match self.unary(Message::Heartbeat { timestamp: sent }).await? {
            Message::HeartbeatAck { timestamp } => Ok(elapsed_since(timestamp)),
            other => Err(unexpected(&other)),
        }
    }

    fn allocate_stream_id(&self) -> StreamId {
        loop {
            let id = self.inner.next_stream_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return StreamId::new(id);
            }
        }
    }

    async fn request(&self, message: Message) -> Result<Request, CallError> {
        if self.is_closed() {
            return Err(CallError::transport(format!(
                "connection to {} is closed",
                self.inner.address
            )));
        }

        let stream_id = self.allocate_stream_id();
        let receiver = MuxReceiver::register(stream_id, &self.inner.routes, self.inner.frames.clone());
        let request = Request {
            receiver,
            frames: self.inner.frames.clone(),
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
            finished: false,
        };

        self.inner
            .frames
            .send(Frame::new(stream_id, message))
            .await
            .map_err(|_| CallError::transport(format!("connection to {} lost", self.inner.address)))?;
        Ok(request)
    }

    async fn await_reply(&self, request: &mut Request) -> Result<Message, CallError> {
        let reply = match self.inner.options.call_timeout {
            Some(limit) => tokio::time::timeout(limit, request.receiver.recv_message())
                .await
                .map_err(|_| {
                    CallError::timeout(format!(
                        "no answer from {} within {:?}",
                        self.inner.address, limit
                    ))
                })?,
            None => request.receiver.recv_message().await,
        };

        match reply {
            Some(Message::Error { code, message }) => {
                request.finish();
                Err(CallError::new(code, message))
            }
            Some(message) => Ok(message),
            None => {
                request.finish();
                Err(CallError::transport(format!(
                    "connection to {} lost",
                    self.inner.address
                )))
            }
        }
    }

    async fn unary(&self, message: Message) -> Result<Message, CallError> {
        let mut request = self.request(message).await?;
        let reply = self.await_reply(&mut request).await?;
        request.finish();
        Ok(reply)
    }
}

/// One in-flight request; sends `Cancel` if dropped before completion
struct Request {
    receiver: MuxReceiver,
    frames: mpsc::Sender<Frame>,
    /// Owner's token; never fires unless [`watch`](Self::watch) set one
    cancel: CancellationToken,
    /// Fired on drop to stop the watcher
    done: CancellationToken,
    finished: bool,
}

impl Request {
    fn stream_id(&self) -> StreamId {
        self.receiver.stream_id()
    }

    fn finish(&mut self) {
        self.finished = true;
    }

    /// Cancel the exporter side as soon as `cancel` fires, whether or not
    /// anyone is still polling this request
    fn watch(&mut self, cancel: &CancellationToken) {
        self.cancel = cancel.clone();
        let cancel = cancel.clone();
        let done = self.done.clone();
        let frames = self.frames.clone();
        let stream_id = self.stream_id();
        tokio::spawn(async move {
            tokio::select! {
                _ = done.cancelled() => {}
                _ = cancel.cancelled() => {
                    tracing::debug!("Owner closed, cancelling {}", stream_id);
                    let _ = frames.try_send(Frame::new(stream_id, Message::Cancel));
                }
            }
        });
    }
}

#[async_trait::async_trait]
impl StreamReceiver for Request {
    async fn receive(&mut self) -> Result<Option<Bytes>, StreamError> {
        let received = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StreamError::Cancelled),
            received = self.receiver.receive() => received,
        };
        if !matches!(received, Ok(Some(_))) {
            self.finished = true;
        }
        received
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        self.done.cancel();
        if !self.finished && !self.cancel.is_cancelled() {
            let _ = self
                .frames
                .try_send(Frame::new(self.receiver.stream_id(), Message::Cancel));
        }
    }
}

/// Write half of an opened stream that stops accepting data once the
/// owner's token fires
struct WatchedSender {
    inner: MuxSender,
    cancel: CancellationToken,
}

#[async_trait::async_trait]
impl StreamSender for WatchedSender {
    async fn send(&mut self, data: Bytes) -> Result<(), StreamError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StreamError::Cancelled),
            sent = self.inner.send(data) => sent,
        }
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        self.inner.close().await
    }
}

async fn dial<S, F>(target: &str, limit: Duration, connect: F) -> Result<S, ConnectionError>
where
    F: std::future::Future<Output = std::io::Result<S>>,
{
    match tokio::time::timeout(limit, connect).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(ConnectionError::Refused {
            address: target.to_string(),
            source,
        }),
        Err(_) => Err(ConnectionError::Timeout {
            address: target.to_string(),
        }),
    }
}

async fn write_loop<T>(
    mut sink: SplitSink<Framed<T, FrameCodec>, Frame>,
    mut frames: mpsc::Receiver<Frame>,
    shutdown: CancellationToken,
) where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if let Err(e) = sink.send(frame).await {
            tracing::warn!("Failed to write frame: {}", e);
            break;
        }
    }
    let _ = sink.close().await;
    shutdown.cancel();
}

async fn read_loop<T>(
    mut stream: SplitStream<Framed<T, FrameCodec>>,
    routes: RouteTable,
    frames: mpsc::Sender<Frame>,
    shutdown: CancellationToken,
    address: String,
) where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = stream.next() => frame,
        };
        match frame {
            Some(Ok(Frame { stream_id, message })) => {
                let message_type = message.message_type();
                match deliver(&routes, stream_id, message) {
                    Delivery::Delivered => {}
                    Delivery::Unrouted | Delivery::Gone => {
                        tracing::trace!("Dropping {:?} for finished {}", message_type, stream_id);
                    }
                    Delivery::Overrun => {
                        let _ = frames.try_send(Frame::new(stream_id, Message::Cancel));
                    }
                }
            }
            Some(Err(e)) => {
                tracing::warn!("Protocol error from {}: {}", address, e);
                break;
            }
            None => {
                tracing::debug!("Connection to {} closed", address);
                break;
            }
        }
    }
    close_routes(&routes);
    shutdown.cancel();
}

fn encode_args(args: &[Value]) -> Result<Bytes, CallError> {
    Ok(Bytes::from(serde_json::to_vec(args)?))
}

fn decode_value(bytes: &[u8]) -> Result<Value, CallError> {
    serde_json::from_slice(bytes)
        .map_err(|e| CallError::new(ErrorCode::InvalidMessage, format!("bad result: {}", e)))
}

fn unexpected(message: &Message) -> CallError {
    CallError::new(
        ErrorCode::InvalidMessage,
        format!("unexpected {:?} reply", message.message_type()),
    )
}
