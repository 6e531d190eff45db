//! Per-connection protocol handler
//!
//! After the `Hello` handshake every inbound frame is dispatched by type.
//! Reports and heartbeats are answered inline. Each driver call, streaming
//! call and byte stream runs in its own task with its own cancellation
//! token, a child of the connection's token, so a `Cancel` for one stream
//! id stops exactly that work and dropping the connection stops all of it.
//!
//! Stream frames are routed without waiting. A client that sends past a
//! stream's credit window loses that stream only.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use hwl_core::stream::{close_routes, deliver, Delivery, MuxReceiver, RouteTable};
use hwl_core::{relay, ByteStream, CallError};
use hwl_protocol::message::major_version;
use hwl_protocol::{ErrorCode, Frame, FrameCodec, Message, StreamId, PROTOCOL_VERSION};

use crate::driver::ValueStream;
use crate::session::Session;
use crate::ExportError;

/// Bound on the time a peer may take to send `Hello`
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound frame queue depth shared by all streams of a connection
const OUTBOUND_FRAME_CAPACITY: usize = 256;

/// Serves one client connection
pub struct ConnectionHandler {
    session: Arc<Session>,
    peer: String,
    cancel: CancellationToken,
}

impl ConnectionHandler {
    /// Handler for a connection from `peer`; `cancel` stops it
    pub fn new(session: Arc<Session>, peer: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            session,
            peer: peer.into(),
            cancel,
        }
    }

    /// Run until the peer disconnects or the handler is cancelled
    pub async fn run<T>(self, io: T) -> Result<(), ExportError>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut framed = Framed::new(io, FrameCodec::new());
        self.handshake(&mut framed).await?;
        tracing::debug!("Handshake with {} complete", self.peer);

        let (sink, mut inbound) = framed.split();
        let (frames_tx, frames_rx) = mpsc::channel(OUTBOUND_FRAME_CAPACITY);
        let writer = tokio::spawn(write_loop(sink, frames_rx, self.cancel.clone()));

        let dispatcher = Dispatcher {
            session: self.session,
            frames: frames_tx,
            routes: Arc::new(DashMap::new()),
            tasks: Arc::new(DashMap::new()),
            cancel: self.cancel.clone(),
        };

        let result = loop {
            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break Ok(()),
                frame = inbound.next() => frame,
            };
            match frame {
                Some(Ok(frame)) => dispatcher.dispatch(frame).await,
                Some(Err(e)) => break Err(ExportError::Protocol(e)),
                None => break Ok(()),
            }
        };

        self.cancel.cancel();
        close_routes(&dispatcher.routes);
        if let Err(e) = writer.await {
            tracing::debug!("Writer for {} ended abnormally: {}", self.peer, e);
        }
        result
    }

    async fn handshake<T>(&self, framed: &mut Framed<T, FrameCodec>) -> Result<(), ExportError>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let failed = |reason: String| ExportError::Handshake {
            peer: self.peer.clone(),
            reason,
        };

        let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next())
            .await
            .map_err(|_| failed("timed out waiting for Hello".to_string()))?;

        let version = match first {
            Some(Ok(Frame {
                message: Message::Hello { version },
                ..
            })) => version,
            Some(Ok(frame)) => {
                return Err(failed(format!(
                    "expected Hello, got {:?}",
                    frame.message.message_type()
                )))
            }
            Some(Err(e)) => return Err(e.into()),
            None => return Err(failed("connection closed".to_string())),
        };

        let accepted = major_version(&version).is_some()
            && major_version(&version) == major_version(PROTOCOL_VERSION);
        let reason = (!accepted).then(|| {
            format!(
                "unsupported protocol version {} (exporter speaks {})",
                version, PROTOCOL_VERSION
            )
        });

        framed
            .send(Frame::new(
                StreamId::CONTROL,
                Message::HelloAck {
                    accepted,
                    reason: reason.clone(),
                },
            ))
            .await?;

        match reason {
            Some(reason) => Err(failed(reason)),
            None => Ok(()),
        }
    }
}

/// Routes the frames of one established connection
struct Dispatcher {
    session: Arc<Session>,
    frames: mpsc::Sender<Frame>,
    routes: RouteTable,
    tasks: Arc<DashMap<StreamId, CancellationToken>>,
    cancel: CancellationToken,
}

impl Dispatcher {
    async fn dispatch(&self, frame: Frame) {
        let Frame { stream_id, message } = frame;
        match message {
            Message::Heartbeat { timestamp } => {
                self.reply(stream_id, Message::HeartbeatAck { timestamp })
                    .await;
            }
            Message::GetReport => {
                let report = Message::Report {
                    reports: self.session.reports().to_vec(),
                    alternative_endpoints: self.session.alternative_endpoints().to_vec(),
                };
                self.reply(stream_id, report).await;
            }
            Message::DriverCall { uuid, method, args } => {
                let token = self.track(stream_id);
                let work = serve_call(
                    Arc::clone(&self.session),
                    self.frames.clone(),
                    stream_id,
                    CallRequest { uuid, method, args },
                    token,
                );
                self.spawn(stream_id, work);
            }
            Message::StreamingDriverCall { uuid, method, args } => {
                // Routed so the caller's window grants reach the item sender
                let receiver = MuxReceiver::register(stream_id, &self.routes, self.frames.clone());
                let token = self.track(stream_id);
                let work = serve_streaming_call(
                    Arc::clone(&self.session),
                    receiver,
                    CallRequest { uuid, method, args },
                    token,
                );
                self.spawn(stream_id, work);
            }
            Message::StreamOpen {
                uuid,
                method,
                metadata,
            } => {
                // Registered before the task starts so no payload frame can
                // arrive unrouted
                let receiver = MuxReceiver::register(stream_id, &self.routes, self.frames.clone());
                let token = self.track(stream_id);
                let work = serve_stream(
                    Arc::clone(&self.session),
                    StreamRequest {
                        uuid,
                        method,
                        metadata,
                    },
                    receiver,
                    token,
                );
                self.spawn(stream_id, work);
            }
            message @ (Message::Data(_) | Message::StreamClose | Message::WindowUpdate { .. }) => {
                self.route(stream_id, message).await;
            }
            Message::Cancel => {
                if let Some((_, token)) = self.tasks.remove(&stream_id) {
                    tracing::debug!("Cancelling work on {}", stream_id);
                    token.cancel();
                }
            }
            other => {
                tracing::debug!(
                    "Rejecting unexpected {:?} on {}",
                    other.message_type(),
                    stream_id
                );
                self.reply(
                    stream_id,
                    Message::error(
                        ErrorCode::InvalidMessage,
                        format!("unexpected {:?}", other.message_type()),
                    ),
                )
                .await;
            }
        }
    }

    fn track(&self, stream_id: StreamId) -> CancellationToken {
        let token = self.cancel.child_token();
        self.tasks.insert(stream_id, token.clone());
        token
    }

    fn spawn<F>(&self, stream_id: StreamId, work: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let tasks = Arc::clone(&self.tasks);
        tokio::spawn(async move {
            work.await;
            tasks.remove(&stream_id);
        });
    }

    async fn reply(&self, stream_id: StreamId, message: Message) {
        if self.frames.send(Frame::new(stream_id, message)).await.is_err() {
            tracing::debug!("Dropping reply on {}: connection closed", stream_id);
        }
    }

    /// Hand a stream frame to its task without waiting on it
    async fn route(&self, stream_id: StreamId, message: Message) {
        let message_type = message.message_type();
        match deliver(&self.routes, stream_id, message) {
            Delivery::Delivered => {}
            Delivery::Unrouted | Delivery::Gone => {
                tracing::trace!("Dropping {:?} for finished {}", message_type, stream_id);
            }
            Delivery::Overrun => {
                if let Some((_, token)) = self.tasks.remove(&stream_id) {
                    token.cancel();
                }
                self.reply(
                    stream_id,
                    Message::error(
                        ErrorCode::Transport,
                        format!("{} overran its receive window", stream_id),
                    ),
                )
                .await;
            }
        }
    }
}

struct CallRequest {
    uuid: String,
    method: String,
    args: Bytes,
}

struct StreamRequest {
    uuid: String,
    method: String,
    metadata: Vec<(String, String)>,
}

async fn serve_call(
    session: Arc<Session>,
    frames: mpsc::Sender<Frame>,
    stream_id: StreamId,
    request: CallRequest,
    token: CancellationToken,
) {
    let result = call(&session, &request, &token).await;

    if token.is_cancelled() {
        return;
    }

    let reply = match result.and_then(|value| encode_value(&value)) {
        Ok(result) => Message::DriverCallResult { result },
        Err(e) => {
            tracing::debug!("{} on {} failed: {}", request.method, request.uuid, e);
            Message::error(e.code, e.message)
        }
    };
    let _ = frames.send(Frame::new(stream_id, reply)).await;
}

async fn serve_streaming_call(
    session: Arc<Session>,
    receiver: MuxReceiver,
    request: CallRequest,
    token: CancellationToken,
) {
    let mut items = receiver.sender();
    let opened = streaming_call(&session, &request, &token).await;

    let mut values = match opened {
        Ok(values) => values,
        Err(e) => {
            if !token.is_cancelled() {
                let _ = items.send_message(Message::error(e.code, e.message)).await;
            }
            return;
        }
    };

    let mut count = 0usize;
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => {
                tracing::debug!("Streaming {} on {} cancelled after {} items", request.method, request.uuid, count);
                return;
            }
            next = values.next() => next,
        };

        let (message, last) = match next.map(|item| item.and_then(|value| encode_value(&value))) {
            Some(Ok(value)) => (Message::StreamingItem { value }, false),
            Some(Err(e)) => (Message::error(e.code, e.message), true),
            None => (Message::StreamingEnd, true),
        };
        // Waits for window credit, so a caller that stops reading parks
        // this task instead of the connection
        let sent = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            sent = items.send_message(message) => sent,
        };
        if sent.is_err() || last {
            return;
        }
        count += 1;
    }
}

async fn serve_stream(
    session: Arc<Session>,
    request: StreamRequest,
    receiver: MuxReceiver,
    token: CancellationToken,
) {
    let mut sender = receiver.sender();
    let opened = open_stream(&session, &request, &token).await;

    let downstream = match opened {
        Ok(stream) => stream,
        Err(e) => {
            tracing::debug!(
                "Stream {} on {} refused: {}",
                request.method,
                request.uuid,
                e
            );
            if !token.is_cancelled() {
                let _ = sender.send_message(Message::error(e.code, e.message)).await;
            }
            return;
        }
    };

    if sender.send_message(Message::StreamReady).await.is_err() {
        return;
    }

    let upstream = ByteStream::new(Box::new(sender), Box::new(receiver));
    match relay(upstream, downstream, token).await {
        Ok(stats) => tracing::debug!(
            "Stream {} on {} finished ({} bytes in, {} bytes out)",
            request.method,
            request.uuid,
            stats.a_to_b,
            stats.b_to_a
        ),
        Err(e) => tracing::warn!(
            "Stream {} on {} failed: {}",
            request.method,
            request.uuid,
            e
        ),
    }
}

async fn call(
    session: &Session,
    request: &CallRequest,
    token: &CancellationToken,
) -> Result<Value, CallError> {
    let driver = session.driver(&request.uuid)?;
    let args = decode_args(&request.args)?;
    tokio::select! {
        _ = token.cancelled() => Err(CallError::cancelled()),
        result = driver.call(&request.method, args) => result,
    }
}

async fn streaming_call(
    session: &Session,
    request: &CallRequest,
    token: &CancellationToken,
) -> Result<ValueStream, CallError> {
    let driver = session.driver(&request.uuid)?;
    let args = decode_args(&request.args)?;
    tokio::select! {
        _ = token.cancelled() => Err(CallError::cancelled()),
        values = driver.streaming_call(&request.method, args) => values,
    }
}

async fn open_stream(
    session: &Session,
    request: &StreamRequest,
    token: &CancellationToken,
) -> Result<ByteStream, CallError> {
    let driver = session.driver(&request.uuid)?;
    tokio::select! {
        _ = token.cancelled() => Err(CallError::cancelled()),
        stream = driver.stream(&request.method, request.metadata.clone()) => stream,
    }
}

fn decode_args(args: &[u8]) -> Result<Vec<Value>, CallError> {
    if args.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_slice(args)
        .map_err(|e| CallError::invalid_argument(format!("arguments are not a JSON array: {}", e)))
}

fn encode_value(value: &Value) -> Result<Bytes, CallError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| CallError::driver(format!("result not serializable: {}", e)))
}

async fn write_loop<T>(
    mut sink: SplitSink<Framed<T, FrameCodec>, Frame>,
    mut frames: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
) where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
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
    cancel.cancel();
}
