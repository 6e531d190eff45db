//! Byte streams carried as logical streams of one framed connection
//!
//! Payload frames (`Data` and `StreamingItem`) are flow controlled per
//! stream. A sender starts with [`STREAM_WINDOW`] credits and spends one per
//! frame; the receiver hands credits back with `WindowUpdate` as its owner
//! consumes frames. A well behaved peer therefore never has more than the
//! window queued on a route, and the connection reader can route without
//! ever waiting on a slow stream. A route that overflows anyway is failed on
//! its own, see [`deliver`].

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use hwl_protocol::{Frame, Message, StreamId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Semaphore;

use crate::error::StreamError;
use crate::traits::{StreamReceiver, StreamSender};

/// Payload frames a sender may have outstanding on one stream
pub const STREAM_WINDOW: u32 = 64;

/// Largest `Data` payload put in a single frame
///
/// Well below the frame limit so the encoded message always fits.
pub const MAX_DATA_CHUNK: usize = 64 * 1024;

/// Room for control messages (close, error, cancel) on top of the window
const CONTROL_SLOTS: usize = 8;

/// Per-connection map from stream id to the route feeding that stream
pub type RouteTable = Arc<DashMap<StreamId, Route>>;

/// One registered stream: its inbound queue and the send credits the peer
/// granted for it
#[derive(Clone)]
pub struct Route {
    inbound: mpsc::Sender<Message>,
    credits: Arc<Semaphore>,
    overrun: Arc<AtomicBool>,
}

impl Route {
    fn fail(&self, overrun: bool) {
        if overrun {
            self.overrun.store(true, Ordering::Release);
        }
        self.credits.close();
    }
}

/// What became of an inbound message handed to [`deliver`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued for the stream, or applied as a window grant
    Delivered,
    /// No stream is registered under the id
    Unrouted,
    /// The stream's queue was full; the route has been removed and the
    /// stream fails locally. The peer should be told.
    Overrun,
    /// The stream's owner is gone; the route has been removed
    Gone,
}

/// Route `message` to the stream registered for `stream_id` without waiting
///
/// `WindowUpdate` grants go to the stream's send credits; everything else is
/// queued for its receiver.
pub fn deliver(routes: &RouteTable, stream_id: StreamId, message: Message) -> Delivery {
    let Some(route) = routes.get(&stream_id).map(|r| r.value().clone()) else {
        return Delivery::Unrouted;
    };

    if let Message::WindowUpdate { credits } = message {
        let room = (STREAM_WINDOW as usize).saturating_sub(route.credits.available_permits());
        route.credits.add_permits((credits as usize).min(room));
        return Delivery::Delivered;
    }

    match route.inbound.try_send(message) {
        Ok(()) => Delivery::Delivered,
        Err(TrySendError::Full(_)) => {
            tracing::warn!("Receive window overrun on {}, failing the stream", stream_id);
            routes.remove(&stream_id);
            route.fail(true);
            Delivery::Overrun
        }
        Err(TrySendError::Closed(_)) => {
            routes.remove(&stream_id);
            route.fail(false);
            Delivery::Gone
        }
    }
}

/// Drop every route of a connection that went away
///
/// Receivers see the connection closed and blocked senders wake up.
pub fn close_routes(routes: &RouteTable) {
    for route in routes.iter() {
        route.value().fail(false);
    }
    routes.clear();
}

fn carries_payload(message: &Message) -> bool {
    matches!(message, Message::Data(_) | Message::StreamingItem { .. })
}

/// Write half of a logical stream: wraps payloads as `Data` frames
pub struct MuxSender {
    stream_id: StreamId,
    frames: mpsc::Sender<Frame>,
    credits: Arc<Semaphore>,
    closed: bool,
}

impl MuxSender {
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Queue a stream message, first taking a window credit if it carries
    /// payload
    pub async fn send_message(&mut self, message: Message) -> Result<(), StreamError> {
        if carries_payload(&message) {
            let permit = self
                .credits
                .acquire()
                .await
                .map_err(|_| StreamError::Transport(format!("{} is no longer routed", self.stream_id)))?;
            permit.forget();
        }
        self.frames
            .send(Frame::new(self.stream_id, message))
            .await
            .map_err(|_| StreamError::Transport("connection closed".to_string()))
    }
}

#[async_trait]
impl StreamSender for MuxSender {
    async fn send(&mut self, mut data: Bytes) -> Result<(), StreamError> {
        if self.closed {
            return Err(StreamError::Closed);
        }
        while data.len() > MAX_DATA_CHUNK {
            let chunk = data.split_to(MAX_DATA_CHUNK);
            self.send_message(Message::Data(chunk)).await?;
        }
        self.send_message(Message::Data(data)).await
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.send_message(Message::StreamClose).await
    }
}

/// Read half of a logical stream
///
/// Registered in the connection's route table for as long as it lives; the
/// route is removed on drop so late frames for the id are discarded.
pub struct MuxReceiver {
    stream_id: StreamId,
    inbound: mpsc::Receiver<Message>,
    routes: RouteTable,
    frames: mpsc::Sender<Frame>,
    credits: Arc<Semaphore>,
    overrun: Arc<AtomicBool>,
    consumed: u32,
    finished: bool,
}

impl MuxReceiver {
    /// Register a route for `stream_id` and return its receiving end
    ///
    /// `frames` is the connection's outbound queue, used for window grants
    /// and by [`sender`](Self::sender).
    pub fn register(stream_id: StreamId, routes: &RouteTable, frames: mpsc::Sender<Frame>) -> Self {
        let (tx, inbound) = mpsc::channel(STREAM_WINDOW as usize + CONTROL_SLOTS);
        let route = Route {
            inbound: tx,
            credits: Arc::new(Semaphore::new(STREAM_WINDOW as usize)),
            overrun: Arc::new(AtomicBool::new(false)),
        };
        let credits = Arc::clone(&route.credits);
        let overrun = Arc::clone(&route.overrun);
        routes.insert(stream_id, route);

        Self {
            stream_id,
            inbound,
            routes: Arc::clone(routes),
            frames,
            credits,
            overrun,
            consumed: 0,
            finished: false,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Write half of the same stream, spending the credits the peer grants
    /// to this route
    pub fn sender(&self) -> MuxSender {
        MuxSender {
            stream_id: self.stream_id,
            frames: self.frames.clone(),
            credits: Arc::clone(&self.credits),
            closed: false,
        }
    }

    /// Whether the route was dropped because the peer overran the window
    pub fn overrun(&self) -> bool {
        self.overrun.load(Ordering::Acquire)
    }

    /// Next raw message on this stream, `None` once the route is gone
    pub async fn recv_message(&mut self) -> Option<Message> {
        self.grant().await;
        let message = self.inbound.recv().await;
        if message.as_ref().is_some_and(carries_payload) {
            self.consumed += 1;
        }
        message
    }

    /// Return consumed credits to the peer once half the window is used up
    async fn grant(&mut self) {
        if self.consumed < STREAM_WINDOW / 2 {
            return;
        }
        let update = Frame::new(
            self.stream_id,
            Message::WindowUpdate {
                credits: self.consumed,
            },
        );
        if self.frames.send(update).await.is_ok() {
            self.consumed = 0;
        }
    }

    fn gone(&self) -> StreamError {
        if self.overrun() {
            StreamError::Transport(format!("{} overran its receive window", self.stream_id))
        } else {
            StreamError::Transport("connection closed".to_string())
        }
    }
}

#[async_trait]
impl StreamReceiver for MuxReceiver {
    async fn receive(&mut self) -> Result<Option<Bytes>, StreamError> {
        if self.finished {
            return Ok(None);
        }
        loop {
            match self.recv_message().await {
                Some(Message::Data(data)) => return Ok(Some(data)),
                Some(Message::StreamClose) => {
                    self.finished = true;
                    return Ok(None);
                }
                Some(Message::Error { code, message }) => {
                    self.finished = true;
                    return Err(StreamError::Remote { code, message });
                }
                Some(Message::Cancel) => {
                    self.finished = true;
                    return Err(StreamError::Cancelled);
                }
                Some(other) => {
                    tracing::debug!(
                        "Ignoring {:?} on byte {}",
                        other.message_type(),
                        self.stream_id
                    );
                }
                None => {
                    self.finished = true;
                    return Err(self.gone());
                }
            }
        }
    }
}

impl Drop for MuxReceiver {
    fn drop(&mut self) {
        self.routes.remove(&self.stream_id);
        self.credits.close();
    }
}
