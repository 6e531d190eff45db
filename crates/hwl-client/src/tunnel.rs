//! Local port forwarding through a driver's byte stream
//!
//! Every accepted local connection gets its own remote stream and its own
//! relay. A failing connection only tears down its own pair.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use tokio::net::{TcpListener, UnixListener};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use hwl_core::{relay, ByteStream, CallError};

use crate::channel::Channel;

/// Metadata key carrying the local peer address of a forwarded connection
pub const PEER_ADDR_METADATA: &str = "peer_addr";

/// Where new remote streams are opened
#[derive(Debug, Clone)]
pub struct StreamTarget {
    channel: Channel,
    uuid: String,
    method: String,
}

impl StreamTarget {
    pub fn new(channel: Channel, uuid: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            channel,
            uuid: uuid.into(),
            method: method.into(),
        }
    }

    /// Open one remote stream that is torn down once `cancel` fires
    pub async fn open(
        &self,
        metadata: Vec<(String, String)>,
        cancel: &CancellationToken,
    ) -> Result<ByteStream, CallError> {
        self.channel
            .open_stream_until(&self.uuid, &self.method, metadata, cancel)
            .await
    }
}

/// Local address a forward listens on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardAddr {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

/// A running port forward; stops when closed or dropped
pub struct PortForward {
    local: ForwardAddr,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PortForward {
    /// Listen on a TCP address
    pub async fn tcp(
        local: SocketAddr,
        target: StreamTarget,
        cancel: CancellationToken,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(local).await?;
        let bound = listener.local_addr()?;
        tracing::info!("Forwarding {} to {}", bound, target.uuid);

        let token = cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((socket, peer)) => {
                        socket.set_nodelay(true).ok();
                        spawn_pair(ByteStream::from_io(socket), peer.to_string(), &target, &token);
                    }
                    Err(e) => {
                        tracing::error!("Failed to accept forwarded connection: {}", e);
                    }
                }
            }
            tracing::debug!("Port forward on {} stopped", bound);
        });

        Ok(Self {
            local: ForwardAddr::Tcp(bound),
            cancel,
            task: Some(task),
        })
    }

    /// Listen on a unix socket path; the file is removed when the forward stops
    pub fn unix(
        path: &Path,
        target: StreamTarget,
        cancel: CancellationToken,
    ) -> std::io::Result<Self> {
        let listener = UnixListener::bind(path)?;
        let owned = path.to_path_buf();
        tracing::info!("Forwarding {} to {}", owned.display(), target.uuid);

        let token = cancel.clone();
        let socket_path = owned.clone();
        let task = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((socket, _)) => {
                        let peer = socket_path.display().to_string();
                        spawn_pair(ByteStream::from_io(socket), peer, &target, &token);
                    }
                    Err(e) => {
                        tracing::error!("Failed to accept forwarded connection: {}", e);
                    }
                }
            }
            if let Err(e) = std::fs::remove_file(&socket_path) {
                tracing::debug!("Could not remove {}: {}", socket_path.display(), e);
            }
        });

        Ok(Self {
            local: ForwardAddr::Unix(owned),
            cancel,
            task: Some(task),
        })
    }

    /// Address the forward listens on
    pub fn local(&self) -> &ForwardAddr {
        &self.local
    }

    /// Bound TCP address, if this is a TCP forward
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.local {
            ForwardAddr::Tcp(addr) => Some(addr),
            ForwardAddr::Unix(_) => None,
        }
    }

    /// Stop accepting and tear down every forwarded connection
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for PortForward {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn spawn_pair(local: ByteStream, peer: String, target: &StreamTarget, cancel: &CancellationToken) {
    let target = target.clone();
    let token = cancel.child_token();
    tokio::spawn(async move {
        let metadata = vec![(PEER_ADDR_METADATA.to_string(), peer.clone())];
        let remote = match target.open(metadata, &token).await {
            Ok(remote) => remote,
            Err(e) => {
                tracing::warn!("Remote refused connection from {}: {}", peer, e);
                return;
            }
        };
        match relay(local, remote, token).await {
            Ok(stats) => tracing::debug!(
                "Forwarded connection from {} closed ({} bytes out, {} bytes in)",
                peer,
                stats.a_to_b,
                stats.b_to_a
            ),
            Err(e) => tracing::warn!("Forwarded connection from {} failed: {}", peer, e),
        }
    });
}
