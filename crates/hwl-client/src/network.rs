//! Network tunnel client

use std::any::Any;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use hwl_core::{ByteStream, CallError};

use crate::client::{Client, ClientBase};
use crate::tunnel::{PortForward, StreamTarget};
use crate::ClientError;

/// Stream method network drivers export
pub const CONNECT_METHOD: &str = "connect";

/// Client for drivers that expose a byte stream to a network service
pub struct NetworkClient {
    base: ClientBase,
}

impl NetworkClient {
    pub const TYPE_NAME: &'static str = "hwl_client.network.NetworkClient";

    pub fn construct(base: ClientBase) -> Result<Arc<dyn Client>, ClientError> {
        Ok(Arc::new(Self { base }))
    }

    /// Open one connection through the driver
    pub async fn connect(&self) -> Result<ByteStream, CallError> {
        self.base.stream(CONNECT_METHOD, vec![]).await
    }

    fn target(&self) -> std::io::Result<StreamTarget> {
        let channel = self
            .base
            .connected()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::NotConnected, e.to_string()))?;
        Ok(StreamTarget::new(
            channel.clone(),
            self.base.uuid(),
            CONNECT_METHOD,
        ))
    }

    /// Forward a local TCP port through the driver
    ///
    /// Use port 0 to let the system pick one; see [`PortForward::local_addr`].
    pub async fn portforward_tcp(&self, local: SocketAddr) -> std::io::Result<PortForward> {
        PortForward::tcp(local, self.target()?, self.base.cancellation().child_token()).await
    }

    /// Forward a local unix socket through the driver
    pub fn portforward_unix(&self, path: &Path) -> std::io::Result<PortForward> {
        PortForward::unix(path, self.target()?, self.base.cancellation().child_token())
    }
}

impl Client for NetworkClient {
    fn base(&self) -> &ClientBase {
        &self.base
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
