//! Client objects bound to remote driver instances

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use hwl_core::{ByteStream, CallError};
use hwl_protocol::{InstanceReport, CLIENT_LABEL, NAME_LABEL};

use crate::channel::{Channel, ValueStream};
use crate::ClientError;

/// A typed client for one remote driver instance
///
/// Implementations wrap a [`ClientBase`] and add driver specific methods on
/// top of its generic call primitives.
pub trait Client: Any + Send + Sync {
    /// Identity, labels, children and the shared channel
    fn base(&self) -> &ClientBase;

    /// Upcast for [`downcast`](trait.Client.html#method.downcast)
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// Release resources held by this node. Called once, parents first.
    fn close(&self) {}
}

impl dyn Client {
    /// Recover the concrete client type
    pub fn downcast<T: Client>(self: Arc<Self>) -> Option<Arc<T>> {
        self.into_any().downcast::<T>().ok()
    }
}

/// State shared by every client type
///
/// Nodes of a stub tree have no channel; their calls fail with a transport
/// error.
#[derive(Clone)]
pub struct ClientBase {
    uuid: String,
    labels: BTreeMap<String, String>,
    channel: Option<Channel>,
    children: BTreeMap<String, Arc<dyn Client>>,
    cancel: CancellationToken,
}

impl ClientBase {
    pub fn new(
        report: &InstanceReport,
        channel: Option<Channel>,
        children: BTreeMap<String, Arc<dyn Client>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            uuid: report.uuid.clone(),
            labels: report.labels.clone(),
            channel,
            children,
            cancel,
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    /// Name within the parent
    pub fn name(&self) -> Option<&str> {
        self.labels.get(NAME_LABEL).map(String::as_str)
    }

    /// Fully qualified client type this node was built as
    pub fn type_name(&self) -> Option<&str> {
        self.labels.get(CLIENT_LABEL).map(String::as_str)
    }

    /// Connection shared by the tree, `None` on a stub
    pub fn channel(&self) -> Option<&Channel> {
        self.channel.as_ref()
    }

    /// The channel, or the error a stub answers every call with
    pub fn connected(&self) -> Result<&Channel, CallError> {
        self.channel.as_ref().ok_or_else(|| {
            CallError::transport(format!(
                "{} is a stub without a connection",
                self.name().unwrap_or(&self.uuid)
            ))
        })
    }

    pub fn children(&self) -> &BTreeMap<String, Arc<dyn Client>> {
        &self.children
    }

    pub fn child(&self, name: &str) -> Option<&Arc<dyn Client>> {
        self.children.get(name)
    }

    /// Child `name` as a concrete client type
    pub fn child_as<T: Client>(&self, name: &str) -> Option<Arc<T>> {
        self.children.get(name).cloned()?.downcast::<T>()
    }

    /// Token cancelled when the owning scope closes
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Unary call on this instance
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, CallError> {
        let channel = self.connected()?;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(CallError::cancelled()),
            result = channel.driver_call(&self.uuid, method, args) => result,
        }
    }

    /// Unary call decoding the result into `T`
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> Result<T, CallError> {
        let value = self.call(method, args).await?;
        serde_json::from_value(value).map_err(|e| {
            CallError::invalid_argument(format!("unexpected result of {}: {}", method, e))
        })
    }

    /// Server-streaming call on this instance
    ///
    /// Closing the owning scope cancels the call on the exporter and ends
    /// the returned stream.
    pub async fn streaming_call(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> Result<ValueStream, CallError> {
        let channel = self.connected()?;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(CallError::cancelled()),
            result = channel.streaming_driver_call_until(&self.uuid, method, args, &self.cancel) => result,
        }
    }

    /// Raw byte stream to this instance
    ///
    /// Closing the owning scope stops the exporter's end; afterwards both
    /// halves fail with `StreamError::Cancelled`.
    pub async fn stream(
        &self,
        method: &str,
        metadata: Vec<(String, String)>,
    ) -> Result<ByteStream, CallError> {
        let channel = self.connected()?;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(CallError::cancelled()),
            result = channel.open_stream_until(&self.uuid, method, metadata, &self.cancel) => result,
        }
    }
}

/// Generic client exposing only the call primitives
pub struct DriverClient {
    base: ClientBase,
}

impl DriverClient {
    pub const TYPE_NAME: &'static str = "hwl_client.client.DriverClient";

    pub fn construct(base: ClientBase) -> Result<Arc<dyn Client>, ClientError> {
        Ok(Arc::new(Self { base }))
    }
}

impl Client for DriverClient {
    fn base(&self) -> &ClientBase {
        &self.base
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
