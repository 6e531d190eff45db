//! Mount point for another exporter's driver tree
//!
//! An [`External`] connects to a second exporter when it is constructed and
//! keeps that connection for its whole life. When the local tree is
//! enumerated it fetches the remote report, rebuilds the remote tree as
//! [`ExternalStub`]s and reports that tree in its own place. Every call,
//! streaming call and byte stream on a stub is forwarded over the shared
//! connection, and the remote answer, including its error code and message,
//! is passed back unchanged.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use hwl_client::{Channel, ChannelOptions, DriverClient};
use hwl_core::{tree, ByteStream, CallError, ConnectionError};

use crate::driver::{Driver, DriverBase, EnumerateContext, Instance, ValueStream};

/// Driver whose subtree lives in another exporter
#[derive(Debug)]
pub struct External {
    base: DriverBase,
    target: String,
    channel: Channel,
}

impl External {
    /// Connect to `target`; failing to connect fails construction
    pub async fn mount(
        base: DriverBase,
        target: &str,
        options: ChannelOptions,
    ) -> Result<Self, ConnectionError> {
        let channel = Channel::connect(target, options).await?;
        tracing::info!("Mounted external exporter {}", target);
        Ok(Self {
            base,
            target: target.to_string(),
            channel,
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

#[async_trait]
impl Driver for External {
    fn base(&self) -> &DriverBase {
        &self.base
    }

    fn client(&self) -> &str {
        DriverClient::TYPE_NAME
    }

    async fn enumerate(
        &self,
        _this: Arc<dyn Driver>,
        ctx: &EnumerateContext,
        parent: Option<String>,
        name: Option<String>,
    ) -> Result<Vec<Instance>, CallError> {
        let report = self.channel.get_report().await?;
        tracing::debug!(
            "External exporter {} reported {} instances",
            self.target,
            report.reports.len()
        );

        let root: Arc<dyn Driver> = tree::build(&report.reports, |instance, children| {
            let stub = ExternalStub {
                base: DriverBase::with_uuid(instance.uuid.clone())
                    .with_labels(remote_labels(&instance.labels))
                    .with_children(children),
                client: instance.client().unwrap_or(DriverClient::TYPE_NAME).to_string(),
                channel: self.channel.clone(),
            };
            Ok::<_, CallError>(Arc::new(stub) as Arc<dyn Driver>)
        })?;

        root.enumerate(Arc::clone(&root), ctx, parent, name).await
    }

    async fn close(&self) {
        tracing::debug!("Closing connection to external exporter {}", self.target);
        self.channel.close();
    }
}

/// Local stand-in for one remote driver instance
#[derive(Debug)]
pub struct ExternalStub {
    base: DriverBase,
    client: String,
    channel: Channel,
}

#[async_trait]
impl Driver for ExternalStub {
    fn base(&self) -> &DriverBase {
        &self.base
    }

    fn client(&self) -> &str {
        &self.client
    }

    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, CallError> {
        self.channel
            .driver_call(self.base.uuid(), method, args)
            .await
    }

    async fn streaming_call(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> Result<ValueStream, CallError> {
        self.channel
            .streaming_driver_call(self.base.uuid(), method, args)
            .await
    }

    async fn stream(
        &self,
        method: &str,
        metadata: Vec<(String, String)>,
    ) -> Result<ByteStream, CallError> {
        self.channel
            .open_stream(self.base.uuid(), method, metadata)
            .await
    }

    async fn close(&self) {}

    async fn reset(&self) {}
}

/// Labels a stub reports, minus the ones the local tree assigns
fn remote_labels(labels: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    labels
        .iter()
        .filter(|(key, _)| key.as_str() != hwl_protocol::NAME_LABEL)
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}
