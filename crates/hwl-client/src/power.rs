//! Power control client

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use hwl_core::CallError;

use crate::client::{Client, ClientBase};
use crate::ClientError;

/// One sample from a power meter
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerReading {
    pub voltage: f64,
    pub current: f64,
}

impl PowerReading {
    pub fn apparent_power(&self) -> f64 {
        self.voltage * self.current
    }
}

/// Client for drivers exporting `on`, `off` and streaming `read`
pub struct PowerClient {
    base: ClientBase,
}

impl PowerClient {
    pub const TYPE_NAME: &'static str = "hwl_client.power.PowerClient";

    pub fn construct(base: ClientBase) -> Result<Arc<dyn Client>, ClientError> {
        Ok(Arc::new(Self { base }))
    }

    /// Power on
    pub async fn on(&self) -> Result<(), CallError> {
        self.base.call("on", vec![]).await.map(drop)
    }

    /// Power off
    pub async fn off(&self) -> Result<(), CallError> {
        self.base.call("off", vec![]).await.map(drop)
    }

    /// Power off, wait, power on
    pub async fn cycle(&self, wait: Duration) -> Result<(), CallError> {
        tracing::info!("Power cycling {} (wait {:?})", self.base.uuid(), wait);
        self.off().await?;
        tokio::time::sleep(wait).await;
        self.on().await
    }

    /// Stream of power readings
    pub async fn read(&self) -> Result<BoxStream<'static, Result<PowerReading, CallError>>, CallError> {
        let values = self.base.streaming_call("read", vec![]).await?;
        Ok(values
            .map(|value| {
                value.and_then(|v| {
                    serde_json::from_value(v).map_err(|e| {
                        CallError::invalid_argument(format!("malformed power reading: {}", e))
                    })
                })
            })
            .boxed())
    }
}

impl Client for PowerClient {
    fn base(&self) -> &ClientBase {
        &self.base
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reading_wire_shape() {
        let reading: PowerReading =
            serde_json::from_value(serde_json::json!({"voltage": 5.0, "current": 2.0})).unwrap();
        assert_eq!(reading.apparent_power(), 10.0);
    }
}
