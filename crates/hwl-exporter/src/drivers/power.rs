//! Simulated power switch

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};

use hwl_client::PowerClient;
use hwl_core::CallError;

use crate::driver::{Driver, DriverBase, ValueStream};

/// Power switch that only remembers its state
///
/// `read` yields two fixed samples: one with the output off and one at
/// 5 V / 2 A.
#[derive(Debug)]
pub struct MockPower {
    base: DriverBase,
    on: AtomicBool,
}

impl MockPower {
    pub const TYPE_NAME: &'static str = "hwl_exporter.drivers.power.MockPower";

    pub fn new(base: DriverBase) -> Self {
        Self {
            base,
            on: AtomicBool::new(false),
        }
    }

    pub fn is_on(&self) -> bool {
        self.on.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Driver for MockPower {
    fn base(&self) -> &DriverBase {
        &self.base
    }

    fn client(&self) -> &str {
        PowerClient::TYPE_NAME
    }

    async fn call(&self, method: &str, _args: Vec<Value>) -> Result<Value, CallError> {
        match method {
            "on" => {
                tracing::info!("Power on ({})", self.base.uuid());
                self.on.store(true, Ordering::SeqCst);
                Ok(Value::Null)
            }
            "off" => {
                tracing::info!("Power off ({})", self.base.uuid());
                self.on.store(false, Ordering::SeqCst);
                Ok(Value::Null)
            }
            _ => Err(CallError::method_not_found(method)),
        }
    }

    async fn streaming_call(
        &self,
        method: &str,
        _args: Vec<Value>,
    ) -> Result<ValueStream, CallError> {
        match method {
            "read" => {
                let samples = vec![
                    Ok(json!({ "voltage": 0.0, "current": 0.0 })),
                    Ok(json!({ "voltage": 5.0, "current": 2.0 })),
                ];
                Ok(futures::stream::iter(samples).boxed())
            }
            _ => Err(CallError::method_not_found(method)),
        }
    }

    async fn reset(&self) {
        self.on.store(false, Ordering::SeqCst);
    }
}
