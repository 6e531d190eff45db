//! TCP network driver

use async_trait::async_trait;
use serde::Deserialize;
use tokio::net::TcpStream;

use hwl_client::network::CONNECT_METHOD;
use hwl_client::tunnel::PEER_ADDR_METADATA;
use hwl_client::NetworkClient;
use hwl_core::{ByteStream, CallError, ConfigError};

use crate::driver::{Driver, DriverBase};

/// Settings of a [`TcpNetwork`]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TcpNetworkConfig {
    pub host: String,
    pub port: u16,
}

/// Exposes one TCP service as a `connect` byte stream
#[derive(Debug)]
pub struct TcpNetwork {
    base: DriverBase,
    config: TcpNetworkConfig,
}

impl TcpNetwork {
    pub const TYPE_NAME: &'static str = "hwl_exporter.drivers.network.TcpNetwork";

    pub fn new(base: DriverBase, config: TcpNetworkConfig) -> Self {
        Self { base, config }
    }

    /// Build from the driver's `config` table
    pub fn from_config(
        base: DriverBase,
        config: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self, ConfigError> {
        let config: TcpNetworkConfig =
            serde_json::from_value(serde_json::Value::Object(config.clone()))
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(Self::new(base, config))
    }

    fn address(&self) -> String {
        if self.config.host.contains(':') {
            format!("[{}]:{}", self.config.host, self.config.port)
        } else {
            format!("{}:{}", self.config.host, self.config.port)
        }
    }
}

#[async_trait]
impl Driver for TcpNetwork {
    fn base(&self) -> &DriverBase {
        &self.base
    }

    fn client(&self) -> &str {
        NetworkClient::TYPE_NAME
    }

    async fn stream(
        &self,
        method: &str,
        metadata: Vec<(String, String)>,
    ) -> Result<ByteStream, CallError> {
        if method != CONNECT_METHOD {
            return Err(CallError::method_not_found(method));
        }

        let address = self.address();
        let peer = metadata
            .iter()
            .find(|(key, _)| key == PEER_ADDR_METADATA)
            .map(|(_, value)| value.as_str())
            .unwrap_or("unknown");

        let socket = TcpStream::connect(&address).await.map_err(|e| {
            CallError::transport(format!("failed to connect to {}: {}", address, e))
        })?;
        socket.set_nodelay(true).ok();

        tracing::debug!("Connected {} to {} for peer {}", self.base.uuid(), address, peer);
        Ok(ByteStream::from_io(socket))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_config_requires_port() {
        let mut config = serde_json::Map::new();
        config.insert("host".to_string(), serde_json::json!("127.0.0.1"));
        assert!(TcpNetwork::from_config(DriverBase::new(), &config).is_err());

        config.insert("port".to_string(), serde_json::json!(2222));
        let driver = TcpNetwork::from_config(DriverBase::new(), &config).unwrap();
        assert_eq!(driver.address(), "127.0.0.1:2222");
    }

    #[tokio::test]
    async fn test_connect_reaches_service() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let driver = TcpNetwork::new(
            DriverBase::new(),
            TcpNetworkConfig {
                host: "127.0.0.1".to_string(),
                port,
            },
        );
        let mut stream = driver.stream(CONNECT_METHOD, vec![]).await.unwrap();
        stream.send(Bytes::from_static(b"hello")).await.unwrap();
        let mut echoed = Vec::new();
        while echoed.len() < 5 {
            let chunk = stream.receive().await.unwrap().unwrap();
            echoed.extend_from_slice(&chunk);
        }
        assert_eq!(echoed, b"hello");

        let err = driver.stream("listen", vec![]).await.unwrap_err();
        assert_eq!(err.code, hwl_protocol::ErrorCode::MethodNotFound);
    }
}
