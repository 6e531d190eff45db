//! Exporter error types

use hwl_core::{CallError, ConfigError, ConnectionError, ErrorKind};
use hwl_protocol::ProtocolError;
use thiserror::Error;

/// Errors raised while building, enumerating or serving a driver tree
#[derive(Error, Debug)]
pub enum ExportError {
    /// No driver is registered under the configured type name
    #[error("Unknown driver type '{type_name}' for {name}")]
    UnknownDriver { name: String, type_name: String },

    /// A driver rejected its settings
    #[error("Invalid configuration for driver {name}: {reason}")]
    InvalidDriverConfig { name: String, reason: String },

    /// An external subtree could not be reached at construction time
    #[error("Failed to mount external exporter {target} for {name}: {source}")]
    Mount {
        name: String,
        target: String,
        #[source]
        source: ConnectionError,
    },

    /// Enumerating the tree failed (bad alias, unreachable external report)
    #[error("Enumeration failed: {0}")]
    Enumerate(CallError),

    /// Two instances of the exported tree share an id
    #[error("Duplicate instance id {0} in exported tree")]
    DuplicateId(String),

    /// Listen address could not be bound
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Peer did not complete the protocol handshake
    #[error("Handshake with {peer} failed: {reason}")]
    Handshake { peer: String, reason: String },

    /// Alternative endpoint provisioning failed
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Frame level failure on a served connection
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExportError {
    /// Classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExportError::UnknownDriver { .. }
            | ExportError::InvalidDriverConfig { .. }
            | ExportError::Mount { .. }
            | ExportError::DuplicateId(_)
            | ExportError::Config(_)
            | ExportError::Tls(_) => ErrorKind::Config,
            ExportError::Enumerate(e) => e.kind(),
            ExportError::Handshake { .. } | ExportError::Protocol(_) => ErrorKind::Protocol,
            ExportError::Bind { .. } | ExportError::Io(_) => ErrorKind::Transport,
        }
    }
}

/// Errors from alternative endpoint credential provisioning
#[derive(Error, Debug)]
pub enum TlsError {
    /// Endpoint is not `host:port`
    #[error("Invalid endpoint '{0}'")]
    InvalidEndpoint(String),

    /// A host cannot be encoded as a DNS subject alternative name
    #[error("Invalid DNS name '{host}': {reason}")]
    InvalidDnsName { host: String, reason: String },

    /// Key pair generation failed
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    /// Certificate could not be built or parsed back
    #[error("Certificate generation failed: {0}")]
    Certificate(String),

    /// rustls rejected the generated material
    #[error("TLS configuration failed: {0}")]
    Config(String),
}
