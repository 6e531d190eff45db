//! Client error types

use hwl_core::{BuildError, CallError, ConfigError, ConnectionError, ErrorKind};
use thiserror::Error;

use crate::resolver::ResolveError;

/// Errors while connecting to an exporter and building its client tree
#[derive(Error, Debug)]
pub enum ClientError {
    /// Could not reach the exporter
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// A remote request failed
    #[error("Call failed: {0}")]
    Call(#[from] CallError),

    /// A client type could not be resolved
    #[error("Type resolution failed: {0}")]
    Resolve(#[from] ResolveError),

    /// The report list does not form a tree
    #[error("Invalid report tree: {0}")]
    Build(#[from] BuildError),

    /// A client constructor refused the instance
    #[error("Failed to construct {type_name} for {uuid}: {reason}")]
    Construct {
        type_name: String,
        uuid: String,
        reason: String,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ClientError {
    /// Classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Connection(e) => e.kind(),
            ClientError::Call(e) => e.kind(),
            ClientError::Resolve(e) => e.kind(),
            ClientError::Build(_) | ClientError::Construct { .. } | ClientError::Config(_) => {
                ErrorKind::Config
            }
        }
    }
}
