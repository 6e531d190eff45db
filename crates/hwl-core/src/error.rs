//! Core error types for hwlink

use hwl_protocol::{ErrorCode, ProtocolError};
use std::path::PathBuf;
use thiserror::Error;

/// Coarse classification shared by every error in the workspace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed tree, bad alias, bad external target
    Config,
    /// Type resolution refused by policy
    Permission,
    /// Refused, reset or closed connection
    Transport,
    /// A bounded wait expired
    Timeout,
    /// Normal termination requested by the owner
    Cancelled,
    /// Failure reported by a driver
    Driver,
    /// Unknown instance or method
    NotFound,
    /// Malformed frames or messages
    Protocol,
}

impl ErrorKind {
    /// Wire code used when this kind crosses a connection
    pub fn code(&self) -> ErrorCode {
        match self {
            ErrorKind::Config => ErrorCode::Config,
            ErrorKind::Permission => ErrorCode::Permission,
            ErrorKind::Transport => ErrorCode::Transport,
            ErrorKind::Timeout => ErrorCode::Timeout,
            ErrorKind::Cancelled => ErrorCode::Cancelled,
            ErrorKind::Driver => ErrorCode::Driver,
            ErrorKind::NotFound => ErrorCode::NotFound,
            ErrorKind::Protocol => ErrorCode::InvalidMessage,
        }
    }

    /// Kind of a wire code
    pub fn from_code(code: ErrorCode) -> Self {
        match code {
            ErrorCode::Config => ErrorKind::Config,
            ErrorCode::Permission => ErrorKind::Permission,
            ErrorCode::Transport => ErrorKind::Transport,
            ErrorCode::Timeout => ErrorKind::Timeout,
            ErrorCode::Cancelled => ErrorKind::Cancelled,
            ErrorCode::NotFound | ErrorCode::MethodNotFound => ErrorKind::NotFound,
            ErrorCode::InvalidMessage => ErrorKind::Protocol,
            ErrorCode::Driver | ErrorCode::InvalidArgument | ErrorCode::Unknown => {
                ErrorKind::Driver
            }
        }
    }
}

/// Top-level error type for the hwlink ecosystem
#[derive(Error, Debug)]
pub enum HwlError {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Stream error
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    /// Tree build error
    #[error("Tree build error: {0}")]
    Build(#[from] BuildError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Remote call error
    #[error("Call failed: {0}")]
    Call(#[from] CallError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HwlError {
    /// Classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            HwlError::Protocol(_) => ErrorKind::Protocol,
            HwlError::Connection(e) => e.kind(),
            HwlError::Stream(e) => e.kind(),
            HwlError::Build(_) | HwlError::Config(_) => ErrorKind::Config,
            HwlError::Call(e) => e.kind(),
            HwlError::Io(_) => ErrorKind::Transport,
        }
    }
}

/// Connection-related errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Connection refused or unreachable
    #[error("Connection to {address} refused: {source}")]
    Refused {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Connect or handshake did not finish in time
    #[error("Connection to {address} timed out")]
    Timeout { address: String },

    /// TLS setup or handshake failed
    #[error("TLS error with {address}: {reason}")]
    Tls { address: String, reason: String },

    /// Peer rejected the protocol handshake
    #[error("Handshake with {address} rejected: {reason}")]
    Handshake { address: String, reason: String },

    /// Connection lost
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Unparseable endpoint
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// All retries exhausted
    #[error("Gave up connecting to {address} after {attempts} attempts")]
    RetriesExhausted { address: String, attempts: u32 },

    /// Frame level failure
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl ConnectionError {
    /// Classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConnectionError::Timeout { .. } => ErrorKind::Timeout,
            ConnectionError::InvalidAddress(_) => ErrorKind::Config,
            ConnectionError::Protocol(_) | ConnectionError::Handshake { .. } => ErrorKind::Protocol,
            _ => ErrorKind::Transport,
        }
    }
}

/// Errors on a single byte stream
#[derive(Error, Debug)]
pub enum StreamError {
    /// The other end went away without an error
    #[error("Stream closed")]
    Closed,

    /// The owner cancelled the stream
    #[error("Stream cancelled")]
    Cancelled,

    /// Underlying connection failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// The remote side refused or aborted the stream
    #[error("{code}: {message}")]
    Remote { code: ErrorCode, message: String },

    /// I/O error on a local socket
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StreamError {
    /// Classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            StreamError::Closed | StreamError::Transport(_) | StreamError::Io(_) => {
                ErrorKind::Transport
            }
            StreamError::Cancelled => ErrorKind::Cancelled,
            StreamError::Remote { code, .. } => ErrorKind::from_code(*code),
        }
    }

    /// Whether this error is an ordinary end of stream rather than a failure
    pub fn is_termination(&self) -> bool {
        match self {
            StreamError::Closed | StreamError::Cancelled => true,
            StreamError::Remote { code, .. } => *code == ErrorCode::Cancelled,
            _ => false,
        }
    }
}

/// Errors raised while turning reports into a tree
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// Nothing to build
    #[error("No reports to build a tree from")]
    NoReports,

    /// Two reports share an id
    #[error("Duplicate instance id: {0}")]
    DuplicateId(String),

    /// A parent id names no report in the list
    #[error("Instance {uuid} references missing parent {parent}")]
    UnresolvedParent { uuid: String, parent: String },

    /// Two siblings share a name
    #[error("Duplicate child name '{name}' under {parent}")]
    DuplicateName { parent: String, name: String },

    /// A child report has no name label
    #[error("Instance {0} has no name label")]
    MissingName(String),

    /// Parent links loop
    #[error("Cycle detected among instances: {}", .0.join(", "))]
    Cycle(Vec<String>),

    /// More than one report without a parent
    #[error("Multiple root instances: {}", .0.join(", "))]
    MultipleRoots(Vec<String>),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Structured failure of a remote or local driver operation
///
/// This is the shape errors take on the wire; forwarding layers pass it
/// through untouched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct CallError {
    /// Wire error code
    pub code: ErrorCode,
    /// Human-readable message naming the offending identifier
    pub message: String,
}

impl CallError {
    /// Create a new call error
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(uuid: &str) -> Self {
        Self::new(ErrorCode::NotFound, format!("no driver instance {}", uuid))
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            ErrorCode::MethodNotFound,
            format!("method '{}' not exported", method),
        )
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }

    pub fn driver(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Driver, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Config, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Transport, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorCode::Cancelled, "operation cancelled")
    }

    /// Classification of this error
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::from_code(self.code)
    }
}

impl From<StreamError> for CallError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Remote { code, message } => CallError::new(code, message),
            StreamError::Cancelled => CallError::cancelled(),
            other => CallError::transport(other.to_string()),
        }
    }
}

impl From<ConnectionError> for CallError {
    fn from(err: ConnectionError) -> Self {
        CallError::new(err.kind().code(), err.to_string())
    }
}

impl From<BuildError> for CallError {
    fn from(err: BuildError) -> Self {
        CallError::config(err.to_string())
    }
}

impl From<ConfigError> for CallError {
    fn from(err: ConfigError) -> Self {
        CallError::config(err.to_string())
    }
}

impl From<serde_json::Error> for CallError {
    fn from(err: serde_json::Error) -> Self {
        CallError::invalid_argument(err.to_string())
    }
}

impl From<CallError> for StreamError {
    fn from(err: CallError) -> Self {
        StreamError::Remote {
            code: err.code,
            message: err.message,
        }
    }
}
