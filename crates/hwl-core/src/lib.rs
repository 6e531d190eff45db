//! hwl-core: Core abstractions for hwlink
//!
//! Shared error types, configuration, the report tree builder and the byte
//! stream plumbing (relay and multiplexed streams) used by both the client
//! and the exporter.

pub mod config;
pub mod error;
pub mod stream;
pub mod time;
pub mod traits;
pub mod tree;
pub mod types;

pub use error::{
    BuildError, CallError, ConfigError, ConnectionError, ErrorKind, HwlError, StreamError,
};
pub use stream::{relay, ByteStream, RelayStats};
pub use types::{Address, HostPort};
