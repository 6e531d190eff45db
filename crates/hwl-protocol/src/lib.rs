//! hwl-protocol: Wire protocol for hwlink driver RPC multiplexing
//!
//! This crate defines the binary protocol spoken between hwlink clients
//! and exporters. A single connection carries many logical streams, each
//! one an RPC call, a streaming call, or a raw byte tunnel.

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod report;
pub mod stream;

pub use codec::{Frame, FrameCodec};
pub use error::ProtocolError;
pub use frame::{FrameHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use message::{ErrorCode, Message, MessageType, PROTOCOL_VERSION};
pub use report::{AlternativeEndpoint, InstanceReport, CLIENT_LABEL, NAME_LABEL};
pub use stream::StreamId;
