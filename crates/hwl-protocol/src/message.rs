//! Message types for the hwlink protocol
//!
//! This module defines the high-level protocol messages exchanged between
//! clients and exporters. Messages are serialized into frames using the
//! codec defined in `codec.rs`.
//!
//! # Message Flow
//!
//! 1. Client connects and sends `Hello` on the control stream
//! 2. Exporter responds with `HelloAck`
//! 3. Each request opens a fresh stream id chosen by the client:
//!    - `GetReport` answered by `Report`
//!    - `DriverCall` answered by `DriverCallResult` or `Error`
//!    - `StreamingDriverCall` answered by zero or more `StreamingItem`
//!      followed by `StreamingEnd` or `Error`
//!    - `StreamOpen` answered by `StreamReady` or `Error`, after which
//!      `Data` flows in both directions until either side sends `StreamClose`
//! 4. `Cancel` from the client aborts whatever runs on that stream id
//!
//! Argument and result values are JSON documents carried as opaque bytes,
//! so drivers can exchange arbitrary structured values without the frame
//! format knowing their shape.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::report::{AlternativeEndpoint, InstanceReport};

/// Current protocol version string.
///
/// Format: "MAJOR.MINOR" where MAJOR changes indicate breaking changes.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Message type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Connection greeting (client -> exporter)
    Hello = 0x01,
    /// Greeting acknowledgment
    HelloAck = 0x02,
    /// Request for the exporter's instance reports
    GetReport = 0x03,
    /// Instance reports
    Report = 0x04,
    /// Unary driver call
    DriverCall = 0x05,
    /// Unary driver call result
    DriverCallResult = 0x06,
    /// Server-streaming driver call
    StreamingDriverCall = 0x07,
    /// One value of a streaming call
    StreamingItem = 0x08,
    /// End of a streaming call
    StreamingEnd = 0x09,
    /// Open a raw byte stream
    StreamOpen = 0x0A,
    /// Raw byte stream accepted
    StreamReady = 0x0B,
    /// Raw stream payload
    Data = 0x0C,
    /// Raw stream closed
    StreamClose = 0x0D,
    /// Abort the request running on a stream
    Cancel = 0x0E,
    /// Grant the peer more payload frames on a stream
    WindowUpdate = 0x0F,
    /// Heartbeat ping
    Heartbeat = 0x10,
    /// Heartbeat acknowledgment
    HeartbeatAck = 0x11,
    /// Error response
    Error = 0xFF,
}

impl MessageType {
    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Hello),
            0x02 => Some(Self::HelloAck),
            0x03 => Some(Self::GetReport),
            0x04 => Some(Self::Report),
            0x05 => Some(Self::DriverCall),
            0x06 => Some(Self::DriverCallResult),
            0x07 => Some(Self::StreamingDriverCall),
            0x08 => Some(Self::StreamingItem),
            0x09 => Some(Self::StreamingEnd),
            0x0A => Some(Self::StreamOpen),
            0x0B => Some(Self::StreamReady),
            0x0C => Some(Self::Data),
            0x0D => Some(Self::StreamClose),
            0x0E => Some(Self::Cancel),
            0x0F => Some(Self::WindowUpdate),
            0x10 => Some(Self::Heartbeat),
            0x11 => Some(Self::HeartbeatAck),
            0xFF => Some(Self::Error),
            _ => None,
        }
    }
}

/// Error codes for error messages
///
/// The code travels unchanged through any number of forwarding hops, so a
/// caller sees the same class whether the failure was local or remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    /// Unknown error
    Unknown = 0,
    /// Instance not found
    NotFound = 1,
    /// Driver does not export the requested method
    MethodNotFound = 2,
    /// Arguments could not be decoded
    InvalidArgument = 3,
    /// Malformed tree or driver configuration
    Config = 4,
    /// Operation not permitted by policy
    Permission = 5,
    /// Connection refused, reset or closed
    Transport = 6,
    /// Operation timed out
    Timeout = 7,
    /// Operation cancelled
    Cancelled = 8,
    /// Failure inside the driver
    Driver = 9,
    /// Invalid message
    InvalidMessage = 10,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::Unknown => "unknown",
            ErrorCode::NotFound => "not found",
            ErrorCode::MethodNotFound => "method not found",
            ErrorCode::InvalidArgument => "invalid argument",
            ErrorCode::Config => "configuration",
            ErrorCode::Permission => "permission denied",
            ErrorCode::Transport => "transport",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::Driver => "driver",
            ErrorCode::InvalidMessage => "invalid message",
        };
        f.write_str(name)
    }
}

/// Protocol messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Connection greeting
    Hello {
        /// Protocol version of the client
        version: String,
    },

    /// Greeting acknowledgment
    HelloAck {
        /// Whether the client's protocol version was accepted
        accepted: bool,
        /// Reason if not accepted
        reason: Option<String>,
    },

    /// Fetch the exporter's flat instance list
    GetReport,

    /// The exporter's flat instance list
    Report {
        /// One record per driver instance, in no particular order
        reports: Vec<InstanceReport>,
        /// Directly dialable TLS endpoints, if the exporter provisioned any
        alternative_endpoints: Vec<AlternativeEndpoint>,
    },

    /// Unary driver call
    DriverCall {
        /// Target instance
        uuid: String,
        /// Exported method name
        method: String,
        /// JSON-encoded argument array
        args: Bytes,
    },

    /// Unary driver call result
    DriverCallResult {
        /// JSON-encoded result value
        result: Bytes,
    },

    /// Server-streaming driver call
    StreamingDriverCall {
        /// Target instance
        uuid: String,
        /// Exported method name
        method: String,
        /// JSON-encoded argument array
        args: Bytes,
    },

    /// One value yielded by a streaming call
    StreamingItem {
        /// JSON-encoded value
        value: Bytes,
    },

    /// Streaming call finished normally
    StreamingEnd,

    /// Open a raw byte stream to a driver
    StreamOpen {
        /// Target instance
        uuid: String,
        /// Stream method (e.g. "connect")
        method: String,
        /// Request metadata delivered ahead of any payload
        metadata: Vec<(String, String)>,
    },

    /// Raw stream accepted, payload may follow
    StreamReady,

    /// Raw stream payload
    Data(Bytes),

    /// Raw stream closed by the sender
    StreamClose,

    /// Abort whatever runs on this stream
    Cancel,

    /// Flow control grant: the sender may queue `credits` more `Data` or
    /// `StreamingItem` frames on this stream
    WindowUpdate {
        credits: u32,
    },

    /// Heartbeat ping
    Heartbeat {
        /// Timestamp for latency measurement
        timestamp: u64,
    },

    /// Heartbeat acknowledgment
    HeartbeatAck {
        /// Echo of the original timestamp
        timestamp: u64,
    },

    /// Error response
    Error {
        /// Error code
        code: ErrorCode,
        /// Human-readable message
        message: String,
    },
}

impl Message {
    /// Get the message type for this message
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Hello { .. } => MessageType::Hello,
            Message::HelloAck { .. } => MessageType::HelloAck,
            Message::GetReport => MessageType::GetReport,
            Message::Report { .. } => MessageType::Report,
            Message::DriverCall { .. } => MessageType::DriverCall,
            Message::DriverCallResult { .. } => MessageType::DriverCallResult,
            Message::StreamingDriverCall { .. } => MessageType::StreamingDriverCall,
            Message::StreamingItem { .. } => MessageType::StreamingItem,
            Message::StreamingEnd => MessageType::StreamingEnd,
            Message::StreamOpen { .. } => MessageType::StreamOpen,
            Message::StreamReady => MessageType::StreamReady,
            Message::Data(_) => MessageType::Data,
            Message::StreamClose => MessageType::StreamClose,
            Message::Cancel => MessageType::Cancel,
            Message::WindowUpdate { .. } => MessageType::WindowUpdate,
            Message::Heartbeat { .. } => MessageType::Heartbeat,
            Message::HeartbeatAck { .. } => MessageType::HeartbeatAck,
            Message::Error { .. } => MessageType::Error,
        }
    }

    /// Build an error message
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Message::Error {
            code,
            message: message.into(),
        }
    }
}

/// Major component of a "MAJOR.MINOR" version string
pub fn major_version(version: &str) -> Option<u32> {
    version.split('.').next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_roundtrip() {
        for msg_type in [
            MessageType::Hello,
            MessageType::HelloAck,
            MessageType::GetReport,
            MessageType::Report,
            MessageType::DriverCall,
            MessageType::DriverCallResult,
            MessageType::StreamingDriverCall,
            MessageType::StreamingItem,
            MessageType::StreamingEnd,
            MessageType::StreamOpen,
            MessageType::StreamReady,
            MessageType::Data,
            MessageType::StreamClose,
            MessageType::Cancel,
            MessageType::WindowUpdate,
            MessageType::Heartbeat,
            MessageType::HeartbeatAck,
            MessageType::Error,
        ] {
            let byte = msg_type.as_u8();
            let recovered = MessageType::from_u8(byte).unwrap();
            assert_eq!(recovered, msg_type);
        }
    }

    #[test]
    fn test_major_version() {
        assert_eq!(major_version(PROTOCOL_VERSION), Some(1));
        assert_eq!(major_version("2.7"), Some(2));
        assert_eq!(major_version("garbage"), None);
    }

    #[test]
    fn test_error_code_display() {
        assert_eq!(ErrorCode::Permission.to_string(), "permission denied");
        assert_eq!(ErrorCode::Transport.to_string(), "transport");
    }
}
