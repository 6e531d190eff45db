//! Protocol error types

use thiserror::Error;

use crate::message::MessageType;

/// Failure to frame or unframe a message
///
/// Any of these leaves the connection unusable.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Unknown message type: {0:#04x}")]
    UnknownMessageType(u8),

    #[error("Payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Header message type disagrees with the decoded payload
    #[error("Message type mismatch: header says {header:?}, payload is {payload:?}")]
    TypeMismatch {
        header: MessageType,
        payload: MessageType,
    },

    #[error("Malformed payload: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
