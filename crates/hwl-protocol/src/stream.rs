//! Stream identifier type

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one logical stream multiplexed over a connection.
///
/// Every request (unary call, streaming call, raw tunnel) runs on its own
/// stream id, allocated by the side that opens it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(pub u32);

impl StreamId {
    /// Create a new stream ID
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Special stream ID for connection-level control messages
    pub const CONTROL: StreamId = StreamId(0);

    /// Whether this is the control stream
    pub fn is_control(&self) -> bool {
        *self == Self::CONTROL
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

impl From<u32> for StreamId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_id_display() {
        let id = StreamId::new(42);
        assert_eq!(format!("{}", id), "stream-42");
    }

    #[test]
    fn test_control_stream() {
        assert!(StreamId::CONTROL.is_control());
        assert!(!StreamId::new(7).is_control());
    }
}
