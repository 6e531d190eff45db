//! Frame header layout
//!
//! Every frame starts with 8 bytes, all big-endian:
//!
//! ```text
//! +---------------------------+--------+---------------------+
//! | stream id (u32)           | type   | payload length (u24)|
//! +---------------------------+--------+---------------------+
//! ```
//!
//! The second word packs the message type into its top byte, so the length
//! field caps a payload at 16 MiB - 1.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtocolError;
use crate::message::MessageType;
use crate::stream::StreamId;

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 8;

/// Largest payload the 24-bit length field can describe
pub const MAX_PAYLOAD_SIZE: usize = 0x00FF_FFFF;

const LENGTH_MASK: u32 = MAX_PAYLOAD_SIZE as u32;

/// Routing and length information preceding a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub stream_id: StreamId,
    pub message_type: MessageType,
    pub payload_length: u32,
}

impl FrameHeader {
    pub fn new(stream_id: StreamId, message_type: MessageType, payload_length: u32) -> Self {
        Self {
            stream_id,
            message_type,
            payload_length,
        }
    }

    /// Header for a payload of `len` bytes, refusing lengths that do not fit
    pub fn for_payload(
        stream_id: StreamId,
        message_type: MessageType,
        len: usize,
    ) -> Result<Self, ProtocolError> {
        if len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: len,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(Self::new(stream_id, message_type, len as u32))
    }

    /// Wire representation
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let tagged = (u32::from(self.message_type.as_u8()) << 24) | (self.payload_length & LENGTH_MASK);
        let mut out = [0u8; HEADER_SIZE];
        out[..4].copy_from_slice(&self.stream_id.as_u32().to_be_bytes());
        out[4..].copy_from_slice(&tagged.to_be_bytes());
        out
    }

    /// Parse a wire header
    pub fn from_bytes(raw: [u8; HEADER_SIZE]) -> Result<Self, ProtocolError> {
        let mut buf = &raw[..];
        let stream_id = StreamId::new(buf.get_u32());
        let tagged = buf.get_u32();

        let tag = (tagged >> 24) as u8;
        let message_type =
            MessageType::from_u8(tag).ok_or(ProtocolError::UnknownMessageType(tag))?;

        Ok(Self::new(stream_id, message_type, tagged & LENGTH_MASK))
    }

    /// Append the header to `dst`
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_slice(&self.to_bytes());
    }

    /// Take a header off the front of `src`
    ///
    /// Leaves `src` untouched and returns `None` until a whole header is
    /// buffered. An unknown message type is an error and consumes nothing.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        let Some(raw) = src.get(..HEADER_SIZE) else {
            return Ok(None);
        };
        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(raw);

        let parsed = Self::from_bytes(header)?;
        src.advance(HEADER_SIZE);
        Ok(Some(parsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_layout() {
        let header = FrameHeader::new(StreamId::new(0x0102_0304), MessageType::Data, 0x00AB_CDEF);
        let bytes = header.to_bytes();

        assert_eq!(&bytes[..4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(bytes[4], MessageType::Data.as_u8());
        assert_eq!(&bytes[5..], &[0xAB, 0xCD, 0xEF]);
        assert_eq!(FrameHeader::from_bytes(bytes).unwrap(), header);
    }

    #[test]
    fn test_oversized_payload_refused() {
        assert!(FrameHeader::for_payload(
            StreamId::CONTROL,
            MessageType::Report,
            MAX_PAYLOAD_SIZE
        )
        .is_ok());
        assert!(matches!(
            FrameHeader::for_payload(StreamId::CONTROL, MessageType::Report, MAX_PAYLOAD_SIZE + 1),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_waits_for_whole_header() {
        let mut buf = BytesMut::from(&[0u8; 4][..]);
        assert!(FrameHeader::decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn test_unknown_message_type() {
        let mut buf = BytesMut::from(&[0, 0, 0, 1, 0xFE, 0, 0, 10][..]);
        assert!(matches!(
            FrameHeader::decode(&mut buf),
            Err(ProtocolError::UnknownMessageType(0xFE))
        ));
        assert_eq!(buf.len(), HEADER_SIZE);
    }
}
