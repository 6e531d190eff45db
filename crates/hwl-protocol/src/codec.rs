//! Tokio codec for framed protocol messages

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::frame::{FrameHeader, HEADER_SIZE};
use crate::message::Message;
use crate::stream::StreamId;

/// One message addressed to one logical stream
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub stream_id: StreamId,
    pub message: Message,
}

impl Frame {
    pub fn new(stream_id: StreamId, message: Message) -> Self {
        Self { stream_id, message }
    }
}

/// `tokio_util` codec turning a byte stream into [`Frame`]s and back
///
/// A header whose payload has not fully arrived is kept between calls.
#[derive(Debug, Default)]
pub struct FrameCodec {
    pending_header: Option<FrameHeader>,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.pending_header.take() {
            Some(header) => header,
            None => match FrameHeader::decode(src)? {
                Some(header) => header,
                None => return Ok(None),
            },
        };

        let len = header.payload_length as usize;
        if src.len() < len {
            src.reserve(len - src.len());
            self.pending_header = Some(header);
            return Ok(None);
        }

        let payload = src.split_to(len);
        let message: Message = bincode::deserialize(&payload)?;

        // Header and payload tags must agree
        if message.message_type() != header.message_type {
            return Err(ProtocolError::TypeMismatch {
                header: header.message_type,
                payload: message.message_type(),
            });
        }

        Ok(Some(Frame::new(header.stream_id, message)))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = bincode::serialize(&frame.message)?;
        let header =
            FrameHeader::for_payload(frame.stream_id, frame.message.message_type(), payload.len())?;

        dst.reserve(HEADER_SIZE + payload.len());
        header.encode(dst);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::MAX_PAYLOAD_SIZE;
    use crate::message::{ErrorCode, MessageType};
    use crate::report::{InstanceReport, NAME_LABEL};
    use bytes::{BufMut, Bytes};

    #[test]
    fn test_codec_report() {
        let mut codec = FrameCodec::new();

        let frame = Frame::new(
            StreamId::new(3),
            Message::Report {
                reports: vec![
                    InstanceReport::new("root", None),
                    InstanceReport::new("child", Some("root".to_string()))
                        .with_label(NAME_LABEL, "power"),
                ],
                alternative_endpoints: vec![],
            },
        );

        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_oversized_data_not_encoded() {
        let mut codec = FrameCodec::new();
        let frame = Frame::new(
            StreamId::new(42),
            Message::Data(Bytes::from(vec![0u8; MAX_PAYLOAD_SIZE])),
        );

        let mut buf = BytesMut::new();
        assert!(matches!(
            codec.encode(frame, &mut buf),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_partial_read() {
        let mut codec = FrameCodec::new();

        let frame = Frame::new(StreamId::new(1), Message::Heartbeat { timestamp: 12345 });

        let mut full_buf = BytesMut::new();
        codec.encode(frame, &mut full_buf).unwrap();

        let mut partial = full_buf.split_to(HEADER_SIZE - 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full_buf);

        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded.message, Message::Heartbeat { timestamp: 12345 });
    }

    #[test]
    fn test_codec_back_to_back_frames() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        codec
            .encode(Frame::new(StreamId::new(5), Message::StreamReady), &mut buf)
            .unwrap();
        codec
            .encode(
                Frame::new(
                    StreamId::new(5),
                    Message::error(ErrorCode::Transport, "connection reset"),
                ),
                &mut buf,
            )
            .unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.message, Message::StreamReady);
        assert!(matches!(
            second.message,
            Message::Error {
                code: ErrorCode::Transport,
                ..
            }
        ));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_codec_type_mismatch() {
        let mut codec = FrameCodec::new();
        let payload = bincode::serialize(&Message::StreamClose).unwrap();

        let mut buf = BytesMut::new();
        FrameHeader::new(StreamId::new(1), MessageType::Cancel, payload.len() as u32)
            .encode(&mut buf);
        buf.put_slice(&payload);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::TypeMismatch {
                header: MessageType::Cancel,
                payload: MessageType::StreamClose,
            })
        ));
    }
}
