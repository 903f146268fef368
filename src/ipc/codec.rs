//! Bus wire format.
//!
//! ```text
//! ┌────────────┬─────────────┬───────────────────────────────────┐
//! │ Magic (2B) │ Length (4B) │ Body (Length bytes)               │
//! │ "IR"       │ LE          │ <topic id> '|' <JSON envelope>    │
//! └────────────┴─────────────┴───────────────────────────────────┘
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::Topic;
use crate::{GdsError, Result};

pub const FRAME_MAGIC: [u8; 2] = *b"IR";

/// Magic plus length.
const HEADER_SIZE: usize = 6;

/// Largest body accepted: 16 MiB.
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

/// Separates the topic prefix from the envelope.
pub const TOPIC_SEPARATOR: u8 = b'|';

/// A frame body split into topic prefix and envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFrame {
    /// Raw topic prefix. Kept as bytes so unknown topics can still be logged.
    pub topic: Bytes,
    pub envelope: Bytes,
}

impl TopicFrame {
    pub fn new(topic: Topic, envelope: impl Into<Bytes>) -> Self {
        Self { topic: Bytes::from_static(topic.id().as_bytes()), envelope: envelope.into() }
    }

    /// Splits `body` at the first separator.
    pub fn parse(mut body: Bytes) -> Result<Self> {
        let sep = body
            .iter()
            .position(|b| *b == TOPIC_SEPARATOR)
            .ok_or_else(|| GdsError::framing("ipc", "frame body has no topic separator"))?;
        let topic = body.split_to(sep);
        body.advance(1);
        Ok(Self { topic, envelope: body })
    }

    pub fn known_topic(&self) -> Option<Topic> {
        Topic::from_id(&self.topic)
    }

    /// Whether this frame passes a subscription list. An empty list takes
    /// everything.
    pub fn matches(&self, topics: &[Topic]) -> bool {
        topics.is_empty() || topics.iter().any(|t| self.topic.starts_with(t.id().as_bytes()))
    }

    pub fn body_len(&self) -> usize {
        self.topic.len() + 1 + self.envelope.len()
    }

    pub fn write_body(&self, dst: &mut BytesMut) {
        dst.put_slice(&self.topic);
        dst.put_u8(TOPIC_SEPARATOR);
        dst.put_slice(&self.envelope);
    }
}

/// Length-prefixed codec for [`TopicFrame`]s.
#[derive(Debug, Clone, Copy)]
pub struct IpcCodec {
    max_frame: usize,
}

impl Default for IpcCodec {
    fn default() -> Self {
        Self { max_frame: DEFAULT_MAX_FRAME }
    }
}

impl IpcCodec {
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }
}

impl Decoder for IpcCodec {
    type Item = TopicFrame;
    type Error = GdsError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<TopicFrame>> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }
        if src[..2] != FRAME_MAGIC {
            return Err(GdsError::framing("ipc", format!("bad magic {:02X}{:02X}", src[0], src[1])));
        }
        let len = u32::from_le_bytes([src[2], src[3], src[4], src[5]]) as usize;
        if len > self.max_frame {
            return Err(GdsError::framing("ipc", format!("frame of {len} bytes exceeds {}", self.max_frame)));
        }
        if src.len() < HEADER_SIZE + len {
            src.reserve(HEADER_SIZE + len - src.len());
            return Ok(None);
        }
        src.advance(HEADER_SIZE);
        TopicFrame::parse(src.split_to(len).freeze()).map(Some)
    }
}

impl Encoder<TopicFrame> for IpcCodec {
    type Error = GdsError;

    fn encode(&mut self, frame: TopicFrame, dst: &mut BytesMut) -> Result<()> {
        let len = frame.body_len();
        if len > self.max_frame {
            return Err(GdsError::framing("ipc", format!("frame of {len} bytes exceeds {}", self.max_frame)));
        }
        dst.reserve(HEADER_SIZE + len);
        dst.put_slice(&FRAME_MAGIC);
        dst.put_u32_le(len as u32);
        frame.write_body(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(frame: TopicFrame) -> BytesMut {
        let mut buf = BytesMut::new();
        IpcCodec::default().encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn frames_survive_partial_reads() {
        let mut wire = encode(TopicFrame::new(Topic::DlPayloads, &b"{\"a\":1}"[..]));
        wire.extend_from_slice(&encode(TopicFrame::new(Topic::UlPacket, &b"{}"[..])));

        let mut codec = IpcCodec::default();
        let mut buf = BytesMut::new();
        let mut frames = Vec::new();
        for byte in wire {
            buf.put_u8(byte);
            if let Some(frame) = codec.decode(&mut buf).unwrap() {
                frames.push(frame);
            }
        }
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].known_topic(), Some(Topic::DlPayloads));
        assert_eq!(frames[0].envelope.as_ref(), b"{\"a\":1}");
        assert_eq!(frames[1].known_topic(), Some(Topic::UlPacket));
        assert!(buf.is_empty());
    }

    #[test]
    fn rejects_bad_magic_and_oversize() {
        let mut buf = BytesMut::from(&b"XX\x00\x00\x00\x00"[..]);
        assert!(matches!(IpcCodec::default().decode(&mut buf), Err(GdsError::Framing { .. })));

        let mut buf = encode(TopicFrame::new(Topic::DlPackets, vec![0u8; 64]));
        assert!(IpcCodec::new(8).decode(&mut buf).is_err());
    }

    #[test]
    fn body_without_separator_is_refused() {
        let mut buf = BytesMut::new();
        buf.put_slice(&FRAME_MAGIC);
        buf.put_u32_le(3);
        buf.put_slice(b"abc");
        assert!(IpcCodec::default().decode(&mut buf).is_err());
    }

    #[test]
    fn subscription_filters_by_prefix() {
        let frame = TopicFrame::new(Topic::DlPackets, &b"{}"[..]);
        assert!(frame.matches(&[]));
        assert!(frame.matches(&[Topic::UlPacket, Topic::DlPackets]));
        assert!(!frame.matches(&[Topic::DlPayloads]));
    }
}
