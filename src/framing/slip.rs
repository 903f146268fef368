//! SLIP framing.
//!
//! The decoder is a resumable byte-at-a-time state machine so a frame split
//! across reads is reassembled, and noise before the first `END` is skipped.
//! An illegal escape drops only the frame it occurs in.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};

use super::Endec;
use crate::logging::hexdump;
use crate::{GdsError, Result};

pub const END: u8 = 0xC0;
pub const ESC: u8 = 0xDB;
pub const ESC_END: u8 = 0xDC;
pub const ESC_ESC: u8 = 0xDD;

/// Frames longer than this are dropped as runaway.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlipState {
    /// Skipping noise until the first `END`.
    #[default]
    AwaitFirstEnd,
    /// Between frames; repeated `END`s are ignored.
    AwaitFirstByteOrLeadingEnd,
    Started,
    /// Throwing away the rest of a broken frame up to its `END`.
    Discarding,
}

/// Streaming SLIP decoder.
#[derive(Debug, Default)]
pub struct SlipDecoder {
    state: SlipState,
    escaped: bool,
    buf: Vec<u8>,
    frames: u64,
    dropped: u64,
}

impl SlipDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SlipState {
        self.state
    }

    /// Frames dropped for escape violations or overruns.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Drops the frame being built. Unless the frame already ended, the
    /// bytes up to its closing `END` are discarded too.
    fn drop_frame(&mut self, reason: &str, ended: bool) {
        self.dropped += 1;
        warn!(
            correlation_id = self.frames,
            bytes = %hexdump(&self.buf),
            "Dropping SLIP frame: {reason}"
        );
        self.buf.clear();
        self.escaped = false;
        self.state = if ended { SlipState::AwaitFirstByteOrLeadingEnd } else { SlipState::Discarding };
    }

    /// Feeds one byte, returning a frame when it completes one.
    pub fn push(&mut self, byte: u8) -> Option<Vec<u8>> {
        match self.state {
            SlipState::AwaitFirstEnd => {
                if byte == END {
                    self.state = SlipState::AwaitFirstByteOrLeadingEnd;
                }
                None
            }
            SlipState::AwaitFirstByteOrLeadingEnd => {
                if byte == END {
                    return None;
                }
                self.state = SlipState::Started;
                self.push_started(byte)
            }
            SlipState::Started => self.push_started(byte),
            SlipState::Discarding => {
                if byte == END {
                    self.state = SlipState::AwaitFirstByteOrLeadingEnd;
                }
                None
            }
        }
    }

    fn push_started(&mut self, byte: u8) -> Option<Vec<u8>> {
        if self.escaped {
            self.escaped = false;
            match byte {
                ESC_END => self.buf.push(END),
                ESC_ESC => self.buf.push(ESC),
                other => {
                    self.drop_frame(&format!("illegal escape {ESC:#04x} {other:#04x}"), other == END);
                    return None;
                }
            }
        } else {
            match byte {
                END => {
                    self.state = SlipState::AwaitFirstByteOrLeadingEnd;
                    self.frames += 1;
                    trace!(len = self.buf.len(), "SLIP frame complete");
                    return Some(std::mem::take(&mut self.buf));
                }
                ESC => self.escaped = true,
                other => self.buf.push(other),
            }
        }
        if self.buf.len() > MAX_FRAME_LEN {
            self.drop_frame("frame exceeds maximum length", false);
        }
        None
    }

    /// Feeds a chunk, returning every frame it completes.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        bytes.iter().filter_map(|b| self.push(*b)).collect()
    }

    pub fn reset(&mut self) {
        self.state = SlipState::AwaitFirstEnd;
        self.escaped = false;
        self.buf.clear();
    }
}

/// Escapes `data` and wraps it in `END` bytes.
pub fn slip_encode(data: &[u8], out: &mut BytesMut) {
    out.reserve(data.len() + 2);
    out.put_u8(END);
    for byte in data {
        match *byte {
            END => out.put_slice(&[ESC, ESC_END]),
            ESC => out.put_slice(&[ESC, ESC_ESC]),
            other => out.put_u8(other),
        }
    }
    out.put_u8(END);
}

/// [`SlipDecoder`] as a `tokio_util` codec for framed byte streams.
#[derive(Debug, Default)]
pub struct SlipCodec {
    decoder: SlipDecoder,
}

impl SlipCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for SlipCodec {
    type Item = Vec<u8>;
    type Error = GdsError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        while src.has_remaining() {
            if let Some(frame) = self.decoder.push(src.get_u8()) {
                return Ok(Some(frame));
            }
        }
        Ok(None)
    }
}

impl Encoder<&[u8]> for SlipCodec {
    type Error = GdsError;

    fn encode(&mut self, item: &[u8], dst: &mut BytesMut) -> Result<()> {
        slip_encode(item, dst);
        Ok(())
    }
}

/// SLIP as a whole-frame layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct Slip;

impl Endec for Slip {
    fn name(&self) -> &'static str {
        "slip"
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = BytesMut::new();
        slip_encode(data, &mut out);
        Ok(out.to_vec())
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = SlipDecoder::new();
        // A lone frame may omit its leading END.
        decoder.state = SlipState::AwaitFirstByteOrLeadingEnd;
        let mut frames = decoder.feed(data).into_iter();
        match (frames.next(), frames.next()) {
            (Some(frame), None) => Ok(frame),
            (None, _) => Err(GdsError::framing("slip", "no complete frame")),
            (Some(_), Some(_)) => Err(GdsError::framing("slip", "more than one frame")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn resyncs_after_illegal_escape() {
        let stream = [0xC0, 0xDB, 0xDC, 0x42, 0xC0, 0xC0, 0xDB, 0xFF, 0xC0, 0xC0, 0x01, 0x02, 0x03, 0xC0];
        let mut decoder = SlipDecoder::new();
        let frames = decoder.feed(&stream);
        assert_eq!(frames, vec![vec![0xC0, 0x42], vec![0x01, 0x02, 0x03]]);
        assert_eq!(decoder.dropped(), 1);
    }

    #[test]
    fn rest_of_broken_frame_is_discarded() {
        let mut decoder = SlipDecoder::new();
        let frames = decoder.feed(&[0xC0, 0x01, 0xC0, 0x11, 0xDB, 0xFF, 0x22, 0x33, 0xC0, 0x44, 0xC0]);
        assert_eq!(frames, vec![vec![0x01], vec![0x44]]);
        assert_eq!(decoder.dropped(), 1);
    }

    #[test]
    fn escaped_end_closes_the_broken_frame() {
        let mut decoder = SlipDecoder::new();
        let frames = decoder.feed(&[0xC0, 0x11, 0xDB, 0xC0, 0x22, 0xC0]);
        assert_eq!(frames, vec![vec![0x22]]);
        assert_eq!(decoder.state(), SlipState::AwaitFirstByteOrLeadingEnd);
    }

    #[test]
    fn overrun_discards_up_to_end() {
        let mut decoder = SlipDecoder::new();
        let mut stream = vec![0xC0];
        stream.resize(MAX_FRAME_LEN + 10, 0x55);
        stream.extend_from_slice(&[0xC0, 0x01, 0xC0]);
        assert_eq!(decoder.feed(&stream), vec![vec![0x01]]);
        assert_eq!(decoder.dropped(), 1);
    }

    #[test]
    fn frames_span_reads() {
        let mut decoder = SlipDecoder::new();
        assert!(decoder.feed(&[0x99, 0xC0, 0x01, 0xDB]).is_empty());
        assert_eq!(decoder.state(), SlipState::Started);
        assert_eq!(decoder.feed(&[0xDD, 0x02, 0xC0]), vec![vec![0x01, 0xDB, 0x02]]);
    }

    #[test]
    fn noise_before_first_end_is_skipped() {
        let mut decoder = SlipDecoder::new();
        assert_eq!(decoder.feed(&[0x01, 0x02, 0xC0, 0x03, 0xC0]), vec![vec![0x03]]);
    }

    #[test]
    fn codec_decodes_stream() {
        let mut codec = SlipCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(&[0xC0, 0x01][..], &mut buf).unwrap();
        codec.encode(&[0x02][..], &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(vec![0xC0, 0x01]));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(vec![0x02]));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn whole_frame_layer() {
        let encoded = Slip.encode(&[1, 0xC0, 0xDB]).unwrap();
        assert_eq!(encoded, vec![0xC0, 1, 0xDB, 0xDC, 0xDB, 0xDD, 0xC0]);
        assert_eq!(Slip.decode(&encoded).unwrap(), vec![1, 0xC0, 0xDB]);
        assert!(Slip.decode(&[0xC0, 0xC0]).is_err());
    }

    proptest! {
        #[test]
        fn prop_frames_survive_noise_and_extra_ends(
            noise in prop::collection::vec(any::<u8>().prop_filter("no END", |b| *b != END), 0..16),
            messages in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..48), 0..8),
            extra_ends in prop::collection::vec(0usize..3, 8),
            chunk in 1usize..17,
        ) {
            let mut stream = BytesMut::from(&noise[..]);
            for (i, msg) in messages.iter().enumerate() {
                for _ in 0..extra_ends[i] {
                    stream.put_u8(END);
                }
                slip_encode(msg, &mut stream);
            }
            let mut decoder = SlipDecoder::new();
            let frames: Vec<Vec<u8>> = stream.chunks(chunk).flat_map(|c| decoder.feed(c)).collect();
            prop_assert_eq!(frames, messages);
        }

        #[test]
        fn prop_escape_violation_drops_only_its_frame(
            before in prop::collection::vec(any::<u8>(), 1..16),
            after in prop::collection::vec(any::<u8>(), 1..16),
            bad in any::<u8>().prop_filter("illegal", |b| ![ESC_END, ESC_ESC, END].contains(b)),
            trailing in prop::collection::vec(any::<u8>().prop_filter("no END", |b| *b != END), 0..16),
        ) {
            let mut stream = BytesMut::new();
            slip_encode(&before, &mut stream);
            stream.put_slice(&[END, 0x11, ESC, bad]);
            stream.put_slice(&trailing);
            stream.put_u8(END);
            slip_encode(&after, &mut stream);
            let mut decoder = SlipDecoder::new();
            let frames = decoder.feed(&stream);
            prop_assert_eq!(decoder.dropped(), 1);
            prop_assert_eq!(frames, vec![before, after]);
        }
    }
}
